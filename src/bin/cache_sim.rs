//! Set-associative cache simulator CLI.
//!
//! Grammar (fixed positional tokens rather than a conventional
//! `--flag value` shape, to match the format its trace-file companions
//! expect):
//!
//!   cache_sim <cache_size> assoc:<N> <policy> <block_size> \
//!             [<l2_size> assoc:<N> <l2_policy>] <trace_file>
//!
//! `<policy>`/`<l2_policy>` are any string; only `"lru"` (case
//! insensitive) is recognized, anything else silently behaves as FIFO.

use std::fs;

use clap::Parser;

use ossim::cache::{run_trace_single, run_trace_two_level, Cache, ReplacementPolicy, TwoLevelCache};

/// Single- or two-level set-associative cache simulator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(
    override_usage = "cache_sim <cache_size> assoc:<N> <policy> <block_size> [<l2_size> assoc:<N> <l2_policy>] <trace_file>"
)]
struct Args {
    /// Positional tokens, parsed by hand below to match the exact
    /// external grammar (which embeds `assoc:<N>` as a single token).
    /// Either 5 tokens (single-level: size, assoc, policy, block_size,
    /// trace_file) or 8 (two-level: the same four plus l2_size, l2
    /// assoc, l2_policy, trace_file).
    #[arg(num_args = 5..=8)]
    tokens: Vec<String>,
}

fn parse_assoc(tok: &str) -> usize {
    tok.strip_prefix("assoc:")
        .unwrap_or_else(|| panic!("expected assoc:<N>, got {tok}"))
        .parse()
        .expect("assoc:<N> must be numeric")
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let t = &args.tokens;

    let l1_size: usize = t[0].parse().expect("cache_size must be numeric");
    let l1_assoc = parse_assoc(&t[1]);
    let l1_policy = ReplacementPolicy::parse(&t[2]);
    let l1_block: usize = t[3].parse().expect("block_size must be numeric");

    assert!(
        t.len() == 5 || t.len() == 8,
        "expected 5 tokens (single-level) or 8 (two-level), got {}",
        t.len()
    );
    let (trace_path, l2): (&str, Option<(usize, usize, ReplacementPolicy)>) = if t.len() == 8 {
        let l2_size: usize = t[4].parse().expect("l2_size must be numeric");
        let l2_assoc = parse_assoc(&t[5]);
        let l2_policy = ReplacementPolicy::parse(&t[6]);
        (&t[7], Some((l2_size, l2_assoc, l2_policy)))
    } else {
        (&t[4], None)
    };

    let trace = fs::read_to_string(trace_path)
        .unwrap_or_else(|e| panic!("failed to read trace file {trace_path}: {e}"));

    match l2 {
        None => {
            let mut cache = Cache::new(l1_size, l1_assoc, l1_block, l1_policy);
            run_trace_single(&mut cache, &trace);
            let s = cache.stats();
            // `memread` is the count of misses (each one drives a memory
            // read to fetch the missing block), not the count of `R`
            // trace lines; `memwrite` is every `W` line regardless of
            // hit/miss, which is exactly `s.writes`.
            println!("memread:{}", s.misses);
            println!("memwrite:{}", s.writes);
            println!("cachehit:{}", s.hits);
            println!("cachemiss:{}", s.misses);
        }
        Some((l2_size, l2_assoc, l2_policy)) => {
            let l1 = Cache::new(l1_size, l1_assoc, l1_block, l1_policy);
            let l2 = Cache::new(l2_size, l2_assoc, l1_block, l2_policy);
            let mut hier = TwoLevelCache::new(l1, l2);
            run_trace_two_level(&mut hier, &trace);
            let l1s = hier.l1_stats();
            let l2s = hier.l2_stats();
            // A single global `memread`/`memwrite` pair, not per-level:
            // `memread` only counts an access that misses *both* levels
            // (`l2s.misses`), and `memwrite` counts every `W` trace line,
            // which L1 sees on every access regardless of level
            // (`l1s.writes`).
            println!("memread:{}", l2s.misses);
            println!("memwrite:{}", l1s.writes);
            println!("l1cachehit:{}", l1s.hits);
            println!("l1cachemiss:{}", l1s.misses);
            println!("l2cachehit:{}", l2s.hits);
            println!("l2cachemiss:{}", l2s.misses);
        }
    }
}
