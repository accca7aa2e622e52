//! Demo worker-thread benchmark for the preemptive thread runtime, with
//! the scheduling policy and worker count selectable as flags instead
//! of compile-time macros.
//!
//! Spawns `--workers` CPU-bound worker threads under the chosen policy,
//! joins them all, and prints the stderr stats line for the runtime:
//! total context switches, average turnaround, average response.

use clap::{Parser, ValueEnum};

use ossim::threads::{self, Policy as RtPolicy};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Policy {
    Psjf,
    Mlfq,
}

impl From<Policy> for RtPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Psjf => RtPolicy::Psjf,
            Policy::Mlfq => RtPolicy::Mlfq,
        }
    }
}

/// Run a worker-thread benchmark under the user-level thread runtime.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scheduling discipline to run the workers under.
    #[arg(short, long, value_enum, default_value_t = Policy::Psjf)]
    policy: Policy,

    /// Number of worker threads to spawn.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Units of CPU-bound work each worker performs, scaled by its index
    /// (worker 0 does the least, matching a classic PSJF demo where one
    /// thread is short and the others are comparatively long).
    #[arg(short = 'u', long, default_value_t = 200_000)]
    unit_work: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let policy: RtPolicy = args.policy.into();

    log::info!("spawning {} workers under {:?}", args.workers, args.policy);
    let mut ids = Vec::with_capacity(args.workers);
    for w in 0..args.workers {
        let work_units = args.unit_work * (w as u64 + 1);
        let tid = threads::create(policy, move || {
            let mut acc: u64 = 0;
            for i in 0..work_units {
                acc = acc.wrapping_add(i);
                if i % 4096 == 0 {
                    threads::yield_now();
                }
            }
            acc as usize
        });
        ids.push(tid);
    }

    for tid in ids {
        threads::join(tid);
    }

    threads::print_stats();
}
