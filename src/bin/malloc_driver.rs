//! Driver for the boundary-tag heap allocator, with the fit policy
//! selectable as a flag instead of a compile-time constant.
//!
//! Allocates blocks of increasing size, grows each one with `resize`,
//! then frees them all, running the invariant checker after every step.

use clap::{Parser, ValueEnum};

use ossim::allocator::{FitPolicy, Heap};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Policy {
    First,
    Next,
    Best,
}

impl From<Policy> for FitPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::First => FitPolicy::First,
            Policy::Next => FitPolicy::Next,
            Policy::Best => FitPolicy::Best,
        }
    }
}

/// Exercise the heap allocator with a small scripted trace.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fit policy to drive the heap with.
    #[arg(short, long, value_enum, default_value_t = Policy::First)]
    policy: Policy,

    /// Number of blocks to allocate/resize/free in the scripted trace.
    #[arg(short, long, default_value_t = 10)]
    count: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut heap = Heap::new(args.policy.into());
    log::info!("init with policy {:?}", args.policy);
    heap.check().expect("heap invariants hold after init");

    let mut blocks = Vec::with_capacity(args.count as usize);
    for i in 1..=args.count {
        let size = i * std::mem::size_of::<i32>() as u32;
        let bp = heap.allocate(size).expect("allocation should not fail this early");
        log::debug!("malloc {i} -> bp={bp} size={size}");
        heap.check().expect("heap invariants hold after allocate");
        blocks.push(bp);
    }

    for (i, bp) in blocks.iter_mut().enumerate() {
        let n = (i + 1) as u32;
        let new_size = 2 * n * std::mem::size_of::<i32>() as u32;
        *bp = heap.resize(Some(*bp), new_size).expect("resize should not fail this early");
        log::debug!("realloc {n} -> bp={bp}", bp = *bp);
        heap.check().expect("heap invariants hold after resize");
    }

    for (i, bp) in blocks.into_iter().enumerate() {
        log::debug!("free {}", i + 1);
        heap.free(Some(bp));
        heap.check().expect("heap invariants hold after free");
    }

    println!("free list length after full free/realloc/free cycle: {}", heap.free_list_len());
}
