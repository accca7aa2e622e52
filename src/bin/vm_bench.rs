//! Benchmark for the software page-table MMU: a matrix-multiply
//! workload over a configurable matrix size.
//!
//! Allocates three `n x n` `i32` matrices through `t_malloc`, fills two
//! of them through `put_value`, drives `mat_mult` end to end through
//! `get_value`/`put_value`, and reports the TLB miss rate to stderr.

use clap::Parser;

use ossim::vm::Translator;

/// Exercise the VM translator with a matrix-multiply workload.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Side length of the square matrices to multiply.
    #[arg(short, long, default_value_t = 16)]
    n: u32,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let n = args.n;

    let mut t = Translator::new();
    let bytes = n * n * std::mem::size_of::<i32>() as u32;

    let va_a = t.t_malloc(bytes).expect("matrix A allocation should not fail");
    let va_b = t.t_malloc(bytes).expect("matrix B allocation should not fail");
    let va_c = t.t_malloc(bytes).expect("matrix C allocation should not fail");
    log::info!("allocated three {n}x{n} matrices at va_a={va_a:#x} va_b={va_b:#x} va_c={va_c:#x}");

    for i in 0..(n * n) {
        let a_val = (i % 7) as i32;
        let b_val = (i % 5) as i32;
        t.put_value(va_a + u64::from(i) * 4, &a_val.to_ne_bytes());
        t.put_value(va_b + u64::from(i) * 4, &b_val.to_ne_bytes());
    }

    t.mat_mult(va_a, va_b, n, va_c);

    let mut checksum: i64 = 0;
    for i in 0..(n * n) {
        let mut buf = [0u8; 4];
        t.get_value(va_c + u64::from(i) * 4, &mut buf);
        checksum += i64::from(i32::from_ne_bytes(buf));
    }
    println!("C checksum: {checksum}");

    eprintln!("TLB miss rate {:.6}", t.tlb_miss_rate());
}
