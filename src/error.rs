//! Crate-wide error type.
//!
//! Most of the simulators in this crate follow the convention their C
//! originals used: a failed operation returns `null`/`None`/`false` and
//! leaves state untouched, rather than raising an error. `Error` exists
//! for the thin CLI layer in `src/bin/`, and for the handful of
//! conditions that are really the caller's bug (unknown thread id, heap
//! corruption) rather than a recoverable runtime failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("address is not currently allocated")]
    InvalidAddress,

    #[error("page table entry is already mapped")]
    AlreadyMapped,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown thread id {0}")]
    UnknownThread(usize),

    #[error("heap corruption detected: {0}")]
    HeapCorruption(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
