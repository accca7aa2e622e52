//! User-level simulators of five classic OS kernel mechanisms: a heap
//! allocator, a page-table MMU, a preemptive thread runtime, a
//! set-associative cache, and a small inode file system.

pub mod allocator;
pub mod cache;
pub mod error;
pub mod fs;
pub mod threads;
pub mod vm;

pub use error::{Error, Result};
