//! Host-side reference kernels backing the CPU device path.

pub mod kernels;

pub use kernels::*;
