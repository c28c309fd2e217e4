//! Element types shared by host and device tensors.

pub mod dtype;

pub use dtype::DType;
