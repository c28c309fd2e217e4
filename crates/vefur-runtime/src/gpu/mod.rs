//! wgpu compute backend: the shared stream context and the kernel catalog.

pub mod context;
pub mod kernels;

pub use context::{GpuMemoryInfo, WgpuContext};
