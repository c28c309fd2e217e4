use std::sync::Arc;

use anyhow::Result;
use wgpu::{
    Adapter, DeviceDescriptor, Features, Instance, InstanceDescriptor, Limits, PowerPreference,
    RequestAdapterOptions,
};

/// Relevant device limits captured at context creation.
#[derive(Debug, Clone)]
pub struct GpuMemoryInfo {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u32,
}

impl GpuMemoryInfo {
    pub fn print_summary(&self) {
        log::debug!(
            "gpu memory: max_buffer={:.2}GB, max_binding={:.2}GB",
            self.max_buffer_size as f64 / 1_073_741_824.0,
            self.max_storage_buffer_binding_size as f64 / 1_073_741_824.0
        );
    }
}

/// Shared handle to the compute stream: adapter, device and queue.
///
/// One context may be shared by several models; command submission order on
/// the queue is the only in-order guarantee the runtime relies on.
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter: Adapter,
    pub memory_info: GpuMemoryInfo,
}

impl WgpuContext {
    pub async fn new() -> Result<Arc<Self>> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;

        let info = adapter.get_info();
        log::info!(
            "selected adapter: {} ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );

        let adapter_limits = adapter.limits();
        let memory_info = GpuMemoryInfo {
            max_buffer_size: adapter_limits.max_buffer_size,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
        };
        memory_info.print_summary();

        let required_limits = Limits {
            max_buffer_size: memory_info.max_buffer_size,
            max_storage_buffer_binding_size: memory_info.max_storage_buffer_binding_size,
            ..Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("vefur_runtime"),
                required_features: Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await?;

        log::info!(
            "device initialized: max_buffer={:.2}GB",
            memory_info.max_buffer_size as f64 / 1_073_741_824.0
        );

        Ok(Arc::new(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
            memory_info,
        }))
    }

    /// Blocks until all previously submitted work has completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait())
            .map_err(|e| anyhow::anyhow!("device poll failed: {e:?}"))?;
        Ok(())
    }
}
