//! Per-graph execution context: device selection and the build/inference
//! phase machine.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gpu::WgpuContext;

/// Where the graph's buffers live and its kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Wgpu,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Wgpu)
    }
}

/// Lifecycle phase of a graph.
///
/// All device allocation happens while `Building`; the transition to `Built`
/// occurs exactly once, after which only per-step shape metadata may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Built,
}

/// Execution context owned by the host application and handed into model
/// construction. There is no process-wide singleton; the compute-stream
/// handle (`WgpuContext`) may be shared between contexts, the phase machine
/// is per-graph.
pub struct GraphContext {
    device: Device,
    gpu: Option<Arc<WgpuContext>>,
    phase: Phase,
}

impl GraphContext {
    /// Creates a context in the `Building` phase.
    pub fn new(device: Device, gpu: Option<Arc<WgpuContext>>) -> Result<Self> {
        if device.is_gpu() && gpu.is_none() {
            return Err(Error::config(
                "Device::Wgpu requires a WgpuContext compute-stream handle",
            ));
        }
        Ok(Self {
            device,
            gpu,
            phase: Phase::Building,
        })
    }

    pub fn for_cpu() -> Self {
        Self {
            device: Device::Cpu,
            gpu: None,
            phase: Phase::Building,
        }
    }

    pub fn for_gpu(gpu: Arc<WgpuContext>) -> Self {
        Self {
            device: Device::Wgpu,
            gpu: Some(gpu),
            phase: Phase::Building,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn gpu(&self) -> Option<&Arc<WgpuContext>> {
        self.gpu.as_ref()
    }

    pub fn is_built(&self) -> bool {
        self.phase == Phase::Built
    }

    /// Fails unless the graph is still building. Called by every allocation.
    pub fn ensure_building(&self) -> Result<()> {
        if self.phase != Phase::Building {
            return Err(Error::Phase(
                "device allocation attempted after the graph was built".into(),
            ));
        }
        Ok(())
    }

    /// Flips the phase to `Built`. A second flip on the same context means a
    /// second graph is being assembled over live buffers, which is fatal.
    pub fn finish_build(&mut self) -> Result<()> {
        if self.phase == Phase::Built {
            return Err(Error::config(
                "graph was already built; a context drives exactly one build",
            ));
        }
        self.phase = Phase::Built;
        Ok(())
    }

    /// Blocks until all previously issued device work has completed.
    pub fn synchronize(&self) -> Result<()> {
        if let Some(gpu) = &self.gpu {
            gpu.wait_idle()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions_once() {
        let mut ctx = GraphContext::for_cpu();
        assert!(!ctx.is_built());
        assert!(ctx.ensure_building().is_ok());

        ctx.finish_build().unwrap();
        assert!(ctx.is_built());
        assert!(matches!(ctx.ensure_building(), Err(Error::Phase(_))));

        // Second transition is a configuration error.
        assert!(matches!(ctx.finish_build(), Err(Error::Config(_))));
    }

    #[test]
    fn test_gpu_device_requires_stream_handle() {
        assert!(GraphContext::new(Device::Wgpu, None).is_err());
        assert!(GraphContext::new(Device::Cpu, None).is_ok());
    }
}
