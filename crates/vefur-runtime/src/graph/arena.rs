//! Fixed-capacity buffer arena.
//!
//! Every device buffer the runtime touches is allocated here once, at the
//! largest size it will ever need, and addressed by handle afterwards.
//! Variables refer to arena buffers by [`BufferId`]; swapping two Variables
//! exchanges handles, never data.

use std::sync::Arc;

use anyhow::anyhow;
use wgpu::{BufferDescriptor, BufferUsages};

use crate::error::{Error, Result};
use crate::gpu::WgpuContext;
use crate::graph::context::Device;
use crate::tensor::DType;

/// Handle to one arena buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

enum Storage {
    Host(Vec<u8>),
    Device(wgpu::Buffer),
}

struct ArenaBuffer {
    label: String,
    dtype: DType,
    /// Capacity in elements, fixed at allocation time.
    capacity: usize,
    storage: Storage,
}

/// Owns every buffer in a graph. Capacities never change after allocation.
pub struct BufferArena {
    device: Device,
    gpu: Option<Arc<WgpuContext>>,
    buffers: Vec<ArenaBuffer>,
}

impl BufferArena {
    pub fn new(device: Device, gpu: Option<Arc<WgpuContext>>) -> Self {
        Self {
            device,
            gpu,
            buffers: Vec::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total bytes held by the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.buffers
            .iter()
            .map(|b| b.capacity * b.dtype.size_of())
            .sum()
    }

    /// Allocates a buffer of `capacity` elements.
    pub fn alloc(&mut self, label: &str, dtype: DType, capacity: usize) -> Result<BufferId> {
        let bytes = dtype.buffer_size_for_capacity(capacity)?;

        let storage = match self.device {
            Device::Cpu => Storage::Host(vec![0u8; bytes]),
            Device::Wgpu => {
                let gpu = self.gpu()?;
                if bytes as u64 > gpu.memory_info.max_buffer_size {
                    return Err(Error::resource(format!(
                        "buffer '{}' ({} bytes) exceeds device max buffer size ({})",
                        label, bytes, gpu.memory_info.max_buffer_size
                    )));
                }
                let buffer = gpu.device.create_buffer(&BufferDescriptor {
                    label: Some(label),
                    size: bytes as u64,
                    usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                Storage::Device(buffer)
            }
        };

        log::debug!(
            "arena alloc '{}': {} x {} ({} bytes)",
            label,
            capacity,
            dtype,
            bytes
        );

        self.buffers.push(ArenaBuffer {
            label: label.to_string(),
            dtype,
            capacity,
            storage,
        });
        Ok(BufferId(self.buffers.len() - 1))
    }

    fn gpu(&self) -> Result<&Arc<WgpuContext>> {
        self.gpu
            .as_ref()
            .ok_or_else(|| Error::config("arena has no gpu context"))
    }

    fn buffer(&self, id: BufferId) -> &ArenaBuffer {
        &self.buffers[id.0]
    }

    pub fn capacity(&self, id: BufferId) -> usize {
        self.buffer(id).capacity
    }

    pub fn dtype(&self, id: BufferId) -> DType {
        self.buffer(id).dtype
    }

    pub fn label(&self, id: BufferId) -> &str {
        &self.buffer(id).label
    }

    /// The wgpu buffer backing `id`. Only valid on `Device::Wgpu`.
    pub fn wgpu_buffer(&self, id: BufferId) -> &wgpu::Buffer {
        match &self.buffer(id).storage {
            Storage::Device(b) => b,
            Storage::Host(_) => panic!("wgpu_buffer called on a host buffer"),
        }
    }

    /// Writes raw bytes at an element offset.
    pub fn write_bytes(&mut self, id: BufferId, elem_offset: usize, bytes: &[u8]) -> Result<()> {
        let buf = &self.buffers[id.0];
        let elem_size = buf.dtype.size_of();
        let end = elem_offset * elem_size + bytes.len();
        if end > buf.capacity * elem_size {
            return Err(Error::resource(format!(
                "write of {} bytes at element {} overruns buffer '{}' ({} elements)",
                bytes.len(),
                elem_offset,
                buf.label,
                buf.capacity
            )));
        }

        let byte_offset = elem_offset * elem_size;
        match &mut self.buffers[id.0].storage {
            Storage::Host(data) => {
                data[byte_offset..byte_offset + bytes.len()].copy_from_slice(bytes);
            }
            Storage::Device(buffer) => {
                let gpu = self
                    .gpu
                    .as_ref()
                    .expect("device buffer without gpu context");
                gpu.queue.write_buffer(buffer, byte_offset as u64, bytes);
            }
        }
        Ok(())
    }

    pub fn write_f32(&mut self, id: BufferId, elem_offset: usize, data: &[f32]) -> Result<()> {
        match self.dtype(id) {
            DType::F32 => self.write_bytes(id, elem_offset, bytemuck::cast_slice(data)),
            DType::F16 => {
                let halves: Vec<u16> = data
                    .iter()
                    .map(|&v| half::f16::from_f32(v).to_bits())
                    .collect();
                self.write_bytes(id, elem_offset, bytemuck::cast_slice(&halves))
            }
            other => Err(Error::config(format!(
                "cannot write f32 data into a {} buffer",
                other
            ))),
        }
    }

    pub fn write_u32(&mut self, id: BufferId, elem_offset: usize, data: &[u32]) -> Result<()> {
        if self.dtype(id) != DType::U32 {
            return Err(Error::config(format!(
                "cannot write u32 data into a {} buffer",
                self.dtype(id)
            )));
        }
        self.write_bytes(id, elem_offset, bytemuck::cast_slice(data))
    }

    /// Synchronous read of host-resident storage. Fails on device buffers;
    /// the CPU operator kernels are its only callers.
    pub fn host_bytes(&self, id: BufferId, len: usize) -> Result<&[u8]> {
        let buf = self.buffer(id);
        if len > buf.capacity {
            return Err(Error::resource(format!(
                "read of {} elements overruns buffer '{}' ({} elements)",
                len, buf.label, buf.capacity
            )));
        }
        match &buf.storage {
            Storage::Host(data) => Ok(&data[..len * buf.dtype.size_of()]),
            Storage::Device(_) => Err(Error::config(format!(
                "buffer '{}' is device-resident; use the async readback path",
                buf.label
            ))),
        }
    }

    pub fn host_f32(&self, id: BufferId, len: usize) -> Result<Vec<f32>> {
        if self.dtype(id) != DType::F32 {
            return Err(Error::config(format!(
                "cannot read f32 data from a {} buffer",
                self.dtype(id)
            )));
        }
        Ok(bytemuck::cast_slice(self.host_bytes(id, len)?).to_vec())
    }

    pub fn host_u32(&self, id: BufferId, len: usize) -> Result<Vec<u32>> {
        if self.dtype(id) != DType::U32 {
            return Err(Error::config(format!(
                "cannot read u32 data from a {} buffer",
                self.dtype(id)
            )));
        }
        Ok(bytemuck::cast_slice(self.host_bytes(id, len)?).to_vec())
    }

    /// Reads the first `len` elements back to the host.
    pub async fn read_bytes(&self, id: BufferId, len: usize) -> Result<Vec<u8>> {
        let buf = self.buffer(id);
        if len > buf.capacity {
            return Err(Error::resource(format!(
                "read of {} elements overruns buffer '{}' ({} elements)",
                len, buf.label, buf.capacity
            )));
        }
        let byte_len = len * buf.dtype.size_of();

        match &buf.storage {
            Storage::Host(data) => Ok(data[..byte_len].to_vec()),
            Storage::Device(buffer) => {
                let gpu = self.gpu()?;
                self.readback(gpu, buffer, byte_len as u64).await
            }
        }
    }

    async fn readback(
        &self,
        gpu: &Arc<WgpuContext>,
        buffer: &wgpu::Buffer,
        byte_len: u64,
    ) -> Result<Vec<u8>> {
        let staging = gpu.device.create_buffer(&BufferDescriptor {
            label: Some("staging readback buffer"),
            size: byte_len,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, byte_len);
        gpu.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        gpu.wait_idle()?;

        rx.receive()
            .await
            .ok_or_else(|| anyhow!("readback channel closed"))?
            .map_err(|e| anyhow!("buffer map failed: {e:?}"))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    pub async fn read_f32(&self, id: BufferId, len: usize) -> Result<Vec<f32>> {
        let bytes = self.read_bytes(id, len).await?;
        match self.dtype(id) {
            DType::F32 => Ok(bytemuck::cast_slice(&bytes).to_vec()),
            DType::F16 => {
                let halves: &[u16] = bytemuck::cast_slice(&bytes);
                Ok(halves
                    .iter()
                    .map(|&bits| half::f16::from_bits(bits).to_f32())
                    .collect())
            }
            other => Err(Error::config(format!(
                "cannot read f32 data from a {} buffer",
                other
            ))),
        }
    }

    pub async fn read_u32(&self, id: BufferId, len: usize) -> Result<Vec<u32>> {
        if self.dtype(id) != DType::U32 {
            return Err(Error::config(format!(
                "cannot read u32 data from a {} buffer",
                self.dtype(id)
            )));
        }
        let bytes = self.read_bytes(id, len).await?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_arena() -> BufferArena {
        BufferArena::new(Device::Cpu, None)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let mut arena = cpu_arena();
        let id = arena.alloc("test", DType::F32, 8).unwrap();

        arena.write_f32(id, 0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let back = arena.read_f32(id, 4).await.unwrap();
        assert_eq!(back, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_write_at_offset() {
        let mut arena = cpu_arena();
        let id = arena.alloc("test", DType::U32, 6).unwrap();

        arena.write_u32(id, 2, &[7, 8]).unwrap();
        let back = arena.read_u32(id, 6).await.unwrap();
        assert_eq!(back, vec![0, 0, 7, 8, 0, 0]);
    }

    #[test]
    fn test_write_overrun_rejected() {
        let mut arena = cpu_arena();
        let id = arena.alloc("test", DType::F32, 4).unwrap();

        let result = arena.write_f32(id, 2, &[0.0; 4]);
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut arena = cpu_arena();
        assert!(arena.alloc("empty", DType::F32, 0).is_err());
    }

    #[test]
    fn test_dtype_mismatch_rejected() {
        let mut arena = cpu_arena();
        let id = arena.alloc("ids", DType::U32, 4).unwrap();
        assert!(arena.write_f32(id, 0, &[1.0]).is_err());
    }

    #[tokio::test]
    async fn test_f16_roundtrip_conversion() {
        let mut arena = cpu_arena();
        let id = arena.alloc("half", DType::F16, 4).unwrap();

        arena.write_f32(id, 0, &[0.5, -1.25, 2.0, 0.0]).unwrap();
        let back = arena.read_f32(id, 4).await.unwrap();
        assert_eq!(back, vec![0.5, -1.25, 2.0, 0.0]);
    }

    #[test]
    fn test_allocated_bytes() {
        let mut arena = cpu_arena();
        arena.alloc("a", DType::F32, 8).unwrap();
        arena.alloc("b", DType::F16, 8).unwrap();
        assert_eq!(arena.allocated_bytes(), 32 + 16);
    }
}
