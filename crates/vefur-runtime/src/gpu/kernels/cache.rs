//! KV-cache kernels: the per-step store and the beam-search reorder gather.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::gpu::kernels::{compile_pipeline, dispatch_size, storage_entry, uniform_entry};
use crate::gpu::WgpuContext;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct StoreUniforms {
    seq_len: u32,
    heads: u32,
    head_dim: u32,
    hidden: u32,
    pos_start: u32,
    max_step: u32,
    total: u32,
}

pub struct GpuCacheStore {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    context: Arc<WgpuContext>,
}

impl GpuCacheStore {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let (pipeline, bind_group_layout) = compile_pipeline(
            context,
            "cache store",
            wgpu::include_wgsl!("cache_store.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
            ],
        );
        Self {
            pipeline: Arc::new(pipeline),
            bind_group_layout: Arc::new(bind_group_layout),
            context: context.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        qkv: &wgpu::Buffer,
        cache_k: &wgpu::Buffer,
        cache_v: &wgpu::Buffer,
        rows: usize,
        seq_len: usize,
        heads: usize,
        head_dim: usize,
        pos_start: usize,
        max_step: usize,
    ) {
        assert!(pos_start + seq_len <= max_step, "cache store out of range");

        let hidden = heads * head_dim;
        let uniforms = StoreUniforms {
            seq_len: seq_len as u32,
            heads: heads as u32,
            head_dim: head_dim as u32,
            hidden: hidden as u32,
            pos_start: pos_start as u32,
            max_step: max_step as u32,
            total: (rows * seq_len * hidden) as u32,
        };
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("cache store uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cache store bind group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: qkv.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: cache_k.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: cache_v.as_entire_binding(),
                    },
                ],
            });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("cache store pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch_size(uniforms.total), 1, 1);
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ReorderUniforms {
    heads: u32,
    seq_len: u32,
    max_step: u32,
    head_dim: u32,
    total: u32,
}

/// Gather of surviving beams' cache rows into a scratch cache buffer. The
/// caller swaps scratch and live buffers afterwards.
pub struct GpuReorderCache {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    context: Arc<WgpuContext>,
}

impl GpuReorderCache {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let (pipeline, bind_group_layout) = compile_pipeline(
            context,
            "cache reorder",
            wgpu::include_wgsl!("cache_reorder.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, true),
            ],
        );
        Self {
            pipeline: Arc::new(pipeline),
            bind_group_layout: Arc::new(bind_group_layout),
            context: context.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        indices: &wgpu::Buffer,
        rows: usize,
        heads: usize,
        seq_len: usize,
        max_step: usize,
        head_dim: usize,
    ) {
        assert!(seq_len > 0, "cannot reorder an empty cache");

        let uniforms = ReorderUniforms {
            heads: heads as u32,
            seq_len: seq_len as u32,
            max_step: max_step as u32,
            head_dim: head_dim as u32,
            total: (rows * heads * seq_len * head_dim) as u32,
        };
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("cache reorder uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("cache reorder bind group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: dst.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: indices.as_entire_binding(),
                    },
                ],
            });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("cache reorder pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch_size(uniforms.total), 1, 1);
    }
}
