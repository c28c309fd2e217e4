//! Causal attention kernel reading the KV caches.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::gpu::kernels::{compile_pipeline, storage_entry, uniform_entry};
use crate::gpu::WgpuContext;

/// Matches `MAX_HEAD_DIM` in attention.wgsl.
pub const MAX_HEAD_DIM: usize = 128;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct AttentionUniforms {
    seq_len: u32,
    heads: u32,
    head_dim: u32,
    hidden: u32,
    pos_start: u32,
    max_step: u32,
    scale: f32,
    total: u32,
}

pub struct GpuAttention {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    context: Arc<WgpuContext>,
}

impl GpuAttention {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let (pipeline, bind_group_layout) = compile_pipeline(
            context,
            "attention",
            wgpu::include_wgsl!("attention.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
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
        output: &wgpu::Buffer,
        rows: usize,
        seq_len: usize,
        heads: usize,
        head_dim: usize,
        pos_start: usize,
        max_step: usize,
    ) {
        assert!(
            head_dim <= MAX_HEAD_DIM,
            "head_dim {} exceeds kernel limit {}",
            head_dim,
            MAX_HEAD_DIM
        );

        let uniforms = AttentionUniforms {
            seq_len: seq_len as u32,
            heads: heads as u32,
            head_dim: head_dim as u32,
            hidden: (heads * head_dim) as u32,
            pos_start: pos_start as u32,
            max_step: max_step as u32,
            scale: 1.0 / (head_dim as f32).sqrt(),
            total: (rows * heads * seq_len) as u32,
        };
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("attention uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("attention bind group"),
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
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: output.as_entire_binding(),
                    },
                ],
            });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("attention pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(uniforms.total.div_ceil(64), 1, 1);
    }
}
