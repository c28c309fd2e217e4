//! Embedding lookup kernel: token ids to dense hidden states, with learned
//! position embeddings added in the same pass.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::gpu::kernels::{compile_pipeline, dispatch_size, storage_entry, uniform_entry};
use crate::gpu::WgpuContext;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct LookupUniforms {
    seq_len: u32,
    hidden: u32,
    pos_start: u32,
    max_step: u32,
    total: u32,
}

pub struct GpuLookup {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    context: Arc<WgpuContext>,
}

impl GpuLookup {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let (pipeline, bind_group_layout) = compile_pipeline(
            context,
            "embedding lookup",
            wgpu::include_wgsl!("lookup.wgsl"),
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
        tok_table: &wgpu::Buffer,
        pos_table: &wgpu::Buffer,
        ids: &wgpu::Buffer,
        output: &wgpu::Buffer,
        rows: usize,
        seq_len: usize,
        hidden: usize,
        pos_start: usize,
        max_step: usize,
    ) {
        assert!(pos_start + seq_len <= max_step, "lookup window out of range");

        let uniforms = LookupUniforms {
            seq_len: seq_len as u32,
            hidden: hidden as u32,
            pos_start: pos_start as u32,
            max_step: max_step as u32,
            total: (rows * seq_len * hidden) as u32,
        };
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("lookup uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("lookup bind group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: tok_table.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: pos_table.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: ids.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: output.as_entire_binding(),
                    },
                ],
            });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("lookup pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch_size(uniforms.total), 1, 1);
    }
}
