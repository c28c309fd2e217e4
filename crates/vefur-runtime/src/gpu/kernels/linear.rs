//! GEMM kernel with fused bias add and optional GELU.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::gpu::kernels::{compile_pipeline, dispatch_size, storage_entry, uniform_entry};
use crate::gpu::WgpuContext;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct LinearUniforms {
    m: u32,
    k: u32,
    n: u32,
    has_bias: u32,
    activate: u32,
    total: u32,
}

pub struct GpuLinear {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    /// Bound in the bias slot when the operator has no bias.
    zero_bias: wgpu::Buffer,
    context: Arc<WgpuContext>,
}

impl GpuLinear {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        let (pipeline, bind_group_layout) = compile_pipeline(
            context,
            "linear",
            wgpu::include_wgsl!("linear.wgsl"),
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
            ],
        );
        let zero_bias = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("linear zero bias"),
                contents: bytemuck::cast_slice(&[0.0f32]),
                usage: wgpu::BufferUsages::STORAGE,
            });
        Self {
            pipeline: Arc::new(pipeline),
            bind_group_layout: Arc::new(bind_group_layout),
            zero_bias,
            context: context.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        x: &wgpu::Buffer,
        w: &wgpu::Buffer,
        bias: Option<&wgpu::Buffer>,
        output: &wgpu::Buffer,
        m: usize,
        k: usize,
        n: usize,
        activate: bool,
    ) {
        let uniforms = LinearUniforms {
            m: m as u32,
            k: k as u32,
            n: n as u32,
            has_bias: bias.is_some() as u32,
            activate: activate as u32,
            total: (m * n) as u32,
        };
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("linear uniforms"),
                    contents: bytemuck::cast_slice(&[uniforms]),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("linear bind group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: x.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: w.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: bias.unwrap_or(&self.zero_bias).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: output.as_entire_binding(),
                    },
                ],
            });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("linear pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch_size(uniforms.total), 1, 1);
    }
}
