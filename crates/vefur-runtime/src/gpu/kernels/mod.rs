//! WGSL compute kernels, one wrapper per kernel family.
//!
//! Each wrapper compiles its pipeline once at construction and exposes an
//! `encode` method that validates shapes, uploads a uniform struct and
//! records one compute pass onto the step's command encoder.

pub mod attention;
pub mod cache;
pub mod linear;
pub mod lookup;
pub mod norm;
pub mod residual;

pub use attention::GpuAttention;
pub use cache::{GpuCacheStore, GpuReorderCache};
pub use linear::GpuLinear;
pub use lookup::GpuLookup;
pub use norm::GpuNorm;
pub use residual::GpuResidual;

use crate::gpu::WgpuContext;


pub(crate) const WORKGROUP_SIZE: u32 = 256;

pub(crate) fn dispatch_size(total: u32) -> u32 {
    total.div_ceil(WORKGROUP_SIZE)
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn compile_pipeline(
    context: &WgpuContext,
    label: &str,
    shader: wgpu::ShaderModuleDescriptor<'_>,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let module = context.device.create_shader_module(shader);
    let bind_group_layout =
        context
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            });
    let pipeline_layout =
        context
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
    let pipeline = context
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
    (pipeline, bind_group_layout)
}
