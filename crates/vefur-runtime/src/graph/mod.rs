//! The static dataflow graph: variables, the buffer arena and the phase
//! machine that separates one-time wiring from per-step execution.

pub mod arena;
pub mod context;
pub mod frame;
pub mod step;
pub mod variable;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gpu::WgpuContext;
use crate::tensor::DType;

pub use arena::{BufferArena, BufferId};
pub use context::{Device, GraphContext, Phase};
pub use frame::StepFrame;
pub use step::StepConfig;
pub use variable::{VarId, Variable};

/// Owns the variables and buffers of one model graph.
///
/// Topology is fixed during the build phase: every variable is declared and
/// allocated once, at worst-case capacity. After `finish_build`, the only
/// mutations are logical reshapes, buffer swaps and data writes.
pub struct Graph {
    ctx: GraphContext,
    vars: Vec<Variable>,
    arena: BufferArena,
}

impl Graph {
    /// Wraps a fresh context. The context must still be building; handing in
    /// an already-built context means a second graph is being assembled on
    /// it, which is a configuration error.
    pub fn new(ctx: GraphContext) -> Result<Self> {
        ctx.ensure_building().map_err(|_| {
            Error::config("graph context was already used to build a graph")
        })?;
        let arena = BufferArena::new(ctx.device(), ctx.gpu().cloned());
        Ok(Self {
            ctx,
            vars: Vec::new(),
            arena,
        })
    }

    pub fn device(&self) -> Device {
        self.ctx.device()
    }

    pub fn gpu(&self) -> Option<&Arc<WgpuContext>> {
        self.ctx.gpu()
    }

    pub fn is_built(&self) -> bool {
        self.ctx.is_built()
    }

    pub fn finish_build(&mut self) -> Result<()> {
        self.ctx.finish_build()?;
        log::info!(
            "graph built: {} variables, {} buffers, {:.2} MB",
            self.vars.len(),
            self.arena.len(),
            self.arena.allocated_bytes() as f64 / 1_048_576.0
        );
        Ok(())
    }

    pub fn synchronize(&self) -> Result<()> {
        self.ctx.synchronize()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Declares a variable without backing storage.
    pub fn declare(&mut self, name: &str, dtype: DType) -> VarId {
        self.vars.push(Variable::new(name, dtype));
        VarId(self.vars.len() - 1)
    }

    /// Reserves a buffer sized to the largest shape the variable will ever
    /// hold. Only legal while the graph is building.
    pub fn allocate(&mut self, var: VarId, capacity: usize) -> Result<()> {
        self.ctx.ensure_building()?;
        let v = &self.vars[var.0];
        if v.is_allocated() {
            return Err(Error::config(format!(
                "variable '{}' is already allocated",
                v.name
            )));
        }
        let id = self.arena.alloc(&v.name, v.dtype, capacity)?;
        let v = &mut self.vars[var.0];
        v.buffer = Some(id);
        v.capacity = capacity;
        Ok(())
    }

    /// Declares and allocates in one call, with `max_shape` as both the
    /// initial logical shape and the capacity bound.
    pub fn declare_allocated(
        &mut self,
        name: &str,
        dtype: DType,
        max_shape: &[usize],
    ) -> Result<VarId> {
        let var = self.declare(name, dtype);
        self.allocate(var, max_shape.iter().product())?;
        self.vars[var.0].shape = max_shape.to_vec();
        Ok(var)
    }

    pub fn var(&self, var: VarId) -> &Variable {
        &self.vars[var.0]
    }

    pub fn shape(&self, var: VarId) -> &[usize] {
        &self.vars[var.0].shape
    }

    pub fn dtype(&self, var: VarId) -> DType {
        self.vars[var.0].dtype
    }

    /// O(1) metadata update of the logical shape. Rejects shapes whose
    /// element count exceeds the allocated capacity.
    pub fn reshape(&mut self, var: VarId, shape: &[usize]) -> Result<()> {
        let v = &mut self.vars[var.0];
        let requested: usize = shape.iter().product();
        if requested > v.capacity {
            return Err(Error::Capacity {
                shape: shape.to_vec(),
                requested,
                capacity: v.capacity,
            });
        }
        v.shape = shape.to_vec();
        Ok(())
    }

    /// Exchanges the buffers of two variables without copying data.
    ///
    /// Swappable pairs are provisioned symmetrically: same element type,
    /// same capacity. Each variable keeps its own logical shape, which
    /// stays valid against the exchanged buffer.
    pub fn swap(&mut self, a: VarId, b: VarId) -> Result<()> {
        if a == b {
            return Ok(());
        }
        let (va, vb) = (&self.vars[a.0], &self.vars[b.0]);
        if va.dtype != vb.dtype {
            return Err(Error::config(format!(
                "cannot swap '{}' ({}) with '{}' ({}): element types differ",
                va.name, va.dtype, vb.name, vb.dtype
            )));
        }
        if va.capacity != vb.capacity || !va.is_allocated() || !vb.is_allocated() {
            return Err(Error::config(format!(
                "cannot swap '{}' with '{}': capacities are not provisioned symmetrically",
                va.name, vb.name
            )));
        }
        let tmp = self.vars[a.0].buffer;
        self.vars[a.0].buffer = self.vars[b.0].buffer;
        self.vars[b.0].buffer = tmp;
        Ok(())
    }

    /// The buffer currently backing `var`.
    pub fn value(&self, var: VarId) -> Result<BufferId> {
        self.vars[var.0].buffer.ok_or_else(|| {
            Error::config(format!("variable '{}' has no buffer", self.vars[var.0].name))
        })
    }

    /// The gradient buffer, if one was ever allocated. Inference graphs
    /// never allocate gradients.
    pub fn gradient(&self, var: VarId) -> Option<BufferId> {
        self.vars[var.0].grad
    }

    // ------------------------------------------------------------------
    // Data movement
    // ------------------------------------------------------------------

    pub fn wgpu_buffer(&self, var: VarId) -> Result<&wgpu::Buffer> {
        Ok(self.arena.wgpu_buffer(self.value(var)?))
    }

    pub fn write_f32(&mut self, var: VarId, data: &[f32]) -> Result<()> {
        let id = self.value(var)?;
        self.arena.write_f32(id, 0, data)
    }

    pub fn write_u32(&mut self, var: VarId, data: &[u32]) -> Result<()> {
        let id = self.value(var)?;
        self.arena.write_u32(id, 0, data)
    }

    /// Synchronous full-capacity read of a host-resident buffer. The CPU
    /// operator kernels use this; it fails on device buffers.
    pub fn host_f32(&self, var: VarId) -> Result<Vec<f32>> {
        let id = self.value(var)?;
        self.arena.host_f32(id, self.vars[var.0].capacity)
    }

    pub fn host_u32(&self, var: VarId) -> Result<Vec<u32>> {
        let id = self.value(var)?;
        self.arena.host_u32(id, self.vars[var.0].capacity)
    }

    /// Reads the elements covered by the current logical shape.
    pub async fn read_f32(&self, var: VarId) -> Result<Vec<f32>> {
        let id = self.value(var)?;
        self.arena.read_f32(id, self.vars[var.0].num_elements()).await
    }

    pub async fn read_u32(&self, var: VarId) -> Result<Vec<u32>> {
        let id = self.value(var)?;
        self.arena.read_u32(id, self.vars[var.0].num_elements()).await
    }

    /// Reads the full capacity of the backing buffer, ignoring the logical
    /// shape. Used for row-strided buffers like the token ping-pong pair.
    pub async fn read_u32_capacity(&self, var: VarId) -> Result<Vec<u32>> {
        let id = self.value(var)?;
        self.arena.read_u32(id, self.vars[var.0].capacity).await
    }

    pub async fn read_f32_capacity(&self, var: VarId) -> Result<Vec<f32>> {
        let id = self.value(var)?;
        self.arena.read_f32(id, self.vars[var.0].capacity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cpu_graph() -> Graph {
        Graph::new(GraphContext::for_cpu()).unwrap()
    }

    #[test]
    fn test_reshape_within_capacity() {
        let mut g = cpu_graph();
        let v = g.declare_allocated("x", DType::F32, &[4, 8]).unwrap();

        g.reshape(v, &[2, 8]).unwrap();
        assert_eq!(g.shape(v), &[2, 8]);

        g.reshape(v, &[4, 8]).unwrap();
        assert_eq!(g.var(v).num_elements(), 32);
    }

    #[test]
    fn test_reshape_over_capacity_rejected() {
        let mut g = cpu_graph();
        let v = g.declare_allocated("x", DType::F32, &[4, 8]).unwrap();

        let err = g.reshape(v, &[4, 9]).unwrap_err();
        assert!(matches!(err, Error::Capacity { requested: 36, .. }));
        // Failed reshape leaves the shape untouched.
        assert_eq!(g.shape(v), &[4, 8]);
    }

    #[test]
    fn test_reshape_acceptance_matches_capacity_exactly() {
        let mut g = cpu_graph();
        let v = g.declare_allocated("x", DType::F32, &[6, 10]).unwrap();
        let capacity = g.var(v).capacity();

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let shape = [rng.gen_range(1..=12usize), rng.gen_range(1..=12usize)];
            let implied: usize = shape.iter().product();
            let accepted = g.reshape(v, &shape).is_ok();
            assert_eq!(
                accepted,
                implied <= capacity,
                "shape {:?} ({} elements) vs capacity {}",
                shape,
                implied,
                capacity
            );
        }
    }

    #[test]
    fn test_swap_exchanges_buffers_only() {
        let mut g = cpu_graph();
        let a = g.declare_allocated("a", DType::U32, &[8]).unwrap();
        let b = g.declare_allocated("b", DType::U32, &[8]).unwrap();

        let buf_a = g.value(a).unwrap();
        let buf_b = g.value(b).unwrap();

        g.write_u32(a, &[1; 8]).unwrap();
        g.write_u32(b, &[2; 8]).unwrap();

        g.swap(a, b).unwrap();
        assert_eq!(g.value(a).unwrap(), buf_b);
        assert_eq!(g.value(b).unwrap(), buf_a);
        // Shapes stay with their variables.
        assert_eq!(g.shape(a), &[8]);
    }

    #[test]
    fn test_swap_twice_is_identity() {
        let mut g = cpu_graph();
        let a = g.declare_allocated("a", DType::F32, &[4, 4]).unwrap();
        let b = g.declare_allocated("b", DType::F32, &[4, 4]).unwrap();

        let before = (g.value(a).unwrap(), g.value(b).unwrap());
        g.swap(a, b).unwrap();
        g.swap(a, b).unwrap();
        assert_eq!((g.value(a).unwrap(), g.value(b).unwrap()), before);
    }

    #[test]
    fn test_swap_requires_symmetric_provisioning() {
        let mut g = cpu_graph();
        let a = g.declare_allocated("a", DType::F32, &[8]).unwrap();
        let b = g.declare_allocated("b", DType::F32, &[16]).unwrap();
        let c = g.declare_allocated("c", DType::U32, &[8]).unwrap();

        assert!(g.swap(a, b).is_err());
        assert!(g.swap(a, c).is_err());
    }

    #[test]
    fn test_allocation_after_build_rejected() {
        let mut g = cpu_graph();
        let v = g.declare("late", DType::F32);
        g.finish_build().unwrap();

        let err = g.allocate(v, 16).unwrap_err();
        assert!(matches!(err, Error::Phase(_)));
    }

    #[test]
    fn test_built_context_rejected_for_second_graph() {
        let mut ctx = GraphContext::for_cpu();
        ctx.finish_build().unwrap();
        assert!(Graph::new(ctx).is_err());
    }

    #[test]
    fn test_double_allocation_rejected() {
        let mut g = cpu_graph();
        let v = g.declare_allocated("x", DType::F32, &[4]).unwrap();
        assert!(g.allocate(v, 8).is_err());
    }

    #[test]
    fn test_gradient_never_allocated_for_inference() {
        let mut g = cpu_graph();
        let v = g.declare_allocated("x", DType::F32, &[4]).unwrap();
        assert!(g.gradient(v).is_none());
    }
}
