//! Causal self-attention over a preallocated KV cache.
//!
//! The operator owns two cache pairs per instance: the live K/V tensors and
//! a scratch pair used as the destination of beam reordering. Reorder
//! gathers surviving rows into the scratch buffers, then swaps the pairs,
//! the same double-buffering the token ping-pong uses.

use crate::cpu;
use crate::error::{Error, Result};
use crate::gpu::kernels::{attention::MAX_HEAD_DIM, GpuAttention, GpuCacheStore, GpuReorderCache};
use crate::graph::{Device, Graph, StepConfig, StepFrame, VarId};
use crate::tensor::DType;

struct GpuAttentionKernels {
    store: GpuCacheStore,
    attention: GpuAttention,
    reorder: GpuReorderCache,
}

pub struct AttentionOp {
    name: String,
    qkv: VarId,
    out: VarId,
    cache_k: VarId,
    cache_v: VarId,
    scratch_k: VarId,
    scratch_v: VarId,
    heads: usize,
    head_dim: usize,
    max_rows: usize,
    max_step: usize,
    step: StepConfig,
    kernels: Option<GpuAttentionKernels>,
}

impl AttentionOp {
    #[allow(clippy::too_many_arguments)]
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        qkv: VarId,
        heads: usize,
        head_dim: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        if graph.device().is_gpu() && head_dim > MAX_HEAD_DIM {
            return Err(Error::config(format!(
                "'{name}': head_dim {head_dim} exceeds the gpu kernel limit {MAX_HEAD_DIM}"
            )));
        }

        let hidden = heads * head_dim;
        let cache_shape = [max_rows, heads, max_step, head_dim];
        let cache_k =
            graph.declare_allocated(&format!("{name}.cache_k"), DType::F32, &cache_shape)?;
        let cache_v =
            graph.declare_allocated(&format!("{name}.cache_v"), DType::F32, &cache_shape)?;
        let scratch_k =
            graph.declare_allocated(&format!("{name}.scratch_k"), DType::F32, &cache_shape)?;
        let scratch_v =
            graph.declare_allocated(&format!("{name}.scratch_v"), DType::F32, &cache_shape)?;
        let out = graph.declare_allocated(
            &format!("{name}.out"),
            DType::F32,
            &[max_rows, max_step, hidden],
        )?;

        let kernels = graph.gpu().map(|gpu| GpuAttentionKernels {
            store: GpuCacheStore::new(gpu),
            attention: GpuAttention::new(gpu),
            reorder: GpuReorderCache::new(gpu),
        });

        Ok(Self {
            name: name.to_string(),
            qkv,
            out,
            cache_k,
            cache_v,
            scratch_k,
            scratch_v,
            heads,
            head_dim,
            max_rows,
            max_step,
            step: StepConfig {
                batch: 0,
                seq_len: 0,
                step_offset: 0,
                max_seq: max_step,
            },
            kernels,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out(&self) -> VarId {
        self.out
    }

    pub fn cache_k(&self) -> VarId {
        self.cache_k
    }

    pub fn cache_v(&self) -> VarId {
        self.cache_v
    }

    pub fn before_step(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()> {
        if step.batch > self.max_rows || step.end_pos() > self.max_step {
            return Err(Error::config(format!(
                "'{}': step {:?} outside wired bounds (rows {}, steps {})",
                self.name, step, self.max_rows, self.max_step
            )));
        }
        let hidden = self.heads * self.head_dim;
        graph.reshape(self.out, &[step.batch, step.seq_len, hidden])?;
        self.step = step;
        Ok(())
    }

    pub fn forward(&mut self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        match graph.device() {
            Device::Cpu => self.forward_cpu(graph),
            Device::Wgpu => self.forward_gpu(graph, frame),
        }
    }

    fn forward_cpu(&self, graph: &mut Graph) -> Result<()> {
        let step = self.step;
        let (heads, dh) = (self.heads, self.head_dim);
        let hidden = heads * dh;
        let scale = 1.0 / (dh as f32).sqrt();

        let qkv = graph.host_f32(self.qkv)?;
        let mut cache_k = graph.host_f32(self.cache_k)?;
        let mut cache_v = graph.host_f32(self.cache_v)?;

        let cache_idx =
            |row: usize, h: usize, p: usize, d: usize| ((row * heads + h) * self.max_step + p) * dh + d;

        // Store this step's K/V into the caches.
        for row in 0..step.batch {
            for i in 0..step.seq_len {
                let base = (row * step.seq_len + i) * 3 * hidden;
                let p = step.step_offset + i;
                for h in 0..heads {
                    for d in 0..dh {
                        cache_k[cache_idx(row, h, p, d)] = qkv[base + hidden + h * dh + d];
                        cache_v[cache_idx(row, h, p, d)] = qkv[base + 2 * hidden + h * dh + d];
                    }
                }
            }
        }

        // Causal attention against everything cached so far.
        let mut out = vec![0.0f32; step.batch * step.seq_len * hidden];
        for row in 0..step.batch {
            for i in 0..step.seq_len {
                let q_base = (row * step.seq_len + i) * 3 * hidden;
                let t_len = step.step_offset + i + 1;
                for h in 0..heads {
                    let mut scores = vec![0.0f32; t_len];
                    for (t, score) in scores.iter_mut().enumerate() {
                        let mut s = 0.0;
                        for d in 0..dh {
                            s += qkv[q_base + h * dh + d] * cache_k[cache_idx(row, h, t, d)];
                        }
                        *score = s * scale;
                    }
                    cpu::softmax_1d_inplace(&mut scores);

                    let out_base = (row * step.seq_len + i) * hidden + h * dh;
                    for (t, &w) in scores.iter().enumerate() {
                        for d in 0..dh {
                            out[out_base + d] += w * cache_v[cache_idx(row, h, t, d)];
                        }
                    }
                }
            }
        }

        graph.write_f32(self.cache_k, &cache_k)?;
        graph.write_f32(self.cache_v, &cache_v)?;
        graph.write_f32(self.out, &out)
    }

    fn forward_gpu(&self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        let kernels = self
            .kernels
            .as_ref()
            .expect("gpu attention kernels missing on wgpu device");
        let step = self.step;

        kernels.store.encode(
            frame.encoder(),
            graph.wgpu_buffer(self.qkv)?,
            graph.wgpu_buffer(self.cache_k)?,
            graph.wgpu_buffer(self.cache_v)?,
            step.batch,
            step.seq_len,
            self.heads,
            self.head_dim,
            step.step_offset,
            self.max_step,
        );
        kernels.attention.encode(
            frame.encoder(),
            graph.wgpu_buffer(self.qkv)?,
            graph.wgpu_buffer(self.cache_k)?,
            graph.wgpu_buffer(self.cache_v)?,
            graph.wgpu_buffer(self.out)?,
            step.batch,
            step.seq_len,
            self.heads,
            self.head_dim,
            step.step_offset,
            self.max_step,
        );
        Ok(())
    }

    /// Reorders cache rows so row `r` holds what row `indices[r]` held, for
    /// the first `filled` positions. Gathers into the scratch pair, then
    /// swaps scratch and live buffers.
    pub fn reorder_cache(
        &mut self,
        graph: &mut Graph,
        frame: &mut StepFrame,
        indices: VarId,
        rows: usize,
        filled: usize,
    ) -> Result<()> {
        if filled == 0 {
            return Err(Error::config(format!(
                "'{}': cannot reorder an empty cache",
                self.name
            )));
        }

        match graph.device() {
            Device::Cpu => {
                let idx = graph.host_u32(indices)?;
                let cache_k = graph.host_f32(self.cache_k)?;
                let cache_v = graph.host_f32(self.cache_v)?;

                let row_stride = self.heads * self.max_step * self.head_dim;
                let mut new_k = graph.host_f32(self.scratch_k)?;
                let mut new_v = graph.host_f32(self.scratch_v)?;
                for r in 0..rows {
                    let src = idx[r] as usize;
                    new_k[r * row_stride..(r + 1) * row_stride]
                        .copy_from_slice(&cache_k[src * row_stride..(src + 1) * row_stride]);
                    new_v[r * row_stride..(r + 1) * row_stride]
                        .copy_from_slice(&cache_v[src * row_stride..(src + 1) * row_stride]);
                }
                graph.write_f32(self.scratch_k, &new_k)?;
                graph.write_f32(self.scratch_v, &new_v)?;
            }
            Device::Wgpu => {
                let kernels = self
                    .kernels
                    .as_ref()
                    .expect("gpu attention kernels missing on wgpu device");
                kernels.reorder.encode(
                    frame.encoder(),
                    graph.wgpu_buffer(self.cache_k)?,
                    graph.wgpu_buffer(self.scratch_k)?,
                    graph.wgpu_buffer(indices)?,
                    rows,
                    self.heads,
                    filled,
                    self.max_step,
                    self.head_dim,
                );
                kernels.reorder.encode(
                    frame.encoder(),
                    graph.wgpu_buffer(self.cache_v)?,
                    graph.wgpu_buffer(self.scratch_v)?,
                    graph.wgpu_buffer(indices)?,
                    rows,
                    self.heads,
                    filled,
                    self.max_step,
                    self.head_dim,
                );
            }
        }

        graph.swap(self.cache_k, self.scratch_k)?;
        graph.swap(self.cache_v, self.scratch_v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphContext;

    const HEADS: usize = 1;
    const DH: usize = 2;
    const HIDDEN: usize = HEADS * DH;
    const MAX_STEP: usize = 4;

    struct Harness {
        graph: Graph,
        qkv: VarId,
        indices: VarId,
        op: AttentionOp,
    }

    fn harness(rows: usize) -> Harness {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let qkv = graph
            .declare_allocated("qkv", DType::F32, &[rows, MAX_STEP, 3 * HIDDEN])
            .unwrap();
        let indices = graph
            .declare_allocated("indices", DType::U32, &[rows])
            .unwrap();
        let op = AttentionOp::wire(&mut graph, "attn", qkv, HEADS, DH, rows, MAX_STEP).unwrap();
        graph.finish_build().unwrap();
        Harness {
            graph,
            qkv,
            indices,
            op,
        }
    }

    fn run_step(h: &mut Harness, rows: usize, seq_len: usize, offset: usize, qkv: &[f32]) {
        let step = StepConfig {
            batch: rows,
            seq_len,
            step_offset: offset,
            max_seq: MAX_STEP,
        };
        h.graph.write_f32(h.qkv, qkv).unwrap();
        h.op.before_step(&mut h.graph, step).unwrap();
        let mut frame = StepFrame::begin(&h.graph);
        h.op.forward(&mut h.graph, &mut frame).unwrap();
        frame.finish(&h.graph);
    }

    fn out_values(h: &Harness) -> Vec<f32> {
        h.graph.host_f32(h.op.out()).unwrap()
    }

    #[test]
    fn test_single_position_attends_to_itself() {
        let mut h = harness(1);
        // q | k | v for one token: softmax over one position is 1.0, so the
        // output is exactly v.
        run_step(&mut h, 1, 1, 0, &[0.3, -0.2, 1.0, 0.5, 7.0, -3.0]);

        let out = out_values(&h);
        assert!((out[0] - 7.0).abs() < 1e-6);
        assert!((out[1] - (-3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_decode_step_matches_prefill() {
        let t0 = [0.1f32, 0.2, 0.5, -0.5, 1.0, 2.0];
        let t1 = [-0.3f32, 0.4, 0.2, 0.8, -1.0, 3.0];

        // One-shot prefill over both tokens.
        let mut oneshot = harness(1);
        let mut both = Vec::new();
        both.extend_from_slice(&t0);
        both.extend_from_slice(&t1);
        run_step(&mut oneshot, 1, 2, 0, &both);
        let reference = out_values(&oneshot);

        // Prefill the first token, decode the second.
        let mut stepped = harness(1);
        run_step(&mut stepped, 1, 1, 0, &t0);
        run_step(&mut stepped, 1, 1, 1, &t1);
        let decoded = out_values(&stepped);

        for d in 0..HIDDEN {
            assert!(
                (decoded[d] - reference[HIDDEN + d]).abs() < 1e-6,
                "position 1 mismatch at dim {d}"
            );
        }
    }

    #[test]
    fn test_reorder_gathers_cache_rows_byte_for_byte() {
        let rows = 4;
        let mut h = harness(rows);

        // Two steps with row-distinct values so a reorder is observable.
        for (offset, base) in [(0usize, 1.0f32), (1, 100.0)] {
            let mut qkv = vec![0.0f32; rows * 3 * HIDDEN];
            for r in 0..rows {
                for d in 0..3 * HIDDEN {
                    qkv[r * 3 * HIDDEN + d] = base + (r * 10 + d) as f32;
                }
            }
            run_step(&mut h, rows, 1, offset, &qkv);
        }

        let before_k = h.graph.host_f32(h.op.cache_k()).unwrap();
        let before_v = h.graph.host_f32(h.op.cache_v()).unwrap();

        let order = [2u32, 0, 3, 1];
        h.graph.write_u32(h.indices, &order).unwrap();
        let mut frame = StepFrame::begin(&h.graph);
        h.op
            .reorder_cache(&mut h.graph, &mut frame, h.indices, rows, 2)
            .unwrap();
        frame.finish(&h.graph);

        let after_k = h.graph.host_f32(h.op.cache_k()).unwrap();
        let after_v = h.graph.host_f32(h.op.cache_v()).unwrap();

        let row_stride = HEADS * MAX_STEP * DH;
        for (dst, &src) in order.iter().enumerate() {
            let src = src as usize;
            assert_eq!(
                after_k[dst * row_stride..dst * row_stride + row_stride],
                before_k[src * row_stride..src * row_stride + row_stride],
                "k cache row {dst} must equal old row {src}"
            );
            assert_eq!(
                after_v[dst * row_stride..dst * row_stride + row_stride],
                before_v[src * row_stride..src * row_stride + row_stride],
                "v cache row {dst} must equal old row {src}"
            );
        }
    }

    #[test]
    fn test_reorder_empty_cache_rejected() {
        let mut h = harness(2);
        let mut frame = StepFrame::begin(&h.graph);
        let result = h
            .op
            .reorder_cache(&mut h.graph, &mut frame, h.indices, 2, 0);
        frame.finish(&h.graph);
        assert!(result.is_err());
    }

    #[test]
    fn test_step_outside_wired_bounds_rejected() {
        let mut h = harness(1);
        let step = StepConfig {
            batch: 1,
            seq_len: 1,
            step_offset: MAX_STEP,
            max_seq: MAX_STEP,
        };
        assert!(h.op.before_step(&mut h.graph, step).is_err());

        let step = StepConfig {
            batch: 2,
            seq_len: 1,
            step_offset: 0,
            max_seq: MAX_STEP,
        };
        assert!(h.op.before_step(&mut h.graph, step).is_err());
    }
}
