//! Embedding lookup operator: token ids to hidden states, with learned
//! position embeddings added in the same pass.

use crate::error::{Error, Result};
use crate::gpu::kernels::GpuLookup;
use crate::graph::{Device, Graph, StepConfig, StepFrame, VarId};
use crate::tensor::DType;
use crate::weights::HostTensor;

pub struct LookupOp {
    name: String,
    ids: VarId,
    tok_table: VarId,
    pos_table: VarId,
    out: VarId,
    vocab: usize,
    hidden: usize,
    max_rows: usize,
    max_step: usize,
    step: StepConfig,
    kernel: Option<GpuLookup>,
}

impl LookupOp {
    /// Wires the operator: declares the embedding tables and the output
    /// variable at worst-case capacity. Build phase only.
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        ids: VarId,
        vocab: usize,
        hidden: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let tok_table =
            graph.declare_allocated(&format!("{name}.tok_table"), DType::F32, &[vocab, hidden])?;
        let pos_table = graph.declare_allocated(
            &format!("{name}.pos_table"),
            DType::F32,
            &[max_step, hidden],
        )?;
        let out = graph.declare_allocated(
            &format!("{name}.out"),
            DType::F32,
            &[max_rows, max_step, hidden],
        )?;
        let kernel = graph.gpu().map(GpuLookup::new);

        Ok(Self {
            name: name.to_string(),
            ids,
            tok_table,
            pos_table,
            out,
            vocab,
            hidden,
            max_rows,
            max_step,
            step: StepConfig {
                batch: 0,
                seq_len: 0,
                step_offset: 0,
                max_seq: max_step,
            },
            kernel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out(&self) -> VarId {
        self.out
    }

    pub fn tok_table(&self) -> VarId {
        self.tok_table
    }

    pub fn load_tables(
        &mut self,
        graph: &mut Graph,
        tok: &HostTensor,
        pos: &HostTensor,
    ) -> Result<()> {
        tok.expect_shape(&[self.vocab, self.hidden])?;
        pos.expect_shape(&[self.max_step, self.hidden])?;
        graph.write_f32(self.tok_table, &tok.data)?;
        graph.write_f32(self.pos_table, &pos.data)
    }

    pub fn before_step(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()> {
        if step.batch > self.max_rows || step.end_pos() > self.max_step {
            return Err(Error::config(format!(
                "'{}': step {:?} outside wired bounds (rows {}, steps {})",
                self.name, step, self.max_rows, self.max_step
            )));
        }
        graph.reshape(self.out, &[step.batch, step.seq_len, self.hidden])?;
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
        let ids = graph.host_u32(self.ids)?;
        let tok = graph.host_f32(self.tok_table)?;
        let pos = graph.host_f32(self.pos_table)?;

        let h = self.hidden;
        let mut out = vec![0.0f32; step.batch * step.seq_len * h];
        for row in 0..step.batch {
            for i in 0..step.seq_len {
                let p = step.step_offset + i;
                let token = ids[row * self.max_step + p] as usize;
                if token >= self.vocab {
                    return Err(Error::config(format!(
                        "'{}': token id {} outside vocabulary of {}",
                        self.name, token, self.vocab
                    )));
                }
                let dst = (row * step.seq_len + i) * h;
                for d in 0..h {
                    out[dst + d] = tok[token * h + d] + pos[p * h + d];
                }
            }
        }
        graph.write_f32(self.out, &out)
    }

    fn forward_gpu(&self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        let kernel = self
            .kernel
            .as_ref()
            .expect("gpu lookup kernel missing on wgpu device");
        kernel.encode(
            frame.encoder(),
            graph.wgpu_buffer(self.tok_table)?,
            graph.wgpu_buffer(self.pos_table)?,
            graph.wgpu_buffer(self.ids)?,
            graph.wgpu_buffer(self.out)?,
            self.step.batch,
            self.step.seq_len,
            self.hidden,
            self.step.step_offset,
            self.max_step,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphContext;

    const VOCAB: usize = 4;
    const HIDDEN: usize = 2;
    const MAX_STEP: usize = 3;

    fn setup() -> (Graph, VarId, LookupOp) {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let ids = graph
            .declare_allocated("ids", DType::U32, &[1, MAX_STEP])
            .unwrap();
        let mut op = LookupOp::wire(&mut graph, "emb", ids, VOCAB, HIDDEN, 1, MAX_STEP).unwrap();
        graph.finish_build().unwrap();

        // tok[t] = [t, 10t], pos[p] = [0.1(p+1), 0.1(p+1)]
        let tok = HostTensor::new(
            "tok",
            vec![VOCAB, HIDDEN],
            (0..VOCAB).flat_map(|t| [t as f32, 10.0 * t as f32]).collect(),
        )
        .unwrap();
        let pos = HostTensor::new(
            "pos",
            vec![MAX_STEP, HIDDEN],
            (0..MAX_STEP)
                .flat_map(|p| [0.1 * (p + 1) as f32, 0.1 * (p + 1) as f32])
                .collect(),
        )
        .unwrap();
        op.load_tables(&mut graph, &tok, &pos).unwrap();
        (graph, ids, op)
    }

    fn run(graph: &mut Graph, op: &mut LookupOp, seq_len: usize, offset: usize) {
        let step = StepConfig {
            batch: 1,
            seq_len,
            step_offset: offset,
            max_seq: MAX_STEP,
        };
        op.before_step(graph, step).unwrap();
        let mut frame = StepFrame::begin(graph);
        op.forward(graph, &mut frame).unwrap();
        frame.finish(graph);
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-5, "element {i}: {a} vs {e}");
        }
    }

    #[test]
    fn test_prefill_lookup_adds_positions() {
        let (mut graph, ids, mut op) = setup();
        graph.write_u32(ids, &[2, 1, 0]).unwrap();
        run(&mut graph, &mut op, 3, 0);

        let out = graph.host_f32(op.out()).unwrap();
        // token 2 at position 0, token 1 at position 1, token 0 at position 2
        assert_close(&out[..6], &[2.1, 20.1, 1.2, 10.2, 0.3, 0.3]);
    }

    #[test]
    fn test_decode_lookup_reads_offset_position() {
        let (mut graph, ids, mut op) = setup();
        graph.write_u32(ids, &[2, 1, 3]).unwrap();
        run(&mut graph, &mut op, 1, 2);

        let out = graph.host_f32(op.out()).unwrap();
        // token 3 at position 2
        assert_close(&out[..2], &[3.3, 30.3]);
    }

    #[test]
    fn test_out_of_vocab_token_rejected() {
        let (mut graph, ids, mut op) = setup();
        graph.write_u32(ids, &[9, 0, 0]).unwrap();

        let step = StepConfig {
            batch: 1,
            seq_len: 1,
            step_offset: 0,
            max_seq: MAX_STEP,
        };
        op.before_step(&mut graph, step).unwrap();
        let mut frame = StepFrame::begin(&graph);
        assert!(op.forward(&mut graph, &mut frame).is_err());
        frame.finish(&graph);
    }

    #[test]
    fn test_table_shape_mismatch_rejected() {
        let (mut graph, _ids, mut op) = setup();
        let bad = HostTensor::new("tok", vec![2, 2], vec![0.0; 4]).unwrap();
        let pos = HostTensor::new("pos", vec![MAX_STEP, HIDDEN], vec![0.0; MAX_STEP * HIDDEN])
            .unwrap();
        assert!(op.load_tables(&mut graph, &bad, &pos).is_err());
    }
}
