//! Generator layer: the decoding strategy's seat in the pipeline.
//!
//! The compute layers run on-device; the strategy itself runs host-side on
//! logits read back synchronously after the step's command buffer is
//! submitted, so the stop decision is always made on completed data and
//! nothing executes speculatively. `forward` is therefore a no-op; the
//! model calls `decide` after the frame finishes.

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::generation::{DecodingStrategy, SequenceState};
use crate::graph::{Graph, StepConfig, StepFrame, VarId};
use crate::layers::Layer;
use crate::tensor::DType;
use crate::weights::ParamTable;

/// What the strategy decided for one step.
pub struct StepDecision {
    /// Whether a token was appended to every row.
    pub emitted: bool,
    /// Beam-survivor source rows to gather the KV caches by.
    pub reorder: Option<Vec<u32>>,
    /// All rows finished; the loop must stop.
    pub finished: bool,
}

pub struct GeneratorLayer {
    name: String,
    strategy: Box<dyn DecodingStrategy>,
    logits: VarId,
    out_tokens: VarId,
    out_scores: VarId,
    padding_id: u32,
    max_rows: usize,
    max_step: usize,
    step: StepConfig,
}

impl GeneratorLayer {
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        logits: VarId,
        strategy: Box<dyn DecodingStrategy>,
        padding_id: u32,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let out_tokens = graph.declare_allocated(
            &format!("{name}.out_tokens"),
            DType::U32,
            &[max_rows, max_step],
        )?;
        let out_scores =
            graph.declare_allocated(&format!("{name}.out_scores"), DType::F32, &[max_rows])?;

        Ok(Self {
            name: name.to_string(),
            strategy,
            logits,
            out_tokens,
            out_scores,
            padding_id,
            max_rows,
            max_step,
            step: StepConfig {
                batch: 0,
                seq_len: 0,
                step_offset: 0,
                max_seq: max_step,
            },
        })
    }

    pub fn out_tokens(&self) -> VarId {
        self.out_tokens
    }

    pub fn out_scores(&self) -> VarId {
        self.out_scores
    }

    /// Resets the strategy for a fresh decode loop.
    pub fn begin(&mut self, state: &SequenceState) {
        self.strategy.begin(state);
    }

    /// Reads back this step's logits, runs the strategy, and writes the
    /// updated sequences into the output-token variable.
    pub async fn decide(
        &mut self,
        graph: &mut Graph,
        state: &mut SequenceState,
    ) -> Result<StepDecision> {
        let shape = graph.shape(self.logits).to_vec();
        if shape.len() != 3 {
            return Err(Error::config(format!(
                "'{}': logits must be [rows, seq, vocab], got {:?}",
                self.name, shape
            )));
        }
        let (rows, cur, vocab) = (shape[0], shape[1], shape[2]);
        debug_assert_eq!(
            self.step.batch * state.beam,
            rows,
            "generator step batch disagrees with logits rows"
        );
        if rows != state.num_rows() {
            return Err(Error::config(format!(
                "'{}': logits rows {} do not match sequence rows {}",
                self.name,
                rows,
                state.num_rows()
            )));
        }

        let logits = graph.read_f32(self.logits).await?;

        // Only the last position of each row feeds the strategy.
        let mut last = Array2::<f32>::zeros((rows, vocab));
        for r in 0..rows {
            let base = (r * cur + cur - 1) * vocab;
            last.row_mut(r)
                .as_slice_mut()
                .expect("contiguous logits row")
                .copy_from_slice(&logits[base..base + vocab]);
        }

        let out = self.strategy.advance(last.view(), state)?;
        let emitted = !out.next_tokens.is_empty();
        if emitted {
            let matrix = state.to_row_matrix(self.padding_id);
            graph.write_u32(self.out_tokens, &matrix)?;
        }

        Ok(StepDecision {
            emitted,
            reorder: out.reorder,
            finished: out.finished,
        })
    }

    /// Writes the final sequences and scores, one row per batch element,
    /// padded or truncated to `published_len`.
    pub fn publish(
        &mut self,
        graph: &mut Graph,
        state: &SequenceState,
        published_len: usize,
    ) -> Result<()> {
        let finals = self.strategy.finalize(state);
        let mut tokens = vec![self.padding_id; state.batch * self.max_step];
        let mut scores = vec![0.0f32; state.batch];

        for (b, (sequence, score)) in finals.into_iter().enumerate() {
            let len = sequence.len().min(published_len);
            tokens[b * self.max_step..b * self.max_step + len].copy_from_slice(&sequence[..len]);
            scores[b] = score;
        }

        graph.write_u32(self.out_tokens, &tokens)?;
        graph.write_f32(self.out_scores, &scores)
    }
}

impl Layer for GeneratorLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_params(
        &mut self,
        _graph: &mut Graph,
        _table: &ParamTable,
        _offset: usize,
    ) -> Result<usize> {
        Ok(0)
    }

    fn before_forward(&mut self, _graph: &mut Graph, step: StepConfig) -> Result<()> {
        if step.batch > self.max_rows || step.end_pos() > self.max_step {
            return Err(Error::config(format!(
                "'{}': step {:?} outside wired bounds (rows {}, steps {})",
                self.name, step, self.max_rows, self.max_step
            )));
        }
        self.step = step;
        Ok(())
    }

    fn forward(&mut self, _graph: &mut Graph, _frame: &mut StepFrame) -> Result<()> {
        // Host-side strategy; see `decide`.
        Ok(())
    }
}
