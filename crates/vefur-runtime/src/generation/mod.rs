//! Decoding strategies.
//!
//! Strategies are host-side: logits are read back synchronously after each
//! submitted step and the stop decision is always made on completed data.
//! A strategy consumes the last-position logits for every active row,
//! appends tokens to the running sequences, and reports whether generation
//! is finished. Beam search additionally reports the cache-reorder indices
//! for the rows that survived pruning.

pub mod beams;
pub mod sampling;

pub use beams::BeamSearchStrategy;
pub use sampling::{GreedyStrategy, SamplingStrategy};

use ndarray::ArrayView2;

use crate::error::{Error, Result};

/// Host-authoritative running sequences, one row per batch x beam slot.
pub struct SequenceState {
    pub batch: usize,
    pub beam: usize,
    pub prompt_len: usize,
    pub max_step: usize,
    pub rows: Vec<Vec<u32>>,
    pub scores: Vec<f32>,
    pub finished: Vec<bool>,
}

impl SequenceState {
    /// Replicates each prompt across its beam rows. With more than one beam
    /// only the first starts live; the rest start at negative infinity so
    /// the first expansion fans out from a single hypothesis.
    pub fn new(prompts: &[Vec<u32>], beam: usize, max_step: usize) -> Result<Self> {
        let batch = prompts.len();
        if batch == 0 || beam == 0 {
            return Err(Error::config("batch and beam width must be non-zero"));
        }
        let prompt_len = prompts[0].len();
        if prompt_len == 0 || prompt_len > max_step {
            return Err(Error::config(format!(
                "prompt length {} outside 1..={}",
                prompt_len, max_step
            )));
        }
        if prompts.iter().any(|p| p.len() != prompt_len) {
            return Err(Error::config("all prompts in a batch must share a length"));
        }

        let mut rows = Vec::with_capacity(batch * beam);
        let mut scores = Vec::with_capacity(batch * beam);
        for prompt in prompts {
            for b in 0..beam {
                rows.push(prompt.clone());
                scores.push(if b == 0 { 0.0 } else { f32::NEG_INFINITY });
            }
        }

        Ok(Self {
            batch,
            beam,
            prompt_len,
            max_step,
            rows,
            scores,
            finished: vec![false; batch * beam],
        })
    }

    pub fn num_rows(&self) -> usize {
        self.batch * self.beam
    }

    /// Current sequence length (uniform across rows).
    pub fn seq_len(&self) -> usize {
        self.rows[0].len()
    }

    /// Flattens all rows into a `[rows, max_step]` matrix padded with `pad`.
    pub fn to_row_matrix(&self, pad: u32) -> Vec<u32> {
        let mut out = vec![pad; self.num_rows() * self.max_step];
        for (r, row) in self.rows.iter().enumerate() {
            out[r * self.max_step..r * self.max_step + row.len()].copy_from_slice(row);
        }
        out
    }
}

/// What one strategy invocation decided.
pub struct StrategyOutput {
    /// One token per row. Empty when the strategy stopped without emitting.
    pub next_tokens: Vec<u32>,
    /// Beam-survivor source rows; the KV caches must be gathered
    /// accordingly before the next step.
    pub reorder: Option<Vec<u32>>,
    /// True once every row is finished.
    pub finished: bool,
}

/// A pluggable decoder consuming per-row logits and the running sequences.
pub trait DecodingStrategy: Send {
    /// Called once when a decode loop starts, before any `advance`. Lets
    /// stateful strategies drop leftovers from a previous inference.
    fn begin(&mut self, _state: &SequenceState) {}

    /// Processes the last-position logits (`[rows, vocab]`) for one step.
    /// Implementations append to `state.rows` exactly when they emit.
    fn advance(&mut self, logits: ArrayView2<f32>, state: &mut SequenceState)
        -> Result<StrategyOutput>;

    /// The final sequence and score per batch row, called once after the
    /// loop stops. The default takes each batch row's first beam.
    fn finalize(&self, state: &SequenceState) -> Vec<(Vec<u32>, f32)> {
        (0..state.batch)
            .map(|b| {
                let r = b * state.beam;
                (state.rows[r].clone(), state.scores[r])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_replicates_prompts_across_beams() {
        let state = SequenceState::new(&[vec![1, 2], vec![3, 4]], 3, 8).unwrap();
        assert_eq!(state.num_rows(), 6);
        assert_eq!(state.rows[0], vec![1, 2]);
        assert_eq!(state.rows[2], vec![1, 2]);
        assert_eq!(state.rows[3], vec![3, 4]);
        assert_eq!(state.scores[0], 0.0);
        assert!(state.scores[1].is_infinite());
    }

    #[test]
    fn test_state_rejects_ragged_prompts() {
        assert!(SequenceState::new(&[vec![1], vec![2, 3]], 1, 8).is_err());
        assert!(SequenceState::new(&[], 1, 8).is_err());
        assert!(SequenceState::new(&[vec![1; 9]], 1, 8).is_err());
    }

    #[test]
    fn test_row_matrix_padding() {
        let state = SequenceState::new(&[vec![5, 6, 7]], 1, 6).unwrap();
        assert_eq!(state.to_row_matrix(0), vec![5, 6, 7, 0, 0, 0]);
    }
}
