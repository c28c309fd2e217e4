//! Greedy and filtered-sampling decoders. Each row draws independently.

use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cpu::softmax_1d_inplace;
use crate::error::{Error, Result};
use crate::generation::{DecodingStrategy, SequenceState, StrategyOutput};

pub fn top_k_filtering(mut logits: Array1<f32>, k: usize) -> Array1<f32> {
    if k == 0 || k >= logits.len() {
        return logits;
    }
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
    logits
}

pub fn top_p_filtering(mut logits: Array1<f32>, p: f32) -> Array1<f32> {
    if p >= 1.0 {
        return logits;
    }
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());

    let mut probs = logits.to_vec();
    softmax_1d_inplace(&mut probs);

    let mut cumulative = 0.0;
    for (i, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            for &invalid in &indices[i + 1..] {
                logits[invalid] = f32::NEG_INFINITY;
            }
            break;
        }
    }
    logits
}

pub fn argmax(row: &[f32]) -> u32 {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(idx, _)| idx as u32)
        .expect("empty logits row")
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let uniform: f32 = rng.gen();
    let mut cumulative = 0.0;
    for (idx, &prob) in probs.iter().enumerate() {
        cumulative += prob;
        if cumulative >= uniform {
            return idx as u32;
        }
    }
    (probs.len() - 1) as u32
}

/// Picks the most likely token per row until every row has emitted EOS.
pub struct GreedyStrategy {
    eos_id: u32,
}

impl GreedyStrategy {
    pub fn new(eos_id: u32) -> Self {
        Self { eos_id }
    }
}

impl DecodingStrategy for GreedyStrategy {
    fn advance(
        &mut self,
        logits: ArrayView2<f32>,
        state: &mut SequenceState,
    ) -> Result<StrategyOutput> {
        emit_per_row(logits, state, self.eos_id, |row, _| Ok(argmax(row)))
    }
}

/// Draws from the top-k / top-p filtered, temperature-scaled distribution.
pub struct SamplingStrategy {
    eos_id: u32,
    temperature: f32,
    top_k: Option<usize>,
    top_p: Option<f32>,
    rng: StdRng,
}

impl SamplingStrategy {
    pub fn new(eos_id: u32, temperature: f32, top_k: Option<usize>, top_p: Option<f32>) -> Self {
        Self::with_seed(
            eos_id,
            temperature,
            top_k,
            top_p,
            rand::thread_rng().gen(),
        )
    }

    pub fn with_seed(
        eos_id: u32,
        temperature: f32,
        top_k: Option<usize>,
        top_p: Option<f32>,
        seed: u64,
    ) -> Self {
        Self {
            eos_id,
            temperature,
            top_k,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DecodingStrategy for SamplingStrategy {
    fn advance(
        &mut self,
        logits: ArrayView2<f32>,
        state: &mut SequenceState,
    ) -> Result<StrategyOutput> {
        let (temperature, top_k, top_p) = (self.temperature, self.top_k, self.top_p);
        let rng = &mut self.rng;
        emit_per_row(logits, state, self.eos_id, |row, _| {
            let mut filtered = Array1::from_vec(row.to_vec());
            if let Some(k) = top_k {
                filtered = top_k_filtering(filtered, k);
            }
            if let Some(p) = top_p {
                filtered = top_p_filtering(filtered, p);
            }

            // Temperature before softmax, guarding division by zero.
            let temp = if temperature < 1e-5 { 1.0 } else { temperature };
            filtered /= temp;

            let mut probs = filtered.to_vec();
            softmax_1d_inplace(&mut probs);
            Ok(sample_from_probs(&probs, rng))
        })
    }
}

/// Shared per-row emission loop: finished rows pad with EOS, everything else
/// asks the picker, and generation finishes once every row has hit EOS.
fn emit_per_row(
    logits: ArrayView2<f32>,
    state: &mut SequenceState,
    eos_id: u32,
    mut pick: impl FnMut(&[f32], usize) -> Result<u32>,
) -> Result<StrategyOutput> {
    let rows = state.num_rows();
    if logits.nrows() != rows {
        return Err(Error::config(format!(
            "logits rows {} do not match sequence rows {}",
            logits.nrows(),
            rows
        )));
    }

    let mut next_tokens = Vec::with_capacity(rows);
    for r in 0..rows {
        let token = if state.finished[r] {
            eos_id
        } else {
            let row = logits.row(r);
            pick(row.as_slice().expect("contiguous logits row"), r)?
        };
        if token == eos_id {
            state.finished[r] = true;
        }
        state.rows[r].push(token);
        next_tokens.push(token);
    }

    let finished = state.finished.iter().all(|&f| f);
    Ok(StrategyOutput {
        next_tokens,
        reorder: None,
        finished,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_top_k_keeps_k_largest() {
        let logits = array![1.0f32, 5.0, 3.0, 4.0, 2.0];
        let filtered = top_k_filtering(logits, 3);

        assert!(filtered[1].is_finite());
        assert!(filtered[3].is_finite());
        assert!(filtered[2].is_finite());
        assert_eq!(filtered[0], f32::NEG_INFINITY);
        assert_eq!(filtered[4], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_k_noop_when_k_covers_vocab() {
        let logits = array![1.0f32, 2.0, 3.0];
        let filtered = top_k_filtering(logits, 3);
        assert!(filtered.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let logits = array![1.0f32, 2.0, 10.0];
        let filtered = top_p_filtering(logits, 0.01);
        assert!(filtered[2].is_finite());
        assert_eq!(filtered[0], f32::NEG_INFINITY);
        assert_eq!(filtered[1], f32::NEG_INFINITY);
    }

    #[test]
    fn test_top_p_one_keeps_everything() {
        let logits = array![1.0f32, 2.0, 3.0, 4.0];
        let filtered = top_p_filtering(logits, 1.0);
        assert!(filtered.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_argmax_first_max() {
        assert_eq!(argmax(&[1.0, 5.0, 3.0]), 1);
        assert_eq!(argmax(&[7.0, 7.0, 1.0]), 0);
    }

    fn logits_for(rows: usize, vocab: usize, hot: &[usize]) -> Array2<f32> {
        let mut logits = Array2::zeros((rows, vocab));
        for (r, &h) in hot.iter().enumerate() {
            logits[[r, h]] = 10.0;
        }
        logits
    }

    #[test]
    fn test_greedy_emits_argmax_until_eos() {
        let mut state = SequenceState::new(&[vec![1, 2]], 1, 8).unwrap();
        let mut strategy = GreedyStrategy::new(0);

        let out = strategy
            .advance(logits_for(1, 5, &[3]).view(), &mut state)
            .unwrap();
        assert_eq!(out.next_tokens, vec![3]);
        assert!(!out.finished);
        assert_eq!(state.rows[0], vec![1, 2, 3]);

        let out = strategy
            .advance(logits_for(1, 5, &[0]).view(), &mut state)
            .unwrap();
        assert_eq!(out.next_tokens, vec![0]);
        assert!(out.finished);
    }

    #[test]
    fn test_finished_rows_pad_with_eos() {
        let mut state = SequenceState::new(&[vec![1], vec![1]], 1, 8).unwrap();
        state.finished[0] = true;
        let mut strategy = GreedyStrategy::new(9);

        let out = strategy
            .advance(logits_for(2, 10, &[4, 4]).view(), &mut state)
            .unwrap();
        assert_eq!(out.next_tokens, vec![9, 4]);
        assert!(!out.finished);
    }

    #[test]
    fn test_sampling_with_top_k_one_is_greedy() {
        let mut state = SequenceState::new(&[vec![1]], 1, 8).unwrap();
        let mut strategy = SamplingStrategy::with_seed(0, 0.7, Some(1), None, 42);

        for _ in 0..5 {
            let out = strategy
                .advance(logits_for(1, 6, &[2]).view(), &mut state)
                .unwrap();
            assert_eq!(*out.next_tokens.last().unwrap(), 2);
        }
    }

    #[test]
    fn test_sampling_row_count_mismatch_rejected() {
        let mut state = SequenceState::new(&[vec![1]], 1, 8).unwrap();
        let mut strategy = GreedyStrategy::new(0);
        let logits = Array2::<f32>::zeros((3, 4));
        assert!(strategy.advance(logits.view(), &mut state).is_err());
    }
}
