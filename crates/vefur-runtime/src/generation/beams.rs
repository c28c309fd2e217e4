//! Beam search over batched rows.
//!
//! Each batch row tracks `beam` candidate continuations ranked by
//! length-normalized cumulative log-probability. After every step the
//! candidates are pruned back to the beam width and the surviving rows'
//! source indices are reported so the KV caches can be gathered to match.

use ndarray::{Array1, ArrayView2};

use crate::cpu::log_softmax_1d;
use crate::error::{Error, Result};
use crate::generation::{DecodingStrategy, SequenceState, StrategyOutput};

#[derive(Clone, Debug)]
pub struct BeamHypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
}

impl BeamHypothesis {
    /// Cumulative log-probability divided by generated length raised to the
    /// normalization exponent.
    pub fn normalized_score(&self, length_penalty: f32, prompt_len: f32) -> f32 {
        let len = (self.tokens.len() as f32) - prompt_len;
        let lp = if len > 0.0 { len.powf(length_penalty) } else { 1.0 };
        self.score / lp
    }
}

/// Completed hypotheses for one batch row, capped at the beam width.
struct FinishedPool {
    hypotheses: Vec<BeamHypothesis>,
    length_penalty: f32,
    prompt_len: f32,
    beam: usize,
    worst_score: f32,
}

impl FinishedPool {
    fn new(beam: usize, length_penalty: f32, prompt_len: usize) -> Self {
        Self {
            hypotheses: Vec::with_capacity(beam),
            length_penalty,
            prompt_len: prompt_len as f32,
            beam,
            worst_score: f32::NEG_INFINITY,
        }
    }

    fn add(&mut self, hypothesis: BeamHypothesis) {
        if hypothesis.score == f32::NEG_INFINITY {
            return;
        }
        let score = hypothesis.normalized_score(self.length_penalty, self.prompt_len);
        if self.hypotheses.len() < self.beam || score > self.worst_score {
            self.hypotheses.push(hypothesis);
            self.hypotheses.sort_by(|a, b| {
                b.normalized_score(self.length_penalty, self.prompt_len)
                    .partial_cmp(&a.normalized_score(self.length_penalty, self.prompt_len))
                    .unwrap()
            });
            self.hypotheses.truncate(self.beam);
            self.worst_score = self
                .hypotheses
                .last()
                .map(|h| h.normalized_score(self.length_penalty, self.prompt_len))
                .unwrap_or(f32::NEG_INFINITY);
        }
    }

    fn is_full(&self) -> bool {
        self.hypotheses.len() >= self.beam
    }

    fn best(&self) -> Option<&BeamHypothesis> {
        self.hypotheses.first()
    }
}

pub struct BeamSearchStrategy {
    eos_id: u32,
    length_penalty: f32,
    pools: Vec<FinishedPool>,
}

impl BeamSearchStrategy {
    pub fn new(eos_id: u32, length_penalty: f32) -> Self {
        Self {
            eos_id,
            length_penalty,
            pools: Vec::new(),
        }
    }

    fn ensure_pools(&mut self, state: &SequenceState) {
        if self.pools.len() != state.batch {
            self.pools = (0..state.batch)
                .map(|_| FinishedPool::new(state.beam, self.length_penalty, state.prompt_len))
                .collect();
        }
    }
}

/// Candidate expansions for one batch row, ranked best-first.
fn expand_candidates(
    logits: &ArrayView2<f32>,
    state: &SequenceState,
    batch_row: usize,
) -> Vec<(f32, usize, u32)> {
    let beam = state.beam;
    let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(beam * beam * 2);

    for j in 0..beam {
        let row = batch_row * beam + j;
        if state.scores[row] == f32::NEG_INFINITY {
            continue;
        }

        let log_probs = log_softmax_1d(&Array1::from_vec(logits.row(row).to_vec()));
        let mut indexed: Vec<(usize, f32)> =
            log_probs.iter().cloned().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        indexed.truncate(beam * 2);

        for (token, lp) in indexed {
            candidates.push((state.scores[row] + lp, j, token as u32));
        }
    }

    candidates.sort_unstable_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    candidates.truncate(beam * 2);
    candidates
}

impl DecodingStrategy for BeamSearchStrategy {
    fn begin(&mut self, state: &SequenceState) {
        self.pools = (0..state.batch)
            .map(|_| FinishedPool::new(state.beam, self.length_penalty, state.prompt_len))
            .collect();
    }

    fn advance(
        &mut self,
        logits: ArrayView2<f32>,
        state: &mut SequenceState,
    ) -> Result<StrategyOutput> {
        let (batch, beam) = (state.batch, state.beam);
        if logits.nrows() != state.num_rows() {
            return Err(Error::config(format!(
                "logits rows {} do not match sequence rows {}",
                logits.nrows(),
                state.num_rows()
            )));
        }
        self.ensure_pools(state);

        let mut new_rows = Vec::with_capacity(batch * beam);
        let mut new_scores = Vec::with_capacity(batch * beam);
        let mut next_tokens = Vec::with_capacity(batch * beam);
        let mut reorder = Vec::with_capacity(batch * beam);
        let mut all_done = true;

        for b in 0..batch {
            let candidates = expand_candidates(&logits, state, b);

            let mut survivors = 0usize;
            for (global_rank, &(score, src_beam, token)) in candidates.iter().enumerate() {
                let src_row = b * beam + src_beam;
                if token == self.eos_id {
                    // Only top-ranked EOS candidates complete hypotheses.
                    if global_rank < beam {
                        let mut tokens = state.rows[src_row].clone();
                        tokens.push(token);
                        self.pools[b].add(BeamHypothesis { tokens, score });
                    }
                } else if survivors < beam {
                    let mut tokens = state.rows[src_row].clone();
                    tokens.push(token);
                    new_rows.push(tokens);
                    new_scores.push(score);
                    next_tokens.push(token);
                    reorder.push(src_row as u32);
                    survivors += 1;
                }
            }

            // Dead beams stay dead: pad with this row's best survivor (or an
            // EOS continuation when nothing survived) at -inf, keeping row
            // lengths uniform.
            while survivors < beam {
                let (template, token, src) = if survivors > 0 {
                    let t = new_rows[b * beam].clone();
                    let token = *t.last().unwrap();
                    (t, token, reorder[b * beam])
                } else {
                    let mut t = state.rows[b * beam].clone();
                    t.push(self.eos_id);
                    (t, self.eos_id, (b * beam) as u32)
                };
                new_rows.push(template);
                new_scores.push(f32::NEG_INFINITY);
                next_tokens.push(token);
                reorder.push(src);
                survivors += 1;
            }

            let row_done = self.pools[b].is_full()
                || (0..beam).all(|j| new_scores[b * beam + j] == f32::NEG_INFINITY);
            all_done &= row_done;
        }

        if all_done {
            return Ok(StrategyOutput {
                next_tokens: Vec::new(),
                reorder: None,
                finished: true,
            });
        }

        state.rows = new_rows;
        state.scores = new_scores;
        Ok(StrategyOutput {
            next_tokens,
            reorder: Some(reorder),
            finished: false,
        })
    }

    fn finalize(&self, state: &SequenceState) -> Vec<(Vec<u32>, f32)> {
        (0..state.batch)
            .map(|b| {
                if let Some(best) = self.pools.get(b).and_then(|p| p.best()) {
                    return (best.tokens.clone(), best.score);
                }
                // No finished hypothesis: fall back to the best live beam.
                let base = b * state.beam;
                let best = (0..state.beam)
                    .max_by(|&x, &y| {
                        state.scores[base + x]
                            .partial_cmp(&state.scores[base + y])
                            .unwrap()
                    })
                    .unwrap_or(0);
                (state.rows[base + best].clone(), state.scores[base + best])
            })
            .collect()
    }
}
