/// Per-step scalar parameters, passed by value to every `before_forward`.
///
/// `batch` is the number of active rows (batch x beam for the layer stack),
/// `seq_len` the number of tokens processed this step (full prompt during
/// prefill, 1 afterwards), `step_offset` the absolute position of the first
/// of those tokens, and `max_seq` the declared sequence capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepConfig {
    pub batch: usize,
    pub seq_len: usize,
    pub step_offset: usize,
    pub max_seq: usize,
}

impl StepConfig {
    /// Position one past the last token covered by this step.
    pub fn end_pos(&self) -> usize {
        self.step_offset + self.seq_len
    }

    /// Tokens processed this step across all rows.
    pub fn step_tokens(&self) -> usize {
        self.batch * self.seq_len
    }
}
