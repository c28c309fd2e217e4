//! Model hyperparameters.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::generation::{BeamSearchStrategy, DecodingStrategy, GreedyStrategy, SamplingStrategy};
use crate::ops::NormKind;

/// Which decoder the generator layer runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodingKind {
    Greedy,
    Sampling {
        temperature: f32,
        top_k: Option<usize>,
        top_p: Option<f32>,
    },
    BeamSearch {
        /// Length-normalization exponent for hypothesis scores.
        length_penalty: f32,
    },
}

/// Static hyperparameters of a decoder model. Buffer capacities derive from
/// the declared maxima; nothing here changes after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub inner_size: usize,

    pub max_batch_size: usize,
    pub max_step: usize,
    pub beam_width: usize,

    pub padding_id: u32,
    pub eos_id: u32,

    pub norm_kind: NormKind,
    pub norm_eps: f32,

    pub decoding: DecodingKind,
}

impl DecoderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("bad model config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Worst-case row count: batch x beam.
    pub fn max_rows(&self) -> usize {
        self.max_batch_size * self.beam_width
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.hidden_size == 0
            || self.num_layers == 0
            || self.num_heads == 0
            || self.inner_size == 0
            || self.max_batch_size == 0
            || self.max_step == 0
        {
            return Err(Error::config("model dimensions must be non-zero"));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(Error::config(format!(
                "hidden size {} is not divisible by {} heads",
                self.hidden_size, self.num_heads
            )));
        }
        if self.beam_width == 0 {
            return Err(Error::config("beam width must be at least 1"));
        }
        if !matches!(self.decoding, DecodingKind::BeamSearch { .. }) && self.beam_width != 1 {
            return Err(Error::config(
                "beam width above 1 requires the beam search decoder",
            ));
        }
        if self.padding_id as usize >= self.vocab_size || self.eos_id as usize >= self.vocab_size {
            return Err(Error::config("special token ids must be inside the vocabulary"));
        }
        Ok(())
    }

    /// Builds the decoding strategy this config names.
    pub fn strategy(&self) -> Box<dyn DecodingStrategy> {
        match &self.decoding {
            DecodingKind::Greedy => Box::new(GreedyStrategy::new(self.eos_id)),
            DecodingKind::Sampling {
                temperature,
                top_k,
                top_p,
            } => Box::new(SamplingStrategy::new(self.eos_id, *temperature, *top_k, *top_p)),
            DecodingKind::BeamSearch { length_penalty } => {
                Box::new(BeamSearchStrategy::new(self.eos_id, *length_penalty))
            }
        }
    }

    /// A small greedy model used across the test suite.
    pub fn tiny_for_tests() -> Self {
        Self {
            vocab_size: 128,
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            inner_size: 32,
            max_batch_size: 2,
            max_step: 8,
            beam_width: 1,
            padding_id: 0,
            eos_id: 1,
            norm_kind: NormKind::LayerNorm,
            norm_eps: 1e-5,
            decoding: DecodingKind::Greedy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_tiny() {
        DecoderConfig::tiny_for_tests().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        let mut config = DecoderConfig::tiny_for_tests();
        config.num_heads = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_beam_without_beam_decoder() {
        let mut config = DecoderConfig::tiny_for_tests();
        config.beam_width = 4;
        assert!(config.validate().is_err());

        config.decoding = DecodingKind::BeamSearch { length_penalty: 1.0 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = DecoderConfig::tiny_for_tests();
        let json = serde_json::to_string(&config).unwrap();
        let back = DecoderConfig::from_json(&json).unwrap();
        assert_eq!(back.hidden_size, config.hidden_size);
        assert_eq!(back.max_step, config.max_step);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(DecoderConfig::from_json("{\"vocab_size\": 1}").is_err());
    }
}
