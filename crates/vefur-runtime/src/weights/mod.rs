//! Parameter tables.
//!
//! The serialized weight container and its parsing live outside this crate;
//! what arrives here is an ordered table of named host tensors. Layers
//! consume a contiguous range of slots via `load_params(table, offset)` and
//! return how many they used, so the model constructor can thread a running
//! offset across the layer stack.

use crate::error::{Error, Result};
use crate::model::config::DecoderConfig;
use crate::ops::NormKind;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

/// One named parameter tensor in host memory.
#[derive(Debug, Clone)]
pub struct HostTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::config(format!(
                "tensor shape {:?} implies {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            shape,
            data,
        })
    }

    pub fn expect_shape(&self, shape: &[usize]) -> Result<()> {
        if self.shape != shape {
            return Err(Error::config(format!(
                "tensor '{}' has shape {:?}, expected {:?}",
                self.name, self.shape, shape
            )));
        }
        Ok(())
    }
}

/// Ordered parameter slots for one model.
#[derive(Debug, Default)]
pub struct ParamTable {
    tensors: Vec<HostTensor>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tensor: HostTensor) {
        self.tensors.push(tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn slot(&self, index: usize) -> Result<&HostTensor> {
        self.tensors.get(index).ok_or_else(|| {
            Error::config(format!(
                "weight table slot {} out of range ({} slots)",
                index,
                self.tensors.len()
            ))
        })
    }

    /// A deterministic table matching `config`'s slot layout. Used by tests
    /// and demos in place of a parsed weight file.
    pub fn synthetic(config: &DecoderConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let init = Normal::new(0.0f32, 0.02).expect("valid init distribution");
        let mut table = ParamTable::new();
        let h = config.hidden_size;
        let inner = config.inner_size;

        let mut weight = |name: &str, shape: Vec<usize>, table: &mut ParamTable| -> Result<()> {
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n).map(|_| rng.sample(init)).collect();
            table.push(HostTensor::new(name, shape, data)?);
            Ok(())
        };

        weight("tok_embedding", vec![config.vocab_size, h], &mut table)?;
        weight("pos_embedding", vec![config.max_step, h], &mut table)?;

        push_norm_slots(&mut table, "final_norm", h, config.norm_kind)?;

        for i in 0..config.num_layers {
            push_norm_slots(&mut table, &format!("layer{i}.ln1"), h, config.norm_kind)?;
            weight(&format!("layer{i}.qkv_w"), vec![3 * h, h], &mut table)?;
            weight(&format!("layer{i}.qkv_b"), vec![3 * h], &mut table)?;
            weight(&format!("layer{i}.attn_out_w"), vec![h, h], &mut table)?;
            weight(&format!("layer{i}.attn_out_b"), vec![h], &mut table)?;
            push_norm_slots(&mut table, &format!("layer{i}.ln2"), h, config.norm_kind)?;
            weight(&format!("layer{i}.fc1_w"), vec![inner, h], &mut table)?;
            weight(&format!("layer{i}.fc1_b"), vec![inner], &mut table)?;
            weight(&format!("layer{i}.fc2_w"), vec![h, inner], &mut table)?;
            weight(&format!("layer{i}.fc2_b"), vec![h], &mut table)?;
        }

        Ok(table)
    }
}

fn push_norm_slots(
    table: &mut ParamTable,
    name: &str,
    hidden: usize,
    kind: NormKind,
) -> Result<()> {
    table.push(HostTensor::new(
        format!("{name}.gamma"),
        vec![hidden],
        vec![1.0; hidden],
    )?);
    if kind == NormKind::LayerNorm {
        table.push(HostTensor::new(
            format!("{name}.beta"),
            vec![hidden],
            vec![0.0; hidden],
        )?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_shape_validation() {
        assert!(HostTensor::new("x", vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(HostTensor::new("x", vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_slot_out_of_range() {
        let table = ParamTable::new();
        assert!(matches!(table.slot(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_synthetic_layout_is_deterministic() {
        let config = DecoderConfig::tiny_for_tests();
        let a = ParamTable::synthetic(&config, 7).unwrap();
        let b = ParamTable::synthetic(&config, 7).unwrap();

        assert_eq!(a.len(), b.len());
        assert_eq!(a.slot(0).unwrap().data, b.slot(0).unwrap().data);

        // 2 embeddings + 2 final norm + 12 per layer for layer norm models.
        assert_eq!(a.len(), 4 + 12 * config.num_layers);
    }
}
