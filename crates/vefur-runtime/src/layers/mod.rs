//! Layers: fixed compositions of operators with the same wiring and
//! per-step contracts as a single operator.
//!
//! A layer's internal operator order is declared at wiring time and is
//! identical on every step. Parameters are consumed from an ordered table:
//! `load_params` returns the number of slots used so the caller can thread
//! a running offset across the stack.

pub mod decoder_layer;
pub mod embedding;
pub mod generator;
pub mod norm;
pub mod projection;

pub use decoder_layer::DecoderLayer;
pub use embedding::EmbeddingLayer;
pub use generator::{GeneratorLayer, StepDecision};
pub use norm::FinalNormLayer;
pub use projection::ProjectionLayer;

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame};
use crate::weights::ParamTable;

pub trait Layer {
    fn name(&self) -> &str;

    /// Consumes parameter slots starting at `offset`, returning how many
    /// were used.
    fn load_params(&mut self, graph: &mut Graph, table: &ParamTable, offset: usize)
        -> Result<usize>;

    /// Propagates the per-step scalars to every internal operator, in the
    /// declared order.
    fn before_forward(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()>;

    /// Executes the internal operators in the declared order.
    fn forward(&mut self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()>;
}
