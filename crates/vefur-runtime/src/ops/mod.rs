//! Graph operators.
//!
//! The operator set is closed: one variant per supported kernel family,
//! dispatched exhaustively. Every operator is wired into the graph exactly
//! once during the build phase (declaring its output variables at worst-case
//! capacity); afterwards only its per-step scalars and the logical shapes of
//! its variables change.
//!
//! `forward` is a no-op while the graph is still building: the wiring pass
//! exists to establish shapes and types before device memory is live.
//! `backward` is retained for interface symmetry; inference graphs never
//! call it with gradients allocated.

pub mod attention;
pub mod linear;
pub mod lookup;
pub mod norm;
pub mod residual;

pub use attention::AttentionOp;
pub use linear::LinearOp;
pub use lookup::LookupOp;
pub use norm::{NormKind, NormOp};
pub use residual::ResidualOp;

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame};

/// The closed set of operator kernel families.
pub enum Op {
    Lookup(LookupOp),
    Linear(LinearOp),
    Norm(NormOp),
    Residual(ResidualOp),
    Attention(AttentionOp),
}

impl Op {
    pub fn name(&self) -> &str {
        match self {
            Op::Lookup(op) => op.name(),
            Op::Linear(op) => op.name(),
            Op::Norm(op) => op.name(),
            Op::Residual(op) => op.name(),
            Op::Attention(op) => op.name(),
        }
    }

    /// Sets the per-step scalars and reshapes the output variables. Must be
    /// called before every `forward`; parameters are checked against the
    /// bounds declared at wiring time.
    pub fn before_step(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()> {
        match self {
            Op::Lookup(op) => op.before_step(graph, step),
            Op::Linear(op) => op.before_step(graph, step),
            Op::Norm(op) => op.before_step(graph, step),
            Op::Residual(op) => op.before_step(graph, step),
            Op::Attention(op) => op.before_step(graph, step),
        }
    }

    pub fn forward(&mut self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        if !graph.is_built() {
            return Ok(());
        }
        match self {
            Op::Lookup(op) => op.forward(graph, frame),
            Op::Linear(op) => op.forward(graph, frame),
            Op::Norm(op) => op.forward(graph, frame),
            Op::Residual(op) => op.forward(graph, frame),
            Op::Attention(op) => op.forward(graph, frame),
        }
    }

    pub fn backward(&mut self, _graph: &mut Graph, _frame: &mut StepFrame) -> Result<()> {
        Ok(())
    }

    pub fn as_linear_mut(&mut self) -> Option<&mut LinearOp> {
        match self {
            Op::Linear(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_norm_mut(&mut self) -> Option<&mut NormOp> {
        match self {
            Op::Norm(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_attention(&self) -> Option<&AttentionOp> {
        match self {
            Op::Attention(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_attention_mut(&mut self) -> Option<&mut AttentionOp> {
        match self {
            Op::Attention(op) => Some(op),
            _ => None,
        }
    }
}
