//! Vocabulary projection: hidden states to logits.
//!
//! The projection weight is tied to the token embedding table, so this
//! layer consumes no parameter slots of its own.

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame, VarId};
use crate::layers::Layer;
use crate::ops::{LinearOp, Op};
use crate::weights::ParamTable;

pub struct ProjectionLayer {
    name: String,
    ops: Vec<Op>,
}

impl ProjectionLayer {
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        tok_table: VarId,
        hidden: usize,
        vocab: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let linear = LinearOp::wire_shared(
            graph,
            &format!("{name}.logits"),
            input,
            tok_table,
            hidden,
            vocab,
            max_rows,
            max_step,
        )?;
        Ok(Self {
            name: name.to_string(),
            ops: vec![Op::Linear(linear)],
        })
    }

    pub fn out(&self) -> VarId {
        match &self.ops[0] {
            Op::Linear(op) => op.out(),
            _ => unreachable!("projection wires a single linear"),
        }
    }
}

impl Layer for ProjectionLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_params(&mut self, _graph: &mut Graph, _table: &ParamTable, _offset: usize) -> Result<usize> {
        // Weight is shared with the embedding table.
        Ok(0)
    }

    fn before_forward(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()> {
        for op in &mut self.ops {
            op.before_step(graph, step)?;
        }
        Ok(())
    }

    fn forward(&mut self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        for op in &mut self.ops {
            op.forward(graph, frame)?;
        }
        Ok(())
    }
}
