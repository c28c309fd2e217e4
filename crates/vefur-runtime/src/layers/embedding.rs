//! Embedding launch layer: token ids to hidden states.

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame, VarId};
use crate::layers::Layer;
use crate::ops::{LookupOp, Op};
use crate::weights::ParamTable;

pub struct EmbeddingLayer {
    name: String,
    ops: Vec<Op>,
}

impl EmbeddingLayer {
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        ids: VarId,
        vocab: usize,
        hidden: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let lookup = LookupOp::wire(
            graph,
            &format!("{name}.lookup"),
            ids,
            vocab,
            hidden,
            max_rows,
            max_step,
        )?;
        Ok(Self {
            name: name.to_string(),
            ops: vec![Op::Lookup(lookup)],
        })
    }

    fn lookup(&self) -> &LookupOp {
        match &self.ops[0] {
            Op::Lookup(op) => op,
            _ => unreachable!("embedding layer wires a single lookup"),
        }
    }

    fn lookup_mut(&mut self) -> &mut LookupOp {
        match &mut self.ops[0] {
            Op::Lookup(op) => op,
            _ => unreachable!("embedding layer wires a single lookup"),
        }
    }

    pub fn out(&self) -> VarId {
        self.lookup().out()
    }

    /// The token table variable, shared with the tied vocabulary head.
    pub fn token_table(&self) -> VarId {
        self.lookup().tok_table()
    }
}

impl Layer for EmbeddingLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_params(
        &mut self,
        graph: &mut Graph,
        table: &ParamTable,
        offset: usize,
    ) -> Result<usize> {
        let tok = table.slot(offset)?.clone();
        let pos = table.slot(offset + 1)?.clone();
        self.lookup_mut().load_tables(graph, &tok, &pos)?;
        Ok(2)
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
