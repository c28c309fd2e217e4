//! Final normalization over the last hidden states.

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame, VarId};
use crate::layers::Layer;
use crate::ops::{NormKind, NormOp, Op};
use crate::weights::ParamTable;

pub struct FinalNormLayer {
    name: String,
    ops: Vec<Op>,
    norm_kind: NormKind,
}

impl FinalNormLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        hidden: usize,
        norm_kind: NormKind,
        norm_eps: f32,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let norm = NormOp::wire(
            graph,
            &format!("{name}.norm"),
            input,
            hidden,
            norm_kind,
            norm_eps,
            max_rows,
            max_step,
        )?;
        Ok(Self {
            name: name.to_string(),
            ops: vec![Op::Norm(norm)],
            norm_kind,
        })
    }

    pub fn out(&self) -> VarId {
        match &self.ops[0] {
            Op::Norm(op) => op.out(),
            _ => unreachable!("final norm wires a single norm"),
        }
    }
}

impl Layer for FinalNormLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_params(
        &mut self,
        graph: &mut Graph,
        table: &ParamTable,
        offset: usize,
    ) -> Result<usize> {
        let gamma = table.slot(offset)?.clone();
        let op = self.ops[0].as_norm_mut().expect("norm op index");
        match self.norm_kind {
            NormKind::LayerNorm => {
                let beta = table.slot(offset + 1)?.clone();
                op.load(graph, &gamma, Some(&beta))?;
                Ok(2)
            }
            NormKind::RmsNorm => {
                op.load(graph, &gamma, None)?;
                Ok(1)
            }
        }
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
