//! One pre-norm transformer decoder block.
//!
//! Operator order, fixed at wiring and identical on every step:
//! norm -> qkv projection -> attention -> output projection -> residual ->
//! norm -> feed-forward up (GELU) -> feed-forward down -> residual.

use crate::error::Result;
use crate::graph::{Graph, StepConfig, StepFrame, VarId};
use crate::layers::Layer;
use crate::ops::{AttentionOp, LinearOp, NormKind, NormOp, Op, ResidualOp};
use crate::weights::ParamTable;

/// Operator indices inside `ops`; the execution order is the vec order.
const LN1: usize = 0;
const QKV: usize = 1;
const ATTN: usize = 2;
const ATTN_OUT: usize = 3;
const FFN_LN: usize = 5;
const FC1: usize = 6;
const FC2: usize = 7;

pub struct DecoderLayer {
    name: String,
    ops: Vec<Op>,
    norm_kind: NormKind,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        hidden: usize,
        heads: usize,
        inner: usize,
        norm_kind: NormKind,
        norm_eps: f32,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let head_dim = hidden / heads;

        let ln1 = NormOp::wire(
            graph,
            &format!("{name}.ln1"),
            input,
            hidden,
            norm_kind,
            norm_eps,
            max_rows,
            max_step,
        )?;
        let qkv = LinearOp::wire(
            graph,
            &format!("{name}.qkv"),
            ln1.out(),
            hidden,
            3 * hidden,
            true,
            false,
            max_rows,
            max_step,
        )?;
        let attn = AttentionOp::wire(
            graph,
            &format!("{name}.attn"),
            qkv.out(),
            heads,
            head_dim,
            max_rows,
            max_step,
        )?;
        let attn_out = LinearOp::wire(
            graph,
            &format!("{name}.attn_out"),
            attn.out(),
            hidden,
            hidden,
            true,
            false,
            max_rows,
            max_step,
        )?;
        let res1 = ResidualOp::wire(
            graph,
            &format!("{name}.res1"),
            input,
            attn_out.out(),
            hidden,
            max_rows,
            max_step,
        )?;
        let ffn_ln = NormOp::wire(
            graph,
            &format!("{name}.ffn_ln"),
            res1.out(),
            hidden,
            norm_kind,
            norm_eps,
            max_rows,
            max_step,
        )?;
        let fc1 = LinearOp::wire(
            graph,
            &format!("{name}.fc1"),
            ffn_ln.out(),
            hidden,
            inner,
            true,
            true,
            max_rows,
            max_step,
        )?;
        let fc2 = LinearOp::wire(
            graph,
            &format!("{name}.fc2"),
            fc1.out(),
            inner,
            hidden,
            true,
            false,
            max_rows,
            max_step,
        )?;
        let res2 = ResidualOp::wire(
            graph,
            &format!("{name}.res2"),
            res1.out(),
            fc2.out(),
            hidden,
            max_rows,
            max_step,
        )?;

        Ok(Self {
            name: name.to_string(),
            ops: vec![
                Op::Norm(ln1),
                Op::Linear(qkv),
                Op::Attention(attn),
                Op::Linear(attn_out),
                Op::Residual(res1),
                Op::Norm(ffn_ln),
                Op::Linear(fc1),
                Op::Linear(fc2),
                Op::Residual(res2),
            ],
            norm_kind,
        })
    }

    pub fn out(&self) -> VarId {
        match &self.ops[8] {
            Op::Residual(op) => op.out(),
            _ => unreachable!("decoder block ends in a residual"),
        }
    }

    pub fn attention(&self) -> &AttentionOp {
        self.ops[ATTN].as_attention().expect("attention op index")
    }

    /// Gathers this block's KV cache rows to match the surviving beams.
    pub fn reorder_cache(
        &mut self,
        graph: &mut Graph,
        frame: &mut StepFrame,
        indices: VarId,
        rows: usize,
        filled: usize,
    ) -> Result<()> {
        self.ops[ATTN]
            .as_attention_mut()
            .expect("attention op index")
            .reorder_cache(graph, frame, indices, rows, filled)
    }

    fn load_norm(
        &mut self,
        graph: &mut Graph,
        table: &ParamTable,
        offset: usize,
        index: usize,
    ) -> Result<usize> {
        let gamma = table.slot(offset)?.clone();
        let op = self.ops[index].as_norm_mut().expect("norm op index");
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

    fn load_linear(
        &mut self,
        graph: &mut Graph,
        table: &ParamTable,
        offset: usize,
        index: usize,
    ) -> Result<usize> {
        let weight = table.slot(offset)?.clone();
        let bias = table.slot(offset + 1)?.clone();
        self.ops[index]
            .as_linear_mut()
            .expect("linear op index")
            .load(graph, &weight, Some(&bias))?;
        Ok(2)
    }
}

impl Layer for DecoderLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_params(
        &mut self,
        graph: &mut Graph,
        table: &ParamTable,
        offset: usize,
    ) -> Result<usize> {
        let mut used = 0;
        used += self.load_norm(graph, table, offset + used, LN1)?;
        used += self.load_linear(graph, table, offset + used, QKV)?;
        used += self.load_linear(graph, table, offset + used, ATTN_OUT)?;
        used += self.load_norm(graph, table, offset + used, FFN_LN)?;
        used += self.load_linear(graph, table, offset + used, FC1)?;
        used += self.load_linear(graph, table, offset + used, FC2)?;
        Ok(used)
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
