//! Linear projection operator: `y = x @ W^T + b`, weights in the `[out, in]`
//! convention, with optional fused GELU.

use ndarray::Array2;

use crate::cpu;
use crate::error::{Error, Result};
use crate::gpu::kernels::GpuLinear;
use crate::graph::{Device, Graph, StepConfig, StepFrame, VarId};
use crate::tensor::DType;
use crate::weights::HostTensor;

pub struct LinearOp {
    name: String,
    input: VarId,
    weight: VarId,
    bias: Option<VarId>,
    out: VarId,
    in_features: usize,
    out_features: usize,
    max_rows: usize,
    max_step: usize,
    activate: bool,
    /// Tied projections borrow their weight from another operator.
    owns_weight: bool,
    step: StepConfig,
    kernel: Option<GpuLinear>,
}

impl LinearOp {
    #[allow(clippy::too_many_arguments)]
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        activate: bool,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let weight = graph.declare_allocated(
            &format!("{name}.weight"),
            DType::F32,
            &[out_features, in_features],
        )?;
        let bias = if with_bias {
            Some(graph.declare_allocated(&format!("{name}.bias"), DType::F32, &[out_features])?)
        } else {
            None
        };
        Self::finish_wire(
            graph,
            name,
            input,
            weight,
            bias,
            in_features,
            out_features,
            activate,
            true,
            max_rows,
            max_step,
        )
    }

    /// Wires a projection that shares an existing `[out, in]` weight
    /// variable (the tied vocabulary head).
    #[allow(clippy::too_many_arguments)]
    pub fn wire_shared(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        weight: VarId,
        in_features: usize,
        out_features: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        Self::finish_wire(
            graph,
            name,
            input,
            weight,
            None,
            in_features,
            out_features,
            false,
            false,
            max_rows,
            max_step,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        weight: VarId,
        bias: Option<VarId>,
        in_features: usize,
        out_features: usize,
        activate: bool,
        owns_weight: bool,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let out = graph.declare_allocated(
            &format!("{name}.out"),
            DType::F32,
            &[max_rows, max_step, out_features],
        )?;
        let kernel = graph.gpu().map(GpuLinear::new);

        Ok(Self {
            name: name.to_string(),
            input,
            weight,
            bias,
            out,
            in_features,
            out_features,
            max_rows,
            max_step,
            activate,
            owns_weight,
            step: StepConfig {
                batch: 0,
                seq_len: 0,
                step_offset: 0,
                max_seq: max_step,
            },
            kernel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out(&self) -> VarId {
        self.out
    }

    pub fn load(
        &mut self,
        graph: &mut Graph,
        weight: &HostTensor,
        bias: Option<&HostTensor>,
    ) -> Result<()> {
        if !self.owns_weight {
            return Err(Error::config(format!(
                "'{}': projection weight is tied, nothing to load",
                self.name
            )));
        }
        weight.expect_shape(&[self.out_features, self.in_features])?;
        graph.write_f32(self.weight, &weight.data)?;

        match (self.bias, bias) {
            (Some(var), Some(tensor)) => {
                tensor.expect_shape(&[self.out_features])?;
                graph.write_f32(var, &tensor.data)
            }
            (None, None) => Ok(()),
            _ => Err(Error::config(format!(
                "'{}': bias presence does not match wiring",
                self.name
            ))),
        }
    }

    pub fn before_step(&mut self, graph: &mut Graph, step: StepConfig) -> Result<()> {
        if step.batch > self.max_rows || step.seq_len > self.max_step {
            return Err(Error::config(format!(
                "'{}': step {:?} outside wired bounds (rows {}, steps {})",
                self.name, step, self.max_rows, self.max_step
            )));
        }
        graph.reshape(self.out, &[step.batch, step.seq_len, self.out_features])?;
        self.step = step;
        Ok(())
    }

    pub fn forward(&mut self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        match graph.device() {
            Device::Cpu => self.forward_cpu(graph),
            Device::Wgpu => self.forward_gpu(graph, frame),
        }
    }

    fn forward_cpu(&self, graph: &mut Graph) -> Result<()> {
        let m = self.step.step_tokens();
        let x_data = graph.host_f32(self.input)?;
        let w_data = graph.host_f32(self.weight)?;
        let bias = match self.bias {
            Some(var) => Some(graph.host_f32(var)?),
            None => None,
        };

        let x = Array2::from_shape_vec((m, self.in_features), x_data[..m * self.in_features].to_vec())
            .map_err(|e| Error::resource(e.to_string()))?;
        let w = Array2::from_shape_vec(
            (self.out_features, self.in_features),
            w_data[..self.out_features * self.in_features].to_vec(),
        )
        .map_err(|e| Error::resource(e.to_string()))?;

        let out = cpu::matmul_bt(x.view(), w.view(), bias.as_deref(), self.activate);
        graph.write_f32(self.out, out.as_slice().expect("contiguous matmul output"))
    }

    fn forward_gpu(&self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        let kernel = self
            .kernel
            .as_ref()
            .expect("gpu linear kernel missing on wgpu device");
        let bias = match self.bias {
            Some(var) => Some(graph.wgpu_buffer(var)?),
            None => None,
        };
        kernel.encode(
            frame.encoder(),
            graph.wgpu_buffer(self.input)?,
            graph.wgpu_buffer(self.weight)?,
            bias,
            graph.wgpu_buffer(self.out)?,
            self.step.step_tokens(),
            self.in_features,
            self.out_features,
            self.activate,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphContext;

    fn run_linear(with_bias: bool, x: &[f32], w: &[f32], b: Option<&[f32]>) -> Vec<f32> {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let input = graph.declare_allocated("x", DType::F32, &[1, 2, 3]).unwrap();
        let mut op =
            LinearOp::wire(&mut graph, "lin", input, 3, 2, with_bias, false, 1, 2).unwrap();
        graph.finish_build().unwrap();

        let weight = HostTensor::new("w", vec![2, 3], w.to_vec()).unwrap();
        let bias = b.map(|b| HostTensor::new("b", vec![2], b.to_vec()).unwrap());
        op.load(&mut graph, &weight, bias.as_ref()).unwrap();

        graph.write_f32(input, x).unwrap();
        let step = StepConfig {
            batch: 1,
            seq_len: 2,
            step_offset: 0,
            max_seq: 2,
        };
        op.before_step(&mut graph, step).unwrap();
        let mut frame = StepFrame::begin(&graph);
        op.forward(&mut graph, &mut frame).unwrap();
        frame.finish(&graph);

        let out = graph.host_f32(op.out()).unwrap();
        out[..4].to_vec()
    }

    #[test]
    fn test_projects_against_out_in_weight() {
        // x [2,3], w [2,3]: y[i,j] = x[i,:] . w[j,:]
        let out = run_linear(
            false,
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0],
            None,
        );
        assert_eq!(out, vec![1.0, 5.0, 4.0, 11.0]);
    }

    #[test]
    fn test_bias_added_per_feature() {
        let out = run_linear(
            true,
            &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0],
            Some(&[10.0, -10.0]),
        );
        assert_eq!(out, vec![11.0, -8.0, 11.0, -8.0]);
    }

    #[test]
    fn test_tied_projection_rejects_load() {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let input = graph.declare_allocated("x", DType::F32, &[1, 2, 3]).unwrap();
        let table = graph.declare_allocated("emb", DType::F32, &[4, 3]).unwrap();
        let mut op = LinearOp::wire_shared(&mut graph, "head", input, table, 3, 4, 1, 2).unwrap();
        graph.finish_build().unwrap();

        let weight = HostTensor::new("w", vec![4, 3], vec![0.0; 12]).unwrap();
        assert!(op.load(&mut graph, &weight, None).is_err());
    }

    #[test]
    fn test_step_outside_wired_bounds_rejected() {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let input = graph.declare_allocated("x", DType::F32, &[1, 2, 3]).unwrap();
        let mut op = LinearOp::wire(&mut graph, "lin", input, 3, 2, false, false, 1, 2).unwrap();
        graph.finish_build().unwrap();

        let step = StepConfig {
            batch: 2,
            seq_len: 1,
            step_offset: 0,
            max_seq: 2,
        };
        assert!(op.before_step(&mut graph, step).is_err());
    }
}
