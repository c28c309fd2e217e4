//! Normalization operator.

use ndarray::Array2;

use crate::cpu;
use crate::error::{Error, Result};
use crate::gpu::kernels::GpuNorm;
use crate::graph::{Device, Graph, StepConfig, StepFrame, VarId};
use crate::tensor::DType;
use crate::weights::HostTensor;

/// LayerNorm centers and shifts; RMSNorm only rescales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

pub struct NormOp {
    name: String,
    input: VarId,
    gamma: VarId,
    beta: VarId,
    out: VarId,
    hidden: usize,
    max_rows: usize,
    max_step: usize,
    kind: NormKind,
    eps: f32,
    step: StepConfig,
    kernel: Option<GpuNorm>,
}

impl NormOp {
    #[allow(clippy::too_many_arguments)]
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        input: VarId,
        hidden: usize,
        kind: NormKind,
        eps: f32,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let gamma = graph.declare_allocated(&format!("{name}.gamma"), DType::F32, &[hidden])?;
        // RMSNorm has no shift; the zero-filled beta is inert for it.
        let beta = graph.declare_allocated(&format!("{name}.beta"), DType::F32, &[hidden])?;
        let out = graph.declare_allocated(
            &format!("{name}.out"),
            DType::F32,
            &[max_rows, max_step, hidden],
        )?;
        let kernel = graph.gpu().map(GpuNorm::new);

        Ok(Self {
            name: name.to_string(),
            input,
            gamma,
            beta,
            out,
            hidden,
            max_rows,
            max_step,
            kind,
            eps,
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
        gamma: &HostTensor,
        beta: Option<&HostTensor>,
    ) -> Result<()> {
        gamma.expect_shape(&[self.hidden])?;
        graph.write_f32(self.gamma, &gamma.data)?;
        match (self.kind, beta) {
            (NormKind::LayerNorm, Some(b)) => {
                b.expect_shape(&[self.hidden])?;
                graph.write_f32(self.beta, &b.data)
            }
            (NormKind::RmsNorm, None) => Ok(()),
            (NormKind::LayerNorm, None) => Err(Error::config(format!(
                "'{}': layer norm requires a bias table",
                self.name
            ))),
            (NormKind::RmsNorm, Some(_)) => Err(Error::config(format!(
                "'{}': rms norm has no bias table",
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
        graph.reshape(self.out, &[step.batch, step.seq_len, self.hidden])?;
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
        let gamma = graph.host_f32(self.gamma)?;
        let beta = graph.host_f32(self.beta)?;

        let x = Array2::from_shape_vec((m, self.hidden), x_data[..m * self.hidden].to_vec())
            .map_err(|e| Error::resource(e.to_string()))?;

        let out = match self.kind {
            NormKind::LayerNorm => cpu::layer_norm(x.view(), &gamma, &beta, self.eps),
            NormKind::RmsNorm => cpu::rms_norm(x.view(), &gamma, self.eps),
        };
        graph.write_f32(self.out, out.as_slice().expect("contiguous norm output"))
    }

    fn forward_gpu(&self, graph: &mut Graph, frame: &mut StepFrame) -> Result<()> {
        let kernel = self
            .kernel
            .as_ref()
            .expect("gpu norm kernel missing on wgpu device");
        kernel.encode(
            frame.encoder(),
            graph.wgpu_buffer(self.input)?,
            graph.wgpu_buffer(self.gamma)?,
            graph.wgpu_buffer(self.beta)?,
            graph.wgpu_buffer(self.out)?,
            self.step.step_tokens(),
            self.hidden,
            self.eps,
            self.kind == NormKind::RmsNorm,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphContext;

    fn run_norm(kind: NormKind, x: &[f32], gamma: &[f32], beta: Option<&[f32]>) -> Vec<f32> {
        let hidden = gamma.len();
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let input = graph
            .declare_allocated("x", DType::F32, &[1, 1, hidden])
            .unwrap();
        let mut op = NormOp::wire(&mut graph, "norm", input, hidden, kind, 1e-5, 1, 1).unwrap();
        graph.finish_build().unwrap();

        let g = HostTensor::new("gamma", vec![hidden], gamma.to_vec()).unwrap();
        let b = beta.map(|b| HostTensor::new("beta", vec![hidden], b.to_vec()).unwrap());
        op.load(&mut graph, &g, b.as_ref()).unwrap();

        graph.write_f32(input, x).unwrap();
        let step = StepConfig {
            batch: 1,
            seq_len: 1,
            step_offset: 0,
            max_seq: 1,
        };
        op.before_step(&mut graph, step).unwrap();
        let mut frame = StepFrame::begin(&graph);
        op.forward(&mut graph, &mut frame).unwrap();
        frame.finish(&graph);

        let out = graph.host_f32(op.out()).unwrap();
        out[..hidden].to_vec()
    }

    #[test]
    fn test_layer_norm_standardizes_row() {
        let out = run_norm(
            NormKind::LayerNorm,
            &[1.0, 2.0, 3.0, 4.0],
            &[1.0; 4],
            Some(&[0.0; 4]),
        );

        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_rms_norm_rescales_only() {
        let out = run_norm(NormKind::RmsNorm, &[3.0, 4.0], &[1.0, 2.0], None);
        let rms = 12.5f32.sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-4);
        assert!((out[1] - 8.0 / rms).abs() < 1e-4);
    }

    #[test]
    fn test_bias_presence_must_match_kind() {
        let mut graph = Graph::new(GraphContext::for_cpu()).unwrap();
        let input = graph.declare_allocated("x", DType::F32, &[1, 1, 2]).unwrap();
        let mut op = NormOp::wire(
            &mut graph,
            "norm",
            input,
            2,
            NormKind::LayerNorm,
            1e-5,
            1,
            1,
        )
        .unwrap();
        graph.finish_build().unwrap();

        let gamma = HostTensor::new("gamma", vec![2], vec![1.0, 1.0]).unwrap();
        assert!(op.load(&mut graph, &gamma, None).is_err());
    }
}
