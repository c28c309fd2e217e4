//! Residual connection: elementwise sum of two parent variables.

use crate::error::{Error, Result};
use crate::gpu::kernels::GpuResidual;
use crate::graph::{Device, Graph, StepConfig, StepFrame, VarId};
use crate::tensor::DType;

pub struct ResidualOp {
    name: String,
    a: VarId,
    b: VarId,
    out: VarId,
    hidden: usize,
    max_rows: usize,
    max_step: usize,
    step: StepConfig,
    kernel: Option<GpuResidual>,
}

impl ResidualOp {
    pub fn wire(
        graph: &mut Graph,
        name: &str,
        a: VarId,
        b: VarId,
        hidden: usize,
        max_rows: usize,
        max_step: usize,
    ) -> Result<Self> {
        let out = graph.declare_allocated(
            &format!("{name}.out"),
            DType::F32,
            &[max_rows, max_step, hidden],
        )?;
        let kernel = graph.gpu().map(GpuResidual::new);

        Ok(Self {
            name: name.to_string(),
            a,
            b,
            out,
            hidden,
            max_rows,
            max_step,
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
        let total = self.step.step_tokens() * self.hidden;
        match graph.device() {
            Device::Cpu => {
                let a = graph.host_f32(self.a)?;
                let b = graph.host_f32(self.b)?;
                let out: Vec<f32> = a[..total]
                    .iter()
                    .zip(&b[..total])
                    .map(|(x, y)| x + y)
                    .collect();
                graph.write_f32(self.out, &out)
            }
            Device::Wgpu => {
                let kernel = self
                    .kernel
                    .as_ref()
                    .expect("gpu residual kernel missing on wgpu device");
                kernel.encode(
                    frame.encoder(),
                    graph.wgpu_buffer(self.a)?,
                    graph.wgpu_buffer(self.b)?,
                    graph.wgpu_buffer(self.out)?,
                    total,
                );
                Ok(())
            }
        }
    }
}
