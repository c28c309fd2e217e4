//! Per-step command bracket.

use wgpu::CommandEncoder;

use crate::graph::Graph;

/// Collects the device work of one forward step and submits it as a single
/// command buffer. On the CPU device the frame is inert; operators execute
/// eagerly.
pub struct StepFrame {
    encoder: Option<CommandEncoder>,
    submitted: bool,
}

impl StepFrame {
    pub fn begin(graph: &Graph) -> Self {
        let encoder = match graph.gpu() {
            Some(gpu) if graph.is_built() => Some(gpu.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor {
                    label: Some("step frame encoder"),
                },
            )),
            _ => None,
        };
        Self {
            encoder,
            submitted: false,
        }
    }

    /// The active command encoder. Operators must only call this on the
    /// `Wgpu` device with a built graph.
    pub fn encoder(&mut self) -> &mut CommandEncoder {
        self.encoder
            .as_mut()
            .expect("no command encoder: frame is CPU-side or graph not built")
    }

    pub fn finish(mut self, graph: &Graph) {
        if let Some(encoder) = self.encoder.take() {
            let gpu = graph.gpu().expect("encoder without gpu context");
            gpu.queue.submit(Some(encoder.finish()));
        }
        self.submitted = true;
    }
}

impl Drop for StepFrame {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        if !self.submitted && self.encoder.is_some() {
            log::warn!("step frame dropped without submission; encoded work discarded");
        }
    }
}
