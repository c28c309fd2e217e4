//! vefur-runtime: a static-graph inference runtime for autoregressive
//! transformer decoding.
//!
//! The graph is wired once inside a build phase, with every buffer
//! allocated at its worst-case size; inference then re-executes the fixed
//! operator pipeline step after step, adjusting only logical shapes and
//! swapping the token ping-pong buffers between iterations.

pub mod cpu;
pub mod error;
pub mod generation;
pub mod gpu;
pub mod graph;
pub mod layers;
pub mod model;
pub mod ops;
pub mod tensor;
pub mod weights;

pub use error::{Error, Result};
pub use gpu::WgpuContext;
pub use graph::{Device, Graph, GraphContext, StepConfig, StepFrame, VarId};
pub use model::{DecodeState, DecoderConfig, DecoderModel, DecodingKind};
pub use tensor::DType;

// Prelude for easy imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::generation::{DecodingStrategy, SequenceState, StrategyOutput};
    pub use crate::gpu::WgpuContext;
    pub use crate::graph::{Device, Graph, GraphContext, StepConfig};
    pub use crate::model::{DecodeState, DecoderConfig, DecoderModel, DecodingKind};
    pub use crate::weights::{HostTensor, ParamTable};
}
