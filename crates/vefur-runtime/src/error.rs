//! Error types for the runtime.

use thiserror::Error;

/// Errors surfaced by the graph runtime and the model interface.
///
/// Configuration errors (bad slot index, wrong phase, invalid shapes) are
/// detected synchronously at the call site and are never retried. Resource
/// errors (allocation failure, capacity overruns, device faults) are fatal
/// for the model instance that hit them.
#[derive(Debug, Error)]
pub enum Error {
    /// Misuse of the engine API detected at the call site.
    #[error("configuration error: {0}")]
    Config(String),

    /// An input slot index outside the declared input set.
    #[error("invalid input index {0}")]
    InvalidInputIndex(usize),

    /// An output slot index outside the declared output set.
    #[error("invalid output index {0}")]
    InvalidOutputIndex(usize),

    /// Device memory may only be allocated while the graph is building.
    #[error("phase error: {0}")]
    Phase(String),

    /// A logical shape implied more elements than the buffer was allocated for.
    #[error("capacity exceeded: shape {shape:?} implies {requested} elements, capacity is {capacity}")]
    Capacity {
        shape: Vec<usize>,
        requested: usize,
        capacity: usize,
    },

    /// Device-side allocation or execution failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Lower-level failure from the device stack.
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    /// True for errors caused by host-side misuse rather than the device.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidInputIndex(_)
                | Error::InvalidOutputIndex(_)
                | Error::Phase(_)
        )
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
