//! The decoder model: layer assembly, external contract and decode loop.

pub mod config;
pub mod decoder;

pub use config::{DecoderConfig, DecodingKind};
pub use decoder::{DecodeState, DecoderModel};
