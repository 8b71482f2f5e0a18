//! Crate-level errors.
//!
//! Every diagnostic is intended to be enough for an operator to reproduce and
//! fix the condition on its own: expected paths, searched names and offending
//! values are embedded in the message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CsTracerError {
    /// The CPU architecture could not be classified into a trace-capable
    /// generation.
    #[error("could not determine CPU architecture: {0}")]
    ArchDetect(String),
    /// The sysfs device namespace is missing or unreadable.
    #[error("cannot scan trace topology: {0}")]
    Scan(String),
    /// No suitable sink, or an explicitly named device was absent.
    #[error("cannot select trace sink: {0}")]
    SinkSelect(String),
    /// The native decode engine (or its event queue) could not be allocated.
    #[error("decode engine allocation failed: {0}")]
    Allocation(String),
    /// The decode engine wasn't compiled in.
    #[error("decode engine unavailable: {0}")]
    EngineUnavailable(String),
    /// The native engine rejected trace bytes.
    #[error("decode error at stream offset {data_index}: {msg}")]
    Decode { msg: String, data_index: u64 },
    /// A binary image region could not be registered with the engine.
    #[error("cannot register image {filename}: {msg}")]
    ImageRegistration { filename: String, msg: String },
    /// Invalid configuration.
    #[error("{0}")]
    ConfigError(String),
}
