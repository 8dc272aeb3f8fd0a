//! Error types for vector-quantize-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/backend error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration (construction-time, fatal).
    #[error("config: {0}")]
    Config(String),

    /// Batch statistics do not match the tracked codebooks (fatal).
    #[error("tracking: {0}")]
    Tracking(String),

    /// Saved optimizer state is incompatible with the live optimizer.
    #[error("state dict: {0}")]
    StateDict(String),

    /// Misuse of a stateful operation pairing (e.g. restore without apply).
    #[error("state: {0}")]
    State(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
