use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing required columns, wrong file type, or no header at all.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Insufficient data: {0}")]
    DataSufficiency(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
