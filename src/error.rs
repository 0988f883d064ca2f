//! Error types for ferrite-sep

use thiserror::Error;

/// Error type for training, evaluation and data loading.
#[derive(Debug, Error)]
pub enum Error {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A required configuration key is absent
    #[error("missing required config key `{0}`")]
    MissingConfig(String),

    /// A configuration value is present but unusable
    #[error("Config error: {0}")]
    Config(String),

    /// `optim.type` names no known optimizer
    #[error("unknown optimizer type `{0}` (expected SGD, Adam or ranger)")]
    UnknownOptimizer(String),

    /// A dataset name resolves to no corpus handler
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),

    /// Resume requested against a missing experiment directory
    #[error("cannot resume: experiment directory `{0}` does not exist")]
    ResumeNotFound(String),

    /// Audio decoding failed
    #[error("Audio error: {0}")]
    Audio(String),

    /// Tensor shapes disagree
    #[error("Shape error: {0}")]
    Shape(String),

    /// Checkpoint could not be written, read or applied
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Dataset content or loader failure
    #[error("Data error: {0}")]
    Data(String),
}

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::Audio(e.to_string())
    }
}

/// Result type for ferrite-sep operations
pub type Result<T> = std::result::Result<T, Error>;
