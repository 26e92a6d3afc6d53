// src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradeError {
    #[error("Scope '{0}' could not be resolved")]
    ScopeNotFound(String),

    #[error("Checking logic raised an error: {0}")]
    Evaluation(String),

    #[error("Evaluation exceeded the time limit of {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("Failed to convert sandbox value: {0}")]
    Conversion(String),

    #[error("Grading spec has no `check` code")]
    MissingCheck,

    #[error("No user code has been run for this exercise yet")]
    NoPriorRun,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    JsonParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GradeError>;
