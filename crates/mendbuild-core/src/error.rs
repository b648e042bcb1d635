//! Error taxonomy for the build driver.

use std::path::PathBuf;

/// Errors produced while applying a fix rule's action.
///
/// A failing fix never aborts a run: the driver treats the rule as a
/// non-match for that attempt and logs the error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixError {
    #[error("required path does not exist: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("fix action for {var} has no entries")]
    EmptyEntries { var: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid value for {var}: {value}")]
    InvalidOverride { var: String, value: String },
}

/// Driver-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("invalid retry budget: {0}")]
    InvalidBudget(String),

    #[error("command has an empty program")]
    EmptyCommand,

    #[error("build plan has no steps")]
    EmptyPlan,

    #[error("build cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("build failed after {attempts} attempt(s) ({fixes_applied} fix(es) applied)")]
    Exhausted {
        attempts: u32,
        fixes_applied: u32,
        last_output: String,
    },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
