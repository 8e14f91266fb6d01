use std::path::PathBuf;

use thiserror::Error;

/// Boxed failure reported by an external collaborator (camera, transport).
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    Parse(String),
    #[error("{0}")]
    SchemaMismatch(String),
    #[error("{field} {reason}")]
    FieldOutOfRange { field: &'static str, reason: String },
    #[error("invalid {field} format `{value}`, expected HH:MM:SS")]
    BadTimeFormat { field: &'static str, value: String },
    #[error(transparent)]
    Io(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt state in {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("failed to program wake alarm: {0}")]
    WakeAlarm(String),
    #[error("failed to power off: {0}")]
    PowerOff(String),
}
