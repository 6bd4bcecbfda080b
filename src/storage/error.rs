//! Storage layer error types.

use crate::object::Objnum;
use crate::value::InstanceKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Unknown instance kind: {0}")]
    UnknownInstance(InstanceKind),

    #[error("Checkpoint already in progress")]
    CheckpointInProgress,

    #[error("Cannot open checkpoint file {path:?}: {source}")]
    CheckpointOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Object not found: #{0}")]
    ObjectNotFound(Objnum),

    #[error("Object number already in use: #{0}")]
    ObjnumInUse(Objnum),

    #[error("Marker file error: {0}")]
    Marker(String),

    #[error("Index error: {0}")]
    Index(String),
}

impl StoreError {
    /// Errors after which the on-disk state can no longer be trusted. The
    /// owning runtime is expected to stop rather than carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Corrupt(_) | StoreError::Marker(_)
        )
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Index(e.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Terminate the process after a failure nobody can be told about.
pub(crate) fn fatal(err: &StoreError, during: &str) -> ! {
    log::error!("fatal storage error during {}: {}", during, err);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StoreError::Io(std::io::Error::other("disk")).is_fatal());
        assert!(StoreError::Corrupt("x".into()).is_fatal());
        assert!(!StoreError::CheckpointInProgress.is_fatal());
        assert!(!StoreError::ObjectNotFound(3).is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StoreError::ObjectNotFound(12).to_string(),
            "Object not found: #12"
        );
    }
}
