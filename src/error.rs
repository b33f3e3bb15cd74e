//! Error types for chainvault
//!
//! One error enum covers the whole backup core. The chain, retention and
//! restore failures carry the ids of the records involved so callers can
//! report which backup in a chain caused the problem.

use thiserror::Error;

/// The main error type for chainvault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// Incremental backup without a usable parent, or full backup with one
    #[error("Invalid parent backup: {reason}")]
    InvalidParentBackup { reason: String },

    /// Another backup of the same project and kind holds the running slot
    #[error("A {kind} backup is already running for project {project_id}")]
    BackupAlreadyRunning { project_id: String, kind: String },

    /// Plain delete of a backup that other backups depend on
    #[error("Backup {backup_id} has {dependents} dependent backup(s); delete with cascade to remove them")]
    BackupHasDependents { backup_id: String, dependents: usize },

    /// Restore chain could not be resolved back to a completed full backup
    #[error("Broken backup chain at {backup_id}: {reason}")]
    BrokenChain { backup_id: String, reason: String },

    /// Stored artifact does not match its recorded checksum
    #[error("Checksum mismatch for backup {backup_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        backup_id: String,
        expected: String,
        actual: String,
    },

    /// Restore would overwrite existing data
    #[error("Restore destination already contains {path}; use overwrite to replace it")]
    DestinationConflict { path: String },

    /// Failure reported by a storage backend
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Artifact encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Invalid frequency/time/retention combination
    #[error("Schedule misconfigured: {0}")]
    ScheduleMisconfigured(String),

    /// Backup run aborted by an operator or by its run-duration limit
    #[error("{0}")]
    Cancelled(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),

    /// Validation errors for requests and records
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity not found errors
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    /// Duplicate entity errors
    #[error("{entity_type} already exists: {identifier}")]
    Duplicate {
        entity_type: &'static str,
        identifier: String,
    },

    /// Record store errors
    #[error("Storage error: {0}")]
    Storage(String),
}

impl VaultError {
    /// Create a "not found" error for backups
    pub fn backup_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Backup",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for schedules
    pub fn schedule_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Schedule",
            identifier: identifier.into(),
        }
    }

    /// Create a "not found" error for projects
    pub fn project_not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: "Project",
            identifier: identifier.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors returned synchronously to the caller and never retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidParentBackup { .. }
                | Self::BackupAlreadyRunning { .. }
                | Self::BackupHasDependents { .. }
                | Self::DestinationConflict { .. }
                | Self::Validation(_)
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<object_store::Error> for VaultError {
    fn from(err: object_store::Error) -> Self {
        Self::StorageIo(err.to_string())
    }
}

/// Result type alias for chainvault operations
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::Config("test error".into());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_not_found_error() {
        let err = VaultError::backup_not_found("bak-1234");
        assert_eq!(err.to_string(), "Backup not found: bak-1234");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_checksum_mismatch_names_backup() {
        let err = VaultError::ChecksumMismatch {
            backup_id: "bak-42".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.to_string().contains("bak-42"));
    }

    #[test]
    fn test_cancelled_displays_bare_reason() {
        let err = VaultError::Cancelled("cancelled".into());
        assert_eq!(err.to_string(), "cancelled");
    }

    #[test]
    fn test_validation_classification() {
        assert!(VaultError::BackupHasDependents {
            backup_id: "bak-1".into(),
            dependents: 2
        }
        .is_validation());
        assert!(!VaultError::StorageIo("boom".into()).is_validation());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VaultError = io_err.into();
        assert!(matches!(err, VaultError::Io(_)));
    }
}
