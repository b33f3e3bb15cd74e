//! Backup model
//!
//! One record per backup attempt. File and database backups share the same
//! shape and the same chain rules; only the capture and apply routines differ.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{BackupId, ProjectId};
use crate::error::VaultError;

/// What a backup captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Logical database dump
    Database,
    /// Project file tree
    File,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::File => write!(f, "file"),
        }
    }
}

impl FromStr for BackupKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "database" | "db" => Ok(Self::Database),
            "file" | "files" => Ok(Self::File),
            other => Err(VaultError::Validation(format!("Unknown backup kind: {}", other))),
        }
    }
}

/// Position of a backup in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Chain root, self-contained
    Full,
    /// Delta on top of its parent
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for BackupType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" | "inc" => Ok(Self::Incremental),
            other => Err(VaultError::Validation(format!("Unknown backup type: {}", other))),
        }
    }
}

/// Storage backend holding the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageDisk {
    #[default]
    Local,
    S3,
    Gcs,
    Azure,
}

impl fmt::Display for StorageDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
            Self::Gcs => write!(f, "gcs"),
            Self::Azure => write!(f, "azure"),
        }
    }
}

impl FromStr for StorageDisk {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            "azure" => Ok(Self::Azure),
            other => Err(VaultError::Validation(format!("Unknown storage disk: {}", other))),
        }
    }
}

/// Lifecycle state of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    /// Completed and failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves: pending → running | failed, running → completed | failed
    pub fn can_transition_to(&self, target: BackupStatus) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One file inside a file-kind artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the backed-up root, `/`-separated
    pub path: String,
    /// Size in bytes
    pub size: u64,
}

/// A single backup attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    /// Unique identifier
    pub id: BackupId,

    /// Owning project
    pub project_id: ProjectId,

    /// Database or file backup
    pub kind: BackupKind,

    /// Full or incremental
    #[serde(rename = "type")]
    pub backup_type: BackupType,

    /// Parent in the chain (incremental only)
    #[serde(default)]
    pub parent_backup_id: Option<BackupId>,

    /// Backend holding the artifact
    pub storage_disk: StorageDisk,

    /// Backend-relative artifact location
    pub storage_path: String,

    #[serde(default)]
    pub size_bytes: Option<u64>,

    #[serde(default)]
    pub files_count: Option<u64>,

    #[serde(default)]
    pub database_name: Option<String>,

    /// SHA-256 of the stored artifact, hex encoded
    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    pub manifest: Option<Vec<ManifestEntry>>,

    pub status: BackupStatus,

    pub created_at: DateTime<Utc>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Set while retention removes the artifact; no new child may attach
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleting: bool,
}

impl Backup {
    /// Create a pending backup record
    pub fn pending(
        project_id: ProjectId,
        kind: BackupKind,
        backup_type: BackupType,
        parent_backup_id: Option<BackupId>,
        storage_disk: StorageDisk,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BackupId::new(),
            project_id,
            kind,
            backup_type,
            parent_backup_id,
            storage_disk,
            storage_path: String::new(),
            size_bytes: None,
            files_count: None,
            database_name: None,
            checksum: None,
            manifest: None,
            status: BackupStatus::Pending,
            created_at: now,
            started_at: now,
            completed_at: None,
            error_message: None,
            deleting: false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    pub fn is_running(&self) -> bool {
        self.status == BackupStatus::Running
    }

    pub fn is_full(&self) -> bool {
        self.backup_type == BackupType::Full
    }

    /// Same project and kind, i.e. the same mutual-exclusion slot
    pub fn same_slot(&self, project_id: ProjectId, kind: BackupKind) -> bool {
        self.project_id == project_id && self.kind == kind
    }

    /// Record a successful run
    pub fn mark_completed(
        &mut self,
        checksum: String,
        size_bytes: u64,
        manifest: Option<Vec<ManifestEntry>>,
        at: DateTime<Utc>,
    ) {
        self.files_count = manifest.as_ref().map(|m| m.len() as u64);
        self.manifest = manifest;
        self.checksum = Some(checksum);
        self.size_bytes = Some(size_bytes);
        self.status = BackupStatus::Completed;
        self.completed_at = Some(at);
        self.error_message = None;
    }

    /// Record a failed run; any completion data is cleared
    pub fn mark_failed(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.status = BackupStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(at);
        self.checksum = None;
        self.size_bytes = None;
        self.manifest = None;
        self.files_count = None;
    }

    /// Wall-clock duration of a finished run
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }

    /// Check the record-level invariants
    pub fn validate(&self) -> Result<(), VaultError> {
        match (self.backup_type, self.parent_backup_id) {
            (BackupType::Full, Some(_)) => {
                return Err(VaultError::InvalidParentBackup {
                    reason: "a full backup cannot have a parent".into(),
                })
            }
            (BackupType::Incremental, None) => {
                return Err(VaultError::InvalidParentBackup {
                    reason: "an incremental backup requires a parent".into(),
                })
            }
            _ => {}
        }

        if self.parent_backup_id == Some(self.id) {
            return Err(VaultError::InvalidParentBackup {
                reason: "a backup cannot be its own parent".into(),
            });
        }

        let has_result = self.checksum.is_some() || self.size_bytes.is_some();
        if has_result != self.is_completed() {
            return Err(VaultError::Validation(format!(
                "backup {} is {} but checksum/size presence is {}",
                self.id, self.status, has_result
            )));
        }

        Ok(())
    }
}
