//! Artifacts: the bytes a backup produces, and where they live
//!
//! - `adapter`: uniform access to the storage disks
//! - `checksum`: SHA-256 over stored artifacts
//! - `crypto`: optional per-disk encryption
//! - `archive`: tar.gz capture and apply for file backups
//! - `dump`: database dump and replay
//!
//! Artifacts are streamed: capture writes chunks into an [`ArtifactSink`]
//! that encrypts, hashes and uploads them as they come.

pub mod adapter;
pub mod archive;
pub mod checksum;
pub mod crypto;
pub mod dump;

pub use adapter::{
    ArtifactUpload, ArtifactWriter, ConnectionCheck, ConnectionReport, ObjectStoreAdapter,
    StorageAdapter, StorageRegistry, StoredArtifact,
};
pub use archive::ExcludeMatcher;
pub use dump::{CommandDumper, DatabaseDumper, DatabaseEngine, DatabaseTarget};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::VaultResult;
use crate::models::{Backup, BackupKind};

/// Destination for artifact bytes as they are produced
#[async_trait]
pub trait ArtifactSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> VaultResult<()>;
}

#[async_trait]
impl ArtifactSink for Vec<u8> {
    async fn write(&mut self, chunk: &[u8]) -> VaultResult<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Disk-relative artifact location:
/// `<kind>-backups/YYYY/MM/DD/<project>_<type>_<timestamp>_<backup>.<ext>`
pub fn artifact_path(backup: &Backup, at: DateTime<Utc>) -> String {
    let extension = match backup.kind {
        BackupKind::File => "tar.gz",
        BackupKind::Database => "sql.gz",
    };
    format!(
        "{}-backups/{}/{}_{}_{}_{}.{}",
        backup.kind,
        at.format("%Y/%m/%d"),
        backup.project_id.short(),
        backup.backup_type,
        at.format("%Y-%m-%d_%H%M%S"),
        backup.id.short(),
        extension
    )
}
