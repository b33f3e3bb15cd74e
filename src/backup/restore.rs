//! Restoring a backup chain
//!
//! A restore point is any completed backup. Its chain is resolved back to the
//! full root and every artifact is streamed into a private staging directory
//! and checked against its checksum. Only then are they applied: the full
//! backup first, then each incremental from oldest to newest.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::chain::{fetch_verified, resolve_chain};
use super::notify::{BackupEvent, BackupEventKind, Notifier};
use crate::artifact::adapter::StorageRegistry;
use crate::artifact::archive::{apply_files, find_conflict};
use crate::artifact::dump::{DatabaseDumper, DatabaseTarget};
use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupKind};
use crate::storage::Storage;

/// Where a restore writes to
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreDestination {
    /// Directory the file archives are unpacked into
    Directory(PathBuf),
    /// Database the dumps are replayed into
    Database(DatabaseTarget),
}

impl RestoreDestination {
    pub fn kind(&self) -> BackupKind {
        match self {
            Self::Directory(_) => BackupKind::File,
            Self::Database(_) => BackupKind::Database,
        }
    }
}

/// Result of a restore operation
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreResult {
    /// The requested restore point
    pub backup_id: BackupId,
    /// Number of artifacts applied, root included
    pub artifacts_applied: usize,
    /// Artifact bytes read
    pub total_bytes: u64,
    /// Incremental depth of the restore point
    pub chain_depth: usize,
}

impl RestoreResult {
    pub fn summary(&self) -> String {
        format!(
            "Restored {} artifact(s), {} bytes, chain depth {}",
            self.artifacts_applied, self.total_bytes, self.chain_depth
        )
    }
}

pub struct RestoreEngine {
    storage: Arc<Storage>,
    adapters: StorageRegistry,
    dumper: Arc<dyn DatabaseDumper>,
    notifier: Arc<dyn Notifier>,
    max_chain_depth: usize,
}

impl RestoreEngine {
    pub fn new(
        storage: Arc<Storage>,
        adapters: StorageRegistry,
        dumper: Arc<dyn DatabaseDumper>,
        notifier: Arc<dyn Notifier>,
        max_chain_depth: usize,
    ) -> Self {
        Self {
            storage,
            adapters,
            dumper,
            notifier,
            max_chain_depth,
        }
    }

    /// Restore the chain ending at `id` into `destination`.
    ///
    /// Nothing is written until every artifact in the chain has been read
    /// and verified. Without `overwrite`, existing data at the destination
    /// is a `DestinationConflict`.
    pub async fn restore(
        &self,
        id: BackupId,
        destination: RestoreDestination,
        overwrite: bool,
    ) -> VaultResult<RestoreResult> {
        let chain = resolve_chain(&self.storage.backups, id, self.max_chain_depth, true)?;
        let target = chain
            .last()
            .cloned()
            .ok_or_else(|| VaultError::backup_not_found(id.to_string()))?;

        if target.kind != destination.kind() {
            return Err(VaultError::Validation(format!(
                "backup {} is a {} backup and cannot be restored into a {} destination",
                id,
                target.kind,
                destination.kind()
            )));
        }

        // Removed with everything in it when the restore returns
        let staging = tempfile::Builder::new()
            .prefix("chainvault-restore-")
            .tempdir()?;

        let mut artifacts = Vec::with_capacity(chain.len());
        let mut total_bytes = 0u64;
        for (n, backup) in chain.iter().enumerate() {
            let path = staging.path().join(format!("{:03}.artifact", n));
            total_bytes += fetch_verified(&self.adapters, backup, &path).await?;
            debug!(backup_id = %backup.id, path = %path.display(), "artifact staged");
            artifacts.push(path);
        }

        if !overwrite {
            self.check_conflict(&chain, &destination).await?;
        }

        let artifacts_applied = artifacts.len();

        for (backup, path) in chain.iter().zip(artifacts) {
            match &destination {
                RestoreDestination::Directory(dir) => {
                    apply_files(path, dir.clone()).await?;
                }
                RestoreDestination::Database(db) => {
                    self.dumper.restore(db, &path).await?;
                }
            }
            info!(backup_id = %backup.id, "applied backup artifact");
        }

        let result = RestoreResult {
            backup_id: id,
            artifacts_applied,
            total_bytes,
            chain_depth: chain.len() - 1,
        };

        info!(
            backup_id = %id,
            artifacts = result.artifacts_applied,
            total_bytes = result.total_bytes,
            chain_depth = result.chain_depth,
            "restore completed"
        );
        self.notifier.notify(
            &BackupEvent::for_backup(BackupEventKind::Restored, &target).with_message(result.summary()),
        );

        Ok(result)
    }

    /// Run a restore as a background task
    pub fn spawn(
        self: &Arc<Self>,
        id: BackupId,
        destination: RestoreDestination,
        overwrite: bool,
    ) -> JoinHandle<VaultResult<RestoreResult>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.restore(id, destination, overwrite).await })
    }

    async fn check_conflict(&self, chain: &[Backup], destination: &RestoreDestination) -> VaultResult<()> {
        match destination {
            RestoreDestination::Directory(dir) => {
                let entries = chain.iter().flat_map(|b| b.manifest.iter().flatten());
                if let Some(path) = find_conflict(entries, dir) {
                    return Err(VaultError::DestinationConflict {
                        path: dir.join(path).display().to_string(),
                    });
                }
            }
            RestoreDestination::Database(db) => {
                if self.dumper.has_data(db).await? {
                    return Err(VaultError::DestinationConflict {
                        path: format!("{} database {}", db.engine, db.database),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::crypto::fast_settings;
    use crate::artifact::dump::DatabaseEngine;
    use crate::backup::chain::{BackupChainManager, CreateRequest};
    use crate::backup::source::SourceSelector;
    use crate::backup::testing::Fixture;
    use crate::models::{BackupType, StorageDisk};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn engine(fx: &Fixture) -> Arc<RestoreEngine> {
        Arc::new(RestoreEngine::new(
            Arc::clone(&fx.storage),
            fx.adapters.clone(),
            fx.dumper.clone(),
            fx.events.clone(),
            64,
        ))
    }

    fn file_request(fx: &Fixture, root: &std::path::Path, parent: Option<BackupId>) -> CreateRequest {
        CreateRequest {
            project_id: fx.project_id,
            kind: BackupKind::File,
            backup_type: if parent.is_some() {
                BackupType::Incremental
            } else {
                BackupType::Full
            },
            parent_backup_id: parent,
            storage_disk: StorageDisk::Local,
            source: SourceSelector::Files {
                root: root.to_path_buf(),
                exclude: vec![],
            },
        }
    }

    fn touch(path: &std::path::Path, at: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    /// Full backup of two files, then an incremental changing one of them
    async fn file_chain(fx: &Fixture, manager: &Arc<BackupChainManager>) -> (TempDir, Backup, Backup) {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("config")).unwrap();
        fs::write(src.path().join("index.php"), "v1").unwrap();
        fs::write(src.path().join("config/app.php"), "debug=false").unwrap();

        let full = manager
            .create(file_request(fx, src.path(), None))
            .await
            .unwrap();
        assert!(full.is_completed());

        let past = SystemTime::now() - Duration::from_secs(3600);
        touch(&src.path().join("config/app.php"), past);
        fs::write(src.path().join("index.php"), "v2").unwrap();
        touch(
            &src.path().join("index.php"),
            SystemTime::now() + Duration::from_secs(3600),
        );

        let inc = manager
            .create(file_request(fx, src.path(), Some(full.id)))
            .await
            .unwrap();
        assert!(inc.is_completed());
        (src, full, inc)
    }

    #[tokio::test]
    async fn test_restore_file_chain_in_order() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let (_src, _full, inc) = file_chain(&fx, &manager).await;

        let dest = TempDir::new().unwrap();
        let out = dest.path().join("site");
        let result = engine(&fx)
            .restore(inc.id, RestoreDestination::Directory(out.clone()), false)
            .await
            .unwrap();

        assert_eq!(result.artifacts_applied, 2);
        assert_eq!(result.chain_depth, 1);
        assert!(result.total_bytes > 0);
        assert_eq!(fs::read_to_string(out.join("index.php")).unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(out.join("config/app.php")).unwrap(),
            "debug=false"
        );

        let events = fx.events.events.lock().unwrap();
        assert_eq!(events.last().unwrap().event, BackupEventKind::Restored);
    }

    #[tokio::test]
    async fn test_restore_with_overwrite_is_idempotent() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let (_src, _full, inc) = file_chain(&fx, &manager).await;

        let dest = TempDir::new().unwrap();
        let restore = engine(&fx);
        let target = RestoreDestination::Directory(dest.path().to_path_buf());

        let first = restore.restore(inc.id, target.clone(), true).await.unwrap();
        let snapshot = fs::read_to_string(dest.path().join("index.php")).unwrap();
        let second = restore.restore(inc.id, target, true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(dest.path().join("index.php")).unwrap(), snapshot);
        assert_eq!(
            fs::read_to_string(dest.path().join("config/app.php")).unwrap(),
            "debug=false"
        );
    }

    #[tokio::test]
    async fn test_existing_file_conflicts_without_overwrite() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let (_src, _full, inc) = file_chain(&fx, &manager).await;

        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("index.php"), "local edits").unwrap();

        let err = engine(&fx)
            .restore(inc.id, RestoreDestination::Directory(dest.path().to_path_buf()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::DestinationConflict { .. }));
        assert_eq!(
            fs::read_to_string(dest.path().join("index.php")).unwrap(),
            "local edits"
        );
        assert!(!dest.path().join("config").exists());
    }

    #[tokio::test]
    async fn test_corrupt_artifact_leaves_destination_untouched() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let (_src, _full, inc) = file_chain(&fx, &manager).await;

        let adapter = fx.adapter();
        let mut bytes = adapter.read(&inc.storage_path).await.unwrap();
        bytes[0] ^= 0x01;
        adapter.write(&inc.storage_path, bytes).await.unwrap();

        let dest = TempDir::new().unwrap();
        let out = dest.path().join("site");
        let err = engine(&fx)
            .restore(inc.id, RestoreDestination::Directory(out.clone()), true)
            .await
            .unwrap_err();

        match err {
            VaultError::ChecksumMismatch { backup_id, .. } => assert_eq!(backup_id, inc.id.to_string()),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_restore_database_replays_dumps() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "INSERT 1;", None).await;
        let inc = fx.db_backup(&manager, "INSERT 1; INSERT 2;", Some(full.id)).await;

        let target = DatabaseTarget::new(DatabaseEngine::Mysql, "shop_restore");
        let restore = engine(&fx);
        let result = restore
            .restore(inc.id, RestoreDestination::Database(target.clone()), false)
            .await
            .unwrap();

        assert_eq!(result.artifacts_applied, 2);
        assert_eq!(
            fx.dumper.replayed.lock().unwrap().clone(),
            vec![b"INSERT 1;".to_vec(), b"INSERT 1; INSERT 2;".to_vec()]
        );
        assert_eq!(
            fx.dumper.content("shop_restore").unwrap(),
            b"INSERT 1; INSERT 2;".to_vec()
        );

        // the database now has data
        let err = restore
            .restore(full.id, RestoreDestination::Database(target), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::DestinationConflict { .. }));
    }

    #[tokio::test]
    async fn test_missing_ancestor_is_broken_chain() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;
        let inc = fx.db_backup(&manager, "v2", Some(full.id)).await;
        fx.storage.backups.remove(full.id).unwrap();

        let err = engine(&fx)
            .restore(
                inc.id,
                RestoreDestination::Database(DatabaseTarget::new(DatabaseEngine::Mysql, "other")),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::BrokenChain { .. }));
        assert!(fx.dumper.replayed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_destination_kind_rejected() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;

        let dir = TempDir::new().unwrap();
        let err = engine(&fx)
            .restore(full.id, RestoreDestination::Directory(dir.path().to_path_buf()), true)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_encrypted_chain_restores() {
        let mut fx = Fixture::new();
        fx.adapters
            .encrypt_disk(StorageDisk::Local, &fast_settings("restore pass"))
            .unwrap();
        let manager = fx.manager();
        let (_src, full, inc) = file_chain(&fx, &manager).await;

        let dest = TempDir::new().unwrap();
        let result = engine(&fx)
            .restore(inc.id, RestoreDestination::Directory(dest.path().to_path_buf()), false)
            .await
            .unwrap();

        assert_eq!(
            result.total_bytes,
            full.size_bytes.unwrap() + inc.size_bytes.unwrap()
        );
        assert_eq!(fs::read_to_string(dest.path().join("index.php")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails_before_writing() {
        let mut fx = Fixture::new();
        fx.adapters
            .encrypt_disk(StorageDisk::Local, &fast_settings("right"))
            .unwrap();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "INSERT 1;", None).await;

        let mut other = fx.adapters.clone();
        other
            .encrypt_disk(StorageDisk::Local, &fast_settings("wrong"))
            .unwrap();
        let restore = RestoreEngine::new(
            Arc::clone(&fx.storage),
            other,
            fx.dumper.clone(),
            fx.events.clone(),
            64,
        );

        let target = DatabaseTarget::new(DatabaseEngine::Mysql, "copy");
        let err = restore
            .restore(full.id, RestoreDestination::Database(target), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Encryption(_)));
        assert!(fx.dumper.content("copy").is_none());
    }

    #[tokio::test]
    async fn test_spawned_restore() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;

        let handle = engine(&fx).spawn(
            full.id,
            RestoreDestination::Database(DatabaseTarget::new(DatabaseEngine::Mysql, "copy")),
            false,
        );
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.chain_depth, 0);
        assert_eq!(fx.dumper.content("copy").unwrap(), b"v1".to_vec());
    }
}
