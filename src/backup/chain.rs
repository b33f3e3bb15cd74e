//! Backup chain manager
//!
//! Creates full and incremental backups and keeps the chain rules:
//!
//! - a full backup has no parent; an incremental backup has a completed parent
//!   of the same project and kind
//! - at most one backup per project and kind is running
//! - checksum, size and manifest exist only on completed backups
//!
//! A run is a background task. [`BackupChainManager::start`] claims the running
//! slot synchronously and hands back a join handle; [`BackupChainManager::create`]
//! waits for it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::notify::{BackupEvent, BackupEventKind, Notifier};
use super::source::SourceSelector;
use crate::artifact::adapter::{StorageRegistry, StoredArtifact};
use crate::artifact::archive::{capture_files, ExcludeMatcher};
use crate::artifact::dump::DatabaseDumper;
use crate::artifact::{artifact_path, checksum, ArtifactSink};
use crate::config::settings::{RunLimits, Settings};
use crate::error::{VaultError, VaultResult};
use crate::models::{
    Backup, BackupId, BackupKind, BackupStatus, BackupType, ManifestEntry, ProjectId, StorageDisk,
};
use crate::storage::{BackupRepository, Storage};

/// Everything needed to create one backup
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub project_id: ProjectId,
    pub kind: BackupKind,
    pub backup_type: BackupType,
    pub parent_backup_id: Option<BackupId>,
    pub storage_disk: StorageDisk,
    pub source: SourceSelector,
}

/// A started run: the record as it was when the slot was claimed, and the
/// task that finishes it
pub struct RunHandle {
    pub backup: Backup,
    pub handle: JoinHandle<Backup>,
}

impl RunHandle {
    pub async fn wait(self) -> VaultResult<Backup> {
        self.handle
            .await
            .map_err(|e| VaultError::Io(format!("backup task failed: {}", e)))
    }
}

type Captured = (StoredArtifact, Option<Vec<ManifestEntry>>);

/// How often a run re-reads its own record to notice a cancel issued by
/// another process
const CANCEL_POLL: Duration = Duration::from_secs(1);

pub struct BackupChainManager {
    storage: Arc<Storage>,
    adapters: StorageRegistry,
    dumper: Arc<dyn DatabaseDumper>,
    notifier: Arc<dyn Notifier>,
    run_limits: RunLimits,
    max_chain_depth: usize,
    active: Mutex<HashMap<BackupId, CancellationToken>>,
}

impl BackupChainManager {
    pub fn new(
        storage: Arc<Storage>,
        adapters: StorageRegistry,
        dumper: Arc<dyn DatabaseDumper>,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
    ) -> Self {
        Self {
            storage,
            adapters,
            dumper,
            notifier,
            run_limits: settings.max_run_seconds.clone(),
            max_chain_depth: settings.max_chain_depth,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn max_chain_depth(&self) -> usize {
        self.max_chain_depth
    }

    /// Check a request against the chain rules; returns the parent record
    pub fn validate(&self, request: &CreateRequest) -> VaultResult<Option<Backup>> {
        if request.source.kind() != request.kind {
            return Err(VaultError::Validation(format!(
                "a {} backup cannot read from a {} source",
                request.kind,
                request.source.kind()
            )));
        }

        self.adapters.get(request.storage_disk)?;

        let parent_id = match (request.backup_type, request.parent_backup_id) {
            (BackupType::Full, None) => return Ok(None),
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
            (BackupType::Incremental, Some(id)) => id,
        };

        let parent = self.storage.backups.get(parent_id)?.ok_or_else(|| {
            VaultError::InvalidParentBackup {
                reason: format!("parent {} does not exist", parent_id),
            }
        })?;

        if !parent.same_slot(request.project_id, request.kind) {
            return Err(VaultError::InvalidParentBackup {
                reason: format!(
                    "parent {} belongs to project {} ({}), not {} ({})",
                    parent.id, parent.project_id, parent.kind, request.project_id, request.kind
                ),
            });
        }

        if !parent.is_completed() {
            return Err(VaultError::InvalidParentBackup {
                reason: format!("parent {} is {}, not completed", parent.id, parent.status),
            });
        }

        let parent_depth = self.depth(parent.id)?;
        if parent_depth + 1 > self.max_chain_depth {
            return Err(VaultError::InvalidParentBackup {
                reason: format!(
                    "chain would exceed the maximum depth of {}",
                    self.max_chain_depth
                ),
            });
        }

        Ok(Some(parent))
    }

    /// Validate, claim the running slot and spawn the capture.
    ///
    /// Must be called from within a Tokio runtime. Validation errors and
    /// `BackupAlreadyRunning` are returned here; everything after the slot is
    /// claimed ends up on the record.
    pub fn start(self: &Arc<Self>, request: CreateRequest) -> VaultResult<RunHandle> {
        let parent = self.validate(&request)?;

        let mut backup = Backup::pending(
            request.project_id,
            request.kind,
            request.backup_type,
            request.parent_backup_id,
            request.storage_disk,
        );
        if let SourceSelector::Database(target) = &request.source {
            backup.database_name = Some(target.database.clone());
        }
        backup.storage_path = artifact_path(&backup, backup.created_at);

        self.storage.backups.insert(backup.clone())?;

        let running = match self.storage.backups.start_run(backup.id, Utc::now()) {
            Ok(running) => running,
            Err(e) => {
                if let Err(cleanup) = self.storage.backups.remove(backup.id) {
                    warn!(backup_id = %backup.id, error = %cleanup, "failed to remove unstarted backup");
                }
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        self.active
            .lock()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire run registry: {}", e)))?
            .insert(running.id, token.clone());

        info!(
            backup_id = %running.id,
            project_id = %running.project_id,
            kind = %running.kind,
            backup_type = %running.backup_type,
            "backup started"
        );

        let manager = Arc::clone(self);
        let record = running.clone();
        let handle = tokio::spawn(async move {
            manager
                .run(record, parent, request.source, token)
                .await
        });

        Ok(RunHandle {
            backup: running,
            handle,
        })
    }

    /// Create a backup and wait for it to finish.
    ///
    /// Capture failures are not errors here: the returned record is `failed`
    /// with the reason in `error_message`.
    pub async fn create(self: &Arc<Self>, request: CreateRequest) -> VaultResult<Backup> {
        self.start(request)?.wait().await
    }

    async fn run(
        &self,
        backup: Backup,
        parent: Option<Backup>,
        source: SourceSelector,
        token: CancellationToken,
    ) -> Backup {
        let limit = self.run_limits.for_kind(backup.kind);
        let written = Arc::new(AtomicU64::new(0));

        let outcome: VaultResult<Captured> = match self
            .adapters
            .upload(backup.storage_disk, &backup.storage_path, Arc::clone(&written))
            .await
        {
            Err(e) => Err(e),
            Ok(mut upload) => {
                let captured = {
                    let capture =
                        self.capture(&backup, parent.as_ref(), source, &mut upload, token.clone());

                    tokio::select! {
                        _ = token.cancelled() => Err(VaultError::Cancelled("cancelled".into())),
                        _ = self.cancelled_elsewhere(backup.id) => {
                            token.cancel();
                            Err(VaultError::Cancelled("cancelled".into()))
                        }
                        result = tokio::time::timeout(limit, capture) => match result {
                            Ok(result) => result,
                            Err(_) => {
                                token.cancel();
                                Err(VaultError::Cancelled(format!(
                                    "cancelled: exceeded maximum run duration of {}s",
                                    limit.as_secs()
                                )))
                            }
                        },
                    }
                };

                match captured {
                    Ok(manifest) => upload.finish().await.map(|stored| (stored, manifest)),
                    Err(e) => {
                        // Only the uncommitted upload is discarded; anything the
                        // disk already exposes stays for retention to collect
                        if let Err(abort) = upload.abort().await {
                            warn!(
                                backup_id = %backup.id,
                                error = %abort,
                                "failed to abort artifact upload"
                            );
                        }
                        Err(e)
                    }
                }
            }
        };

        let finished_at = Utc::now();
        let finished = match outcome {
            Ok((stored, manifest)) => {
                self.storage
                    .backups
                    .transition(backup.id, BackupStatus::Running, |b| {
                        b.mark_completed(stored.checksum, stored.size_bytes, manifest, finished_at)
                    })
            }
            Err(e) => {
                let message = failure_message(&e, written.load(Ordering::Relaxed));
                self.storage
                    .backups
                    .transition(backup.id, BackupStatus::Running, |b| {
                        b.mark_failed(message, finished_at)
                    })
            }
        };

        if let Ok(mut active) = self.active.lock() {
            active.remove(&backup.id);
        }

        match finished {
            Ok(Some(done)) => {
                if done.is_completed() {
                    info!(
                        backup_id = %done.id,
                        size_bytes = done.size_bytes.unwrap_or(0),
                        files = done.files_count.unwrap_or(0),
                        "backup completed"
                    );
                    self.notifier
                        .notify(&BackupEvent::for_backup(BackupEventKind::Completed, &done));
                } else {
                    warn!(
                        backup_id = %done.id,
                        error = done.error_message.as_deref().unwrap_or(""),
                        "backup failed"
                    );
                    self.notifier
                        .notify(&BackupEvent::for_backup(BackupEventKind::Failed, &done));
                }
                done
            }
            // Cancelled while finishing; the cancel path already recorded it
            Ok(None) => match self.storage.backups.get(backup.id) {
                Ok(Some(current)) => current,
                _ => backup,
            },
            Err(e) => {
                error!(backup_id = %backup.id, error = %e, "failed to record backup result");
                let message = format!("failed to record result: {}", e);
                match self
                    .storage
                    .backups
                    .transition(backup.id, BackupStatus::Running, |b| {
                        b.mark_failed(message.clone(), finished_at)
                    }) {
                    Ok(Some(failed)) => failed,
                    _ => {
                        let mut failed = backup;
                        failed.mark_failed(message, finished_at);
                        failed
                    }
                }
            }
        }
    }

    /// Stream the source into `out`; file backups also return their manifest
    async fn capture(
        &self,
        backup: &Backup,
        parent: Option<&Backup>,
        source: SourceSelector,
        out: &mut dyn ArtifactSink,
        token: CancellationToken,
    ) -> VaultResult<Option<Vec<ManifestEntry>>> {
        match source {
            SourceSelector::Files { root, exclude } => {
                let matcher = ExcludeMatcher::new(&exclude)?;
                let since = parent.map(|p| p.started_at);
                debug!(backup_id = %backup.id, root = %root.display(), "archiving files");
                let manifest = capture_files(root, matcher, since, token, out).await?;
                Ok(Some(manifest))
            }
            SourceSelector::Database(target) => {
                self.dumper.dump(&target, out).await?;
                Ok(None)
            }
        }
    }

    /// Resolves once the record is no longer `running`, which for a live run
    /// means another process cancelled it
    async fn cancelled_elsewhere(&self, id: BackupId) {
        let mut poll = tokio::time::interval(CANCEL_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            poll.tick().await;
            match self.storage.backups.get(id) {
                Ok(Some(current)) if current.is_running() => {}
                Ok(_) => return,
                Err(e) => debug!(backup_id = %id, error = %e, "could not re-read running backup"),
            }
        }
    }

    /// Force a running backup to `failed` with `error_message = "cancelled"`
    pub fn cancel(&self, id: BackupId) -> VaultResult<Backup> {
        let backup = self.storage.backups.require(id)?;
        if !backup.is_running() {
            return Err(VaultError::Validation(format!(
                "backup {} is {}; only running backups can be cancelled",
                id, backup.status
            )));
        }

        let updated = self
            .storage
            .backups
            .transition(id, BackupStatus::Running, |b| {
                b.mark_failed("cancelled", Utc::now())
            })?;

        if let Ok(active) = self.active.lock() {
            if let Some(token) = active.get(&id) {
                token.cancel();
            }
        }

        match updated {
            Some(cancelled) => {
                info!(backup_id = %id, "backup cancelled");
                self.notifier
                    .notify(&BackupEvent::for_backup(BackupEventKind::Failed, &cancelled));
                Ok(cancelled)
            }
            None => self.storage.backups.require(id),
        }
    }

    /// Fail running rows that no task in this process owns.
    ///
    /// Called when a long-lived process starts, so a crash does not leave a
    /// project slot locked forever.
    pub fn fail_interrupted(&self) -> VaultResult<Vec<Backup>> {
        let owned: HashSet<BackupId> = self
            .active
            .lock()
            .map(|active| active.keys().copied().collect())
            .unwrap_or_default();

        let mut failed = Vec::new();
        for backup in self.storage.backups.get_all()? {
            if backup.is_running() && !owned.contains(&backup.id) {
                if let Some(done) = self
                    .storage
                    .backups
                    .transition(backup.id, BackupStatus::Running, |b| {
                        b.mark_failed("interrupted before completion", Utc::now())
                    })?
                {
                    warn!(backup_id = %done.id, "marked interrupted backup as failed");
                    failed.push(done);
                }
            }
        }
        Ok(failed)
    }

    /// Incremental depth: 0 for a full backup, parent depth + 1 otherwise
    pub fn depth(&self, id: BackupId) -> VaultResult<usize> {
        let chain = resolve_chain(&self.storage.backups, id, self.max_chain_depth, false)?;
        Ok(chain.len() - 1)
    }

    /// Recompute the checksum of a stored artifact
    pub async fn verify(&self, id: BackupId) -> VaultResult<Backup> {
        let backup = self.storage.backups.require(id)?;
        let expected = recorded_checksum(&backup)?;
        let stored = self
            .adapters
            .checksum_of(backup.storage_disk, &backup.storage_path)
            .await?;
        checksum::matches(backup.id, expected, &stored.checksum)?;
        debug!(backup_id = %id, size_bytes = stored.size_bytes, "checksum verified");
        Ok(backup)
    }
}

fn failure_message(err: &VaultError, written: u64) -> String {
    match err {
        VaultError::Cancelled(reason) => reason.clone(),
        _ if written > 0 => format!("{} ({} bytes written before failure)", err, written),
        _ => err.to_string(),
    }
}

fn recorded_checksum(backup: &Backup) -> VaultResult<&str> {
    match (&backup.checksum, backup.is_completed()) {
        (Some(expected), true) => Ok(expected),
        _ => Err(VaultError::Validation(format!(
            "backup {} is {} and has no artifact to verify",
            backup.id, backup.status
        ))),
    }
}

/// Download a completed backup's artifact into `dest` and check it against
/// its checksum. Returns the stored size.
///
/// A checksum mismatch wins over a decryption error, so tampering with an
/// encrypted artifact is reported as corruption.
pub async fn fetch_verified(adapters: &StorageRegistry, backup: &Backup, dest: &Path) -> VaultResult<u64> {
    let expected = recorded_checksum(backup)?;
    let download = adapters
        .download(backup.storage_disk, &backup.storage_path, dest)
        .await?;
    checksum::matches(backup.id, expected, &download.stored.checksum)?;
    Ok(download.decoded()?.size_bytes)
}

/// Walk parent links from `id` to the chain root.
///
/// Returns the chain root first. With `require_completed` every member must
/// be completed. Missing ancestors, cycles, kind changes and chains deeper
/// than `max_depth` are reported as `BrokenChain`.
pub fn resolve_chain(
    backups: &BackupRepository,
    id: BackupId,
    max_depth: usize,
    require_completed: bool,
) -> VaultResult<Vec<Backup>> {
    let target = backups.require(id)?;
    let (project_id, kind) = (target.project_id, target.kind);

    let mut chain: Vec<Backup> = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(target);

    while let Some(backup) = next.take() {
        if !visited.insert(backup.id) {
            return Err(broken(backup.id, "parent links form a cycle"));
        }
        if chain.len() > max_depth {
            return Err(broken(
                id,
                &format!("chain is deeper than the maximum of {}", max_depth),
            ));
        }
        if !backup.same_slot(project_id, kind) {
            return Err(broken(backup.id, "ancestor belongs to another project or kind"));
        }
        if require_completed && !backup.is_completed() {
            return Err(broken(backup.id, &format!("ancestor is {}", backup.status)));
        }
        if require_completed && backup.deleting {
            return Err(broken(backup.id, "ancestor is being deleted"));
        }

        match (backup.backup_type, backup.parent_backup_id) {
            (BackupType::Full, None) => {}
            (BackupType::Full, Some(_)) => {
                return Err(broken(backup.id, "full backup has a parent"));
            }
            (BackupType::Incremental, None) => {
                return Err(broken(backup.id, "incremental backup has no parent"));
            }
            (BackupType::Incremental, Some(parent_id)) => {
                let parent = backups
                    .get(parent_id)?
                    .ok_or_else(|| broken(parent_id, "parent backup is missing"))?;
                next = Some(parent);
            }
        }

        chain.push(backup);
    }

    chain.reverse();
    debug!(backup_id = %id, depth = chain.len() - 1, "resolved backup chain");
    Ok(chain)
}

fn broken(backup_id: BackupId, reason: &str) -> VaultError {
    VaultError::BrokenChain {
        backup_id: backup_id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::crypto::fast_settings;
    use crate::backup::notify::BackupEventKind;
    use crate::backup::testing::Fixture;
    use crate::config::VaultPaths;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_full_backup_completes() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let backup = fx.db_backup(&manager, "CREATE TABLE users;", None).await;

        assert!(backup.is_completed());
        assert!(backup.checksum.is_some());
        assert_eq!(backup.database_name.as_deref(), Some("shop"));
        assert!(backup.storage_path.starts_with("database-backups/"));
        assert!(backup.validate().is_ok());
        assert!(fx.adapter().exists(&backup.storage_path).await.unwrap());
        assert_eq!(manager.depth(backup.id).unwrap(), 0);

        let events = fx.events.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, BackupEventKind::Completed);
    }

    #[tokio::test]
    async fn test_depth_law() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let full = fx.db_backup(&manager, "v1", None).await;
        let i1 = fx.db_backup(&manager, "v2", Some(full.id)).await;
        let i2 = fx.db_backup(&manager, "v3", Some(i1.id)).await;
        let sibling = fx.db_backup(&manager, "v2b", Some(full.id)).await;

        assert_eq!(manager.depth(full.id).unwrap(), 0);
        assert_eq!(manager.depth(i1.id).unwrap(), 1);
        assert_eq!(manager.depth(i2.id).unwrap(), 2);
        assert_eq!(manager.depth(sibling.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_with_parent_rejected() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;

        let err = manager
            .create(fx.db_request(BackupType::Full, Some(full.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidParentBackup { .. }));
    }

    #[tokio::test]
    async fn test_incremental_without_parent_rejected() {
        let fx = Fixture::new();
        let err = fx
            .manager()
            .create(fx.db_request(BackupType::Incremental, None))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidParentBackup { .. }));
        assert_eq!(fx.storage.backups.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incremental_against_failed_parent_rejected() {
        let fx = Fixture::new();
        let manager = fx.manager();

        // unknown database makes the dump fail
        let failed = manager
            .create(CreateRequest {
                source: SourceSelector::Database(crate::artifact::dump::DatabaseTarget::new(
                    crate::artifact::dump::DatabaseEngine::Mysql,
                    "missing",
                )),
                ..fx.db_request(BackupType::Full, None)
            })
            .await
            .unwrap();
        assert_eq!(failed.status, BackupStatus::Failed);
        assert!(failed.checksum.is_none());

        let err = manager
            .create(fx.db_request(BackupType::Incremental, Some(failed.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidParentBackup { .. }));
    }

    #[tokio::test]
    async fn test_parent_of_other_project_rejected() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;

        let mut request = fx.db_request(BackupType::Incremental, Some(full.id));
        request.project_id = ProjectId::new();
        assert!(matches!(
            manager.validate(&request),
            Err(VaultError::InvalidParentBackup { .. })
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_disk_rejected() {
        let fx = Fixture::new();
        let mut request = fx.db_request(BackupType::Full, None);
        request.storage_disk = StorageDisk::Gcs;
        assert!(matches!(
            fx.manager().create(request).await,
            Err(VaultError::StorageIo(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_create_one_runs() {
        let fx = Fixture::new();
        let manager = fx.manager();
        fx.dumper.set("shop", b"data");
        fx.dumper.slow(Duration::from_millis(300));

        let first = manager.start(fx.db_request(BackupType::Full, None)).unwrap();
        assert!(first.backup.is_running());

        let second = manager.start(fx.db_request(BackupType::Full, None));
        assert!(matches!(second, Err(VaultError::BackupAlreadyRunning { .. })));

        let running: Vec<_> = fx
            .storage
            .backups
            .get_all()
            .unwrap()
            .into_iter()
            .filter(|b| b.is_running())
            .collect();
        assert_eq!(running.len(), 1);

        let done = first.wait().await.unwrap();
        assert!(done.is_completed());
        assert_eq!(fx.storage.backups.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_other_kind_runs_concurrently() {
        let fx = Fixture::new();
        let manager = fx.manager();
        fx.dumper.set("shop", b"data");
        fx.dumper.slow(Duration::from_millis(200));

        let src = TempDir::new().unwrap();
        fs::write(src.path().join("index.php"), "<?php").unwrap();

        let db = manager.start(fx.db_request(BackupType::Full, None)).unwrap();
        let files = manager
            .start(CreateRequest {
                project_id: fx.project_id,
                kind: BackupKind::File,
                backup_type: BackupType::Full,
                parent_backup_id: None,
                storage_disk: StorageDisk::Local,
                source: SourceSelector::Files {
                    root: src.path().to_path_buf(),
                    exclude: vec![],
                },
            })
            .unwrap();

        assert!(db.wait().await.unwrap().is_completed());
        assert!(files.wait().await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_cancel_running_backup() {
        let fx = Fixture::new();
        let manager = fx.manager();
        fx.dumper.set("shop", b"data");
        fx.dumper.slow(Duration::from_secs(30));

        let run = manager.start(fx.db_request(BackupType::Full, None)).unwrap();
        let cancelled = manager.cancel(run.backup.id).unwrap();
        assert_eq!(cancelled.status, BackupStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some("cancelled"));

        let finished = run.wait().await.unwrap();
        assert_eq!(finished.status, BackupStatus::Failed);
        assert_eq!(finished.error_message.as_deref(), Some("cancelled"));

        assert!(manager.cancel(finished.id).is_err());
        // slot is free again
        fx.dumper.slow(Duration::from_millis(0));
        assert!(fx.db_backup(&manager, "v1", None).await.is_completed());
    }

    #[tokio::test]
    async fn test_run_duration_limit_cancels() {
        let mut settings = Settings::default();
        settings.max_run_seconds.database_seconds = 1;
        let fx = Fixture::with_settings(settings);
        let manager = fx.manager();
        fx.dumper.set("shop", b"data");
        fx.dumper.slow(Duration::from_secs(30));

        let backup = manager
            .create(fx.db_request(BackupType::Full, None))
            .await
            .unwrap();
        assert_eq!(backup.status, BackupStatus::Failed);
        assert_eq!(
            backup.error_message.as_deref(),
            Some("cancelled: exceeded maximum run duration of 1s")
        );
    }

    #[tokio::test]
    async fn test_file_incremental_captures_changes_only() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("app")).unwrap();
        fs::write(src.path().join("index.php"), "<?php").unwrap();
        fs::write(src.path().join("app/User.php"), "<?php class User {}").unwrap();
        fs::write(src.path().join("debug.log"), "noise").unwrap();

        let request = |backup_type, parent| CreateRequest {
            project_id: fx.project_id,
            kind: BackupKind::File,
            backup_type,
            parent_backup_id: parent,
            storage_disk: StorageDisk::Local,
            source: SourceSelector::Files {
                root: src.path().to_path_buf(),
                exclude: vec!["*.log".to_string()],
            },
        };

        let full = manager.create(request(BackupType::Full, None)).await.unwrap();
        assert!(full.is_completed());
        assert_eq!(full.files_count, Some(2));

        let past = SystemTime::now() - Duration::from_secs(3600);
        for rel in ["index.php", "app/User.php"] {
            fs::File::options()
                .write(true)
                .open(src.path().join(rel))
                .unwrap()
                .set_modified(past)
                .unwrap();
        }
        let changed = src.path().join("app/User.php");
        fs::write(&changed, "<?php class User { public $name; }").unwrap();
        fs::File::options()
            .write(true)
            .open(&changed)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(3600))
            .unwrap();

        let inc = manager
            .create(request(BackupType::Incremental, Some(full.id)))
            .await
            .unwrap();
        assert!(inc.is_completed());
        let paths: Vec<_> = inc
            .manifest
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["app/User.php"]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_record() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let backup = manager
            .create(CreateRequest {
                project_id: fx.project_id,
                kind: BackupKind::File,
                backup_type: BackupType::Full,
                parent_backup_id: None,
                storage_disk: StorageDisk::Local,
                source: SourceSelector::Files {
                    root: fx.dir.path().join("does-not-exist"),
                    exclude: vec![],
                },
            })
            .await
            .unwrap();

        assert_eq!(backup.status, BackupStatus::Failed);
        assert!(backup.completed_at.is_some());
        assert!(backup.error_message.unwrap().contains("not a directory"));
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let backup = fx.db_backup(&manager, "CREATE TABLE t;", None).await;

        assert!(manager.verify(backup.id).await.is_ok());

        let adapter = fx.adapter();
        let mut bytes = adapter.read(&backup.storage_path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        adapter.write(&backup.storage_path, bytes).await.unwrap();

        match manager.verify(backup.id).await {
            Err(VaultError::ChecksumMismatch { backup_id, .. }) => {
                assert_eq!(backup_id, backup.id.to_string())
            }
            other => panic!("expected checksum mismatch, got {:?}", other.map(|b| b.id)),
        }
    }

    #[tokio::test]
    async fn test_resolve_chain_missing_ancestor() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;
        let inc = fx.db_backup(&manager, "v2", Some(full.id)).await;

        fx.storage.backups.remove(full.id).unwrap();
        let err = resolve_chain(&fx.storage.backups, inc.id, 64, true).unwrap_err();
        match err {
            VaultError::BrokenChain { backup_id, .. } => assert_eq!(backup_id, full.id.to_string()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_chain_depth_enforced() {
        let mut settings = Settings::default();
        settings.max_chain_depth = 2;
        let fx = Fixture::with_settings(settings);
        let manager = fx.manager();

        let full = fx.db_backup(&manager, "v1", None).await;
        let i1 = fx.db_backup(&manager, "v2", Some(full.id)).await;
        let i2 = fx.db_backup(&manager, "v3", Some(i1.id)).await;
        assert!(i2.is_completed());

        fx.dumper.set("shop", b"v4");
        let err = manager
            .create(fx.db_request(BackupType::Incremental, Some(i2.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidParentBackup { .. }));
    }

    #[tokio::test]
    async fn test_fail_interrupted() {
        let fx = Fixture::new();
        let mut orphan = Backup::pending(
            fx.project_id,
            BackupKind::Database,
            BackupType::Full,
            None,
            StorageDisk::Local,
        );
        orphan.status = BackupStatus::Running;
        fx.storage.backups.insert(orphan.clone()).unwrap();

        let failed = fx.manager().fail_interrupted().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            fx.storage.backups.get(orphan.id).unwrap().unwrap().error_message.as_deref(),
            Some("interrupted before completion")
        );
    }

    #[tokio::test]
    async fn test_cancel_from_another_process_stops_run() {
        let fx = Fixture::new();
        let manager = fx.manager();
        fx.dumper.set("shop", b"a dump that takes its time");
        fx.dumper.slow(Duration::from_secs(30));

        let run = manager.start(fx.db_request(BackupType::Full, None)).unwrap();

        // a CLI process with its own view of the same record store
        let cli = Storage::new(VaultPaths::with_base_dir(fx.dir.path().join("vault"))).unwrap();
        cli.backups
            .transition(run.backup.id, BackupStatus::Running, |b| {
                b.mark_failed("cancelled", Utc::now())
            })
            .unwrap()
            .unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("run should notice the cancel")
            .unwrap();
        assert_eq!(finished.status, BackupStatus::Failed);
        assert_eq!(finished.error_message.as_deref(), Some("cancelled"));
        assert_eq!(
            cli.backups.require(finished.id).unwrap().status,
            BackupStatus::Failed
        );

        // the slot is free for the next run
        fx.dumper.slow(Duration::from_millis(0));
        assert!(fx.db_backup(&manager, "v2", None).await.is_completed());
    }

    #[tokio::test]
    async fn test_encrypted_disk_backup_verifies_stored_bytes() {
        let mut fx = Fixture::new();
        fx.adapters
            .encrypt_disk(StorageDisk::Local, &fast_settings("vault pass"))
            .unwrap();
        let manager = fx.manager();

        let backup = fx.db_backup(&manager, "CREATE TABLE secrets;", None).await;
        assert!(backup.is_completed());

        let stored = fx.adapter().read(&backup.storage_path).await.unwrap();
        assert!(stored.starts_with(b"CVENC1"));
        assert_eq!(backup.size_bytes, Some(stored.len() as u64));
        assert_eq!(backup.checksum.as_deref(), Some(checksum::compute(&stored).as_str()));
        assert!(manager.verify(backup.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_verified_streams_to_file() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let backup = fx.db_backup(&manager, "INSERT INTO t VALUES (1);", None).await;

        let staging = TempDir::new().unwrap();
        let dest = staging.path().join("000.artifact");
        let size = fetch_verified(&fx.adapters, &backup, &dest).await.unwrap();

        assert_eq!(Some(size), backup.size_bytes);
        assert_eq!(fs::metadata(&dest).unwrap().len(), size);
    }

    #[tokio::test]
    async fn test_deleting_ancestor_breaks_chain() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let full = fx.db_backup(&manager, "v1", None).await;
        let inc = fx.db_backup(&manager, "v2", Some(full.id)).await;

        let mut claimed = fx.storage.backups.require(full.id).unwrap();
        claimed.deleting = true;
        fx.storage.backups.update(claimed).unwrap();

        assert!(matches!(
            resolve_chain(&fx.storage.backups, inc.id, 64, true),
            Err(VaultError::BrokenChain { .. })
        ));
        assert_eq!(resolve_chain(&fx.storage.backups, inc.id, 64, false).unwrap().len(), 2);
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(
            failure_message(&VaultError::StorageIo("timeout".into()), 2048),
            "Storage I/O error: timeout (2048 bytes written before failure)"
        );
        assert_eq!(
            failure_message(&VaultError::Cancelled("cancelled".into()), 10),
            "cancelled"
        );
    }
}
