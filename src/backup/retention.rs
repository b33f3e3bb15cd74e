//! Retention enforcement
//!
//! Each active schedule keeps its backups for `retention_days`. Expired
//! backups are deleted leaves first: a backup another backup depends on is
//! skipped, and passes repeat until nothing more can go, so a parent whose
//! last child expired in the same run is deleted too.
//!
//! A row is claimed under the record lock before its artifact goes, so no
//! backup can attach to it while the delete is in flight.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::notify::{BackupEvent, BackupEventKind, Notifier};
use crate::artifact::adapter::StorageRegistry;
use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupSchedule, ScheduleId};
use crate::storage::Storage;

/// Outcome of one retention run for one schedule
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    /// Artifact and row removed
    pub deleted: Vec<BackupId>,
    /// Not yet expired, or not in a terminal state
    pub retained: Vec<BackupId>,
    /// Expired but still depended upon
    pub skipped: Vec<BackupId>,
    /// Expired, but the artifact could not be deleted; retried next run
    pub errors: Vec<(BackupId, String)>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct RetentionEnforcer {
    storage: Arc<Storage>,
    adapters: StorageRegistry,
    notifier: Arc<dyn Notifier>,
}

impl RetentionEnforcer {
    pub fn new(storage: Arc<Storage>, adapters: StorageRegistry, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            storage,
            adapters,
            notifier,
        }
    }

    /// Delete the schedule's backups that finished before
    /// `now - retention_days`. A backup exactly at the cutoff is kept.
    pub async fn enforce(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> VaultResult<RetentionReport> {
        schedule.validate()?;
        let cutoff = now - Duration::days(i64::from(schedule.retention_days));

        let mut report = RetentionReport::default();
        let mut candidates = Vec::new();
        for backup in self.storage.backups.for_slot(schedule.project_id, schedule.kind)? {
            let expired = backup.status.is_terminal()
                && backup.completed_at.map_or(false, |done| done < cutoff);
            if expired {
                candidates.push(backup);
            } else {
                report.retained.push(backup.id);
            }
        }

        loop {
            let mut progressed = false;
            let mut blocked = Vec::new();

            for backup in candidates {
                if self.storage.backups.has_children(backup.id)? {
                    blocked.push(backup);
                    continue;
                }
                match self.delete_one(&backup).await {
                    Ok(()) => {
                        report.deleted.push(backup.id);
                        progressed = true;
                    }
                    Err(VaultError::BackupHasDependents { .. }) => blocked.push(backup),
                    Err(e) => report.errors.push((backup.id, e.to_string())),
                }
            }

            candidates = blocked;
            if !progressed || candidates.is_empty() {
                break;
            }
        }

        report.skipped = candidates.into_iter().map(|b| b.id).collect();

        info!(
            schedule_id = %schedule.id,
            project_id = %schedule.project_id,
            kind = %schedule.kind,
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "retention enforced"
        );

        Ok(report)
    }

    /// Enforce every active schedule
    pub async fn enforce_all(&self, now: DateTime<Utc>) -> VaultResult<Vec<(ScheduleId, RetentionReport)>> {
        let mut reports = Vec::new();
        for schedule in self.storage.schedules.get_active()? {
            match self.enforce(&schedule, now).await {
                Ok(report) => reports.push((schedule.id, report)),
                Err(e) => warn!(schedule_id = %schedule.id, error = %e, "retention failed"),
            }
        }
        Ok(reports)
    }

    /// Delete one backup on request.
    ///
    /// A backup with dependents needs `cascade`, which removes every
    /// descendant first, deepest first. Returns the deleted ids in order.
    pub async fn delete(&self, id: BackupId, cascade: bool) -> VaultResult<Vec<BackupId>> {
        let target = self.storage.backups.require(id)?;
        ensure_not_active(&target)?;

        let descendants = self.descendants(id)?;
        if !descendants.is_empty() && !cascade {
            return Err(VaultError::BackupHasDependents {
                backup_id: id.to_string(),
                dependents: descendants.len(),
            });
        }
        for backup in &descendants {
            ensure_not_active(backup)?;
        }

        let mut deleted = Vec::new();
        for backup in descendants.iter().rev().chain(std::iter::once(&target)) {
            self.delete_one(backup).await?;
            deleted.push(backup.id);
        }

        info!(backup_id = %id, deleted = deleted.len(), cascade, "backup deleted");
        Ok(deleted)
    }

    /// All descendants in breadth-first order, so reversing gives deepest first
    fn descendants(&self, id: BackupId) -> VaultResult<Vec<Backup>> {
        let mut found: Vec<Backup> = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.storage.backups.children_of(current)? {
                if child.id == id || found.iter().any(|b| b.id == child.id) {
                    return Err(VaultError::BrokenChain {
                        backup_id: child.id.to_string(),
                        reason: "parent links form a cycle".into(),
                    });
                }
                frontier.insert(0, child.id);
                found.push(child);
            }
        }
        Ok(found)
    }

    /// Claim the row, remove the artifact, then the row. If the artifact
    /// cannot be removed the claim is released and the row keeps the error.
    async fn delete_one(&self, backup: &Backup) -> VaultResult<()> {
        let claimed = self.storage.backups.claim_for_deletion(backup.id)?;

        if !claimed.storage_path.is_empty() {
            let result = match self.adapters.get(claimed.storage_disk) {
                Ok(adapter) => adapter.delete(&claimed.storage_path).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(backup_id = %claimed.id, error = %e, "artifact deletion failed");
                let message = format!("artifact deletion failed: {}", e);
                if let Err(update) = self.storage.backups.release_deletion(claimed.id, message) {
                    warn!(backup_id = %claimed.id, error = %update, "failed to record deletion error");
                }
                return Err(e);
            }
        }

        self.storage.backups.remove_claimed(claimed.id)?;
        self.notifier
            .notify(&BackupEvent::for_backup(BackupEventKind::Deleted, &claimed));
        Ok(())
    }

    /// Periodic retention loop; stops when `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, every: StdDuration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.enforce_all(Utc::now()).await {
                        warn!(error = %e, "retention pass failed");
                    }
                }
            }
        }
    }
}

fn ensure_not_active(backup: &Backup) -> VaultResult<()> {
    if backup.status.is_terminal() {
        Ok(())
    } else {
        Err(VaultError::Validation(format!(
            "backup {} is {} and cannot be deleted",
            backup.id, backup.status
        )))
    }
}
