//! Schedule-driven backups
//!
//! Each tick looks at the active schedules whose `next_run_at` has passed,
//! starts a backup for each (full when the slot has no usable chain,
//! incremental on the newest completed backup otherwise) and moves the
//! schedule to its next slot. Missed slots collapse into a single run.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chain::{BackupChainManager, CreateRequest, RunHandle};
use super::source::ProjectDirectory;
use crate::config::Settings;
use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupKind, BackupSchedule, BackupType, ProjectId, ScheduleId};

/// What a tick did with one due schedule
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Started {
        backup_id: BackupId,
        backup_type: BackupType,
    },
    /// Another backup held the slot
    Skipped(String),
    /// The run could not be started
    Failed(String),
}

/// One due schedule handled by a tick
pub struct TriggeredRun {
    pub schedule_id: ScheduleId,
    pub project_id: ProjectId,
    pub kind: BackupKind,
    pub outcome: TickOutcome,
    pub next_run_at: Option<DateTime<Utc>>,
    run: Option<RunHandle>,
}

impl TriggeredRun {
    pub fn started(&self) -> bool {
        matches!(self.outcome, TickOutcome::Started { .. })
    }

    /// Wait for the started backup to finish; `None` if nothing started
    pub async fn wait(self) -> Option<VaultResult<Backup>> {
        match self.run {
            Some(run) => Some(run.wait().await),
            None => None,
        }
    }
}

pub struct Scheduler {
    chain: Arc<BackupChainManager>,
    directory: Arc<dyn ProjectDirectory>,
    offset: FixedOffset,
    max_incremental_depth: usize,
}

impl Scheduler {
    pub fn new(
        chain: Arc<BackupChainManager>,
        directory: Arc<dyn ProjectDirectory>,
        settings: &Settings,
    ) -> VaultResult<Self> {
        Ok(Self {
            chain,
            directory,
            offset: settings.schedule_offset()?,
            max_incremental_depth: settings.max_incremental_depth,
        })
    }

    /// Save a schedule with its first `next_run_at` after `now`
    pub fn register(&self, mut schedule: BackupSchedule, now: DateTime<Utc>) -> VaultResult<BackupSchedule> {
        schedule.next_run_at = if schedule.is_active {
            Some(schedule.next_run_after(now, self.offset)?)
        } else {
            None
        };
        self.chain.storage().schedules.upsert(schedule.clone())?;
        info!(
            schedule_id = %schedule.id,
            project_id = %schedule.project_id,
            kind = %schedule.kind,
            frequency = %schedule.frequency_label(),
            "schedule registered"
        );
        Ok(schedule)
    }

    /// Turn a schedule on or off. Existing backups are left alone.
    pub fn set_active(&self, id: ScheduleId, active: bool, now: DateTime<Utc>) -> VaultResult<BackupSchedule> {
        let mut schedule = self.chain.storage().schedules.require(id)?;
        schedule.is_active = active;
        self.register(schedule, now)
    }

    /// Start a backup for every due schedule.
    ///
    /// Runs are spawned, not awaited; each returned [`TriggeredRun`] can be
    /// waited on.
    pub fn tick(&self, now: DateTime<Utc>) -> VaultResult<Vec<TriggeredRun>> {
        let storage = self.chain.storage();
        let mut triggered = Vec::new();

        for schedule in storage.schedules.due(now)? {
            let (outcome, run) = self.trigger(&schedule);

            let next_run_at = match schedule.next_run_after(now, self.offset) {
                Ok(next) => {
                    storage.schedules.record_tick(schedule.id, now, next)?;
                    Some(next)
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "cannot compute next run");
                    None
                }
            };

            triggered.push(TriggeredRun {
                schedule_id: schedule.id,
                project_id: schedule.project_id,
                kind: schedule.kind,
                outcome,
                next_run_at,
                run,
            });
        }

        if !triggered.is_empty() {
            debug!(count = triggered.len(), "scheduler tick");
        }
        Ok(triggered)
    }

    fn trigger(&self, schedule: &BackupSchedule) -> (TickOutcome, Option<RunHandle>) {
        let storage = self.chain.storage();

        match storage.backups.running_for(schedule.project_id, schedule.kind) {
            Ok(Some(running)) => {
                let reason = format!("backup {} is still running", running.id);
                warn!(schedule_id = %schedule.id, %reason, "scheduled backup skipped");
                return (TickOutcome::Skipped(reason), None);
            }
            Ok(None) => {}
            Err(e) => return (TickOutcome::Failed(e.to_string()), None),
        }

        let request = match self.request_for(schedule) {
            Ok(request) => request,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "scheduled backup not started");
                return (TickOutcome::Failed(e.to_string()), None);
            }
        };
        let backup_type = request.backup_type;

        match self.chain.start(request) {
            Ok(run) => {
                info!(
                    schedule_id = %schedule.id,
                    backup_id = %run.backup.id,
                    backup_type = %backup_type,
                    "scheduled backup started"
                );
                let outcome = TickOutcome::Started {
                    backup_id: run.backup.id,
                    backup_type,
                };
                (outcome, Some(run))
            }
            Err(e @ VaultError::BackupAlreadyRunning { .. }) => {
                warn!(schedule_id = %schedule.id, error = %e, "scheduled backup skipped");
                (TickOutcome::Skipped(e.to_string()), None)
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "scheduled backup not started");
                (TickOutcome::Failed(e.to_string()), None)
            }
        }
    }

    fn request_for(&self, schedule: &BackupSchedule) -> VaultResult<CreateRequest> {
        let source = self.directory.resolve(schedule.project_id, schedule.kind)?;
        let (backup_type, parent_backup_id) = self.plan(schedule.project_id, schedule.kind)?;
        Ok(CreateRequest {
            project_id: schedule.project_id,
            kind: schedule.kind,
            backup_type,
            parent_backup_id,
            storage_disk: schedule.storage_disk,
            source,
        })
    }

    /// Full when there is no completed full backup, or the newest chain is
    /// broken or already at the incremental limit; otherwise incremental on
    /// the newest completed backup.
    pub fn plan(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<(BackupType, Option<BackupId>)> {
        let backups = &self.chain.storage().backups;
        if backups.latest_completed_full(project_id, kind)?.is_none() {
            return Ok((BackupType::Full, None));
        }

        let latest = match backups.latest_completed(project_id, kind)? {
            Some(latest) => latest,
            None => return Ok((BackupType::Full, None)),
        };

        let limit = self.max_incremental_depth.min(self.chain.max_chain_depth());
        match self.chain.depth(latest.id) {
            Ok(depth) if depth < limit => Ok((BackupType::Incremental, Some(latest.id))),
            Ok(_) => Ok((BackupType::Full, None)),
            Err(e) => {
                warn!(backup_id = %latest.id, error = %e, "starting a new chain");
                Ok((BackupType::Full, None))
            }
        }
    }

    /// Tick every `every` until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, every: StdDuration, shutdown: CancellationToken) {
        match self.chain.fail_interrupted() {
            Ok(failed) if !failed.is_empty() => {
                warn!(count = failed.len(), "failed backups left running by a previous process")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not check for interrupted backups"),
        }

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
