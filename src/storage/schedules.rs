//! Schedule repository for JSON storage
//!
//! Manages loading and saving backup schedules to schedules.json. Writes use
//! the same lock-and-reread cycle as the backup repository, so the CLI can
//! edit schedules while the scheduler daemon records ticks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::error::{VaultError, VaultResult};
use crate::models::{BackupSchedule, ScheduleId};

use super::file_io::{read_json, write_json_atomic, FileLock};

type ScheduleMap = HashMap<ScheduleId, BackupSchedule>;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ScheduleData {
    schedules: Vec<BackupSchedule>,
}

/// Repository for schedule persistence
pub struct ScheduleRepository {
    path: PathBuf,
    lock_path: PathBuf,
    data: RwLock<ScheduleMap>,
}

impl ScheduleRepository {
    pub fn new(path: PathBuf) -> Self {
        Self {
            lock_path: path.with_extension("json.lock"),
            path,
            data: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> VaultResult<RwLockReadGuard<'_, ScheduleMap>> {
        self.data
            .read()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire read lock: {}", e)))
    }

    fn write(&self) -> VaultResult<RwLockWriteGuard<'_, ScheduleMap>> {
        self.data
            .write()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire write lock: {}", e)))
    }

    fn read_file(&self) -> VaultResult<ScheduleMap> {
        let file_data: ScheduleData = read_json(&self.path)?;
        Ok(file_data.schedules.into_iter().map(|s| (s.id, s)).collect())
    }

    fn persist(&self, data: &ScheduleMap) -> VaultResult<()> {
        let mut schedules: Vec<_> = data.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        write_json_atomic(&self.path, &ScheduleData { schedules })
    }

    fn refresh(&self) -> VaultResult<RwLockReadGuard<'_, ScheduleMap>> {
        {
            let _lock = FileLock::shared(&self.lock_path)?;
            let fresh = self.read_file()?;
            *self.write()? = fresh;
        }
        self.read()
    }

    fn mutate<T, F>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&mut ScheduleMap) -> VaultResult<(T, bool)>,
    {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut data = self.write()?;

        let mut fresh = self.read_file()?;
        let (out, changed) = f(&mut fresh)?;
        if changed {
            self.persist(&fresh)?;
        }
        *data = fresh;
        Ok(out)
    }

    /// Load schedules from disk
    pub fn load(&self) -> VaultResult<()> {
        self.refresh().map(|_| ())
    }

    /// Rewrite the file from its current contents
    pub fn save(&self) -> VaultResult<()> {
        self.mutate(|_| Ok(((), true)))
    }

    pub fn get(&self, id: ScheduleId) -> VaultResult<Option<BackupSchedule>> {
        Ok(self.refresh()?.get(&id).cloned())
    }

    pub fn require(&self, id: ScheduleId) -> VaultResult<BackupSchedule> {
        self.get(id)?
            .ok_or_else(|| VaultError::schedule_not_found(id.to_string()))
    }

    /// Get all schedules, oldest first
    pub fn get_all(&self) -> VaultResult<Vec<BackupSchedule>> {
        let data = self.refresh()?;
        let mut schedules: Vec<_> = data.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    pub fn get_active(&self) -> VaultResult<Vec<BackupSchedule>> {
        Ok(self.get_all()?.into_iter().filter(|s| s.is_active).collect())
    }

    /// Active schedules whose `next_run_at` has passed
    pub fn due(&self, now: DateTime<Utc>) -> VaultResult<Vec<BackupSchedule>> {
        Ok(self.get_all()?.into_iter().filter(|s| s.is_due(now)).collect())
    }

    /// Insert or update a schedule.
    ///
    /// An active schedule may not share its project and kind with another
    /// active schedule.
    pub fn upsert(&self, schedule: BackupSchedule) -> VaultResult<()> {
        schedule.validate()?;

        self.mutate(|data| {
            if schedule.is_active {
                if let Some(other) = data.values().find(|s| {
                    s.id != schedule.id
                        && s.is_active
                        && s.project_id == schedule.project_id
                        && s.kind == schedule.kind
                }) {
                    return Err(VaultError::Duplicate {
                        entity_type: "Active schedule",
                        identifier: format!("{} {} ({})", schedule.project_id, schedule.kind, other.id),
                    });
                }
            }

            data.insert(schedule.id, schedule);
            Ok(((), true))
        })
    }

    /// Record that a tick handled the schedule and move it to its next slot.
    ///
    /// Only the run timestamps change, so an edit made elsewhere in the
    /// meantime (say a disable from the CLI) is kept.
    pub fn record_tick(
        &self,
        id: ScheduleId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> VaultResult<BackupSchedule> {
        self.mutate(|data| {
            let schedule = data
                .get_mut(&id)
                .ok_or_else(|| VaultError::schedule_not_found(id.to_string()))?;
            schedule.last_run_at = Some(ran_at);
            schedule.next_run_at = Some(next_run_at);
            Ok((schedule.clone(), true))
        })
    }

    /// Delete a schedule; backups it produced are kept
    pub fn delete(&self, id: ScheduleId) -> VaultResult<bool> {
        self.mutate(|data| {
            let removed = data.remove(&id).is_some();
            Ok((removed, removed))
        })
    }
}
