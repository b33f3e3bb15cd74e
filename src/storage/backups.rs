//! Backup repository for JSON storage
//!
//! Manages loading and saving backup records to backups.json. The CLI, the
//! scheduler daemon and background restores may all hold a repository on the
//! same file, so every mutation takes the exclusive file lock, re-reads the
//! file and writes it back before the lock is released. Reads refresh from
//! disk under the shared lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupKind, BackupStatus, ProjectId};

use super::file_io::{read_json, write_json_atomic, FileLock};

type BackupMap = HashMap<BackupId, Backup>;

/// Serializable backup data structure
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct BackupData {
    backups: Vec<Backup>,
}

/// Repository for backup persistence
pub struct BackupRepository {
    path: PathBuf,
    lock_path: PathBuf,
    data: RwLock<BackupMap>,
}

impl BackupRepository {
    pub fn new(path: PathBuf) -> Self {
        Self {
            lock_path: path.with_extension("json.lock"),
            path,
            data: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> VaultResult<RwLockReadGuard<'_, BackupMap>> {
        self.data
            .read()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire read lock: {}", e)))
    }

    fn write(&self) -> VaultResult<RwLockWriteGuard<'_, BackupMap>> {
        self.data
            .write()
            .map_err(|e| VaultError::Storage(format!("Failed to acquire write lock: {}", e)))
    }

    fn read_file(&self) -> VaultResult<BackupMap> {
        let file_data: BackupData = read_json(&self.path)?;
        Ok(file_data.backups.into_iter().map(|b| (b.id, b)).collect())
    }

    fn persist(&self, data: &BackupMap) -> VaultResult<()> {
        let mut backups: Vec<_> = data.values().cloned().collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        write_json_atomic(&self.path, &BackupData { backups })
    }

    /// Pick up rows written by other processes
    fn refresh(&self) -> VaultResult<RwLockReadGuard<'_, BackupMap>> {
        {
            let _lock = FileLock::shared(&self.lock_path)?;
            let fresh = self.read_file()?;
            *self.write()? = fresh;
        }
        self.read()
    }

    /// Read-modify-write under the exclusive file lock.
    ///
    /// `f` works on the rows as they are on disk right now and reports
    /// whether it changed anything; the file is only rewritten if it did.
    fn mutate<T, F>(&self, f: F) -> VaultResult<T>
    where
        F: FnOnce(&mut BackupMap) -> VaultResult<(T, bool)>,
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

    /// Load backups from disk
    pub fn load(&self) -> VaultResult<()> {
        self.refresh().map(|_| ())
    }

    /// Rewrite the file from its current contents
    pub fn save(&self) -> VaultResult<()> {
        self.mutate(|_| Ok(((), true)))
    }

    pub fn get(&self, id: BackupId) -> VaultResult<Option<Backup>> {
        Ok(self.refresh()?.get(&id).cloned())
    }

    /// Get a backup or fail with NotFound
    pub fn require(&self, id: BackupId) -> VaultResult<Backup> {
        self.get(id)?
            .ok_or_else(|| VaultError::backup_not_found(id.to_string()))
    }

    /// Get all backups, oldest first
    pub fn get_all(&self) -> VaultResult<Vec<Backup>> {
        let data = self.refresh()?;
        let mut backups: Vec<_> = data.values().cloned().collect();
        backups.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(backups)
    }

    /// Backups of one project and kind, oldest first
    pub fn for_slot(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<Vec<Backup>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|b| b.same_slot(project_id, kind))
            .collect())
    }

    /// Direct children of a backup
    pub fn children_of(&self, id: BackupId) -> VaultResult<Vec<Backup>> {
        let data = self.refresh()?;
        let mut children: Vec<_> = data
            .values()
            .filter(|b| b.parent_backup_id == Some(id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(children)
    }

    /// Whether any backup names `id` as its parent
    pub fn has_children(&self, id: BackupId) -> VaultResult<bool> {
        let data = self.refresh()?;
        Ok(data.values().any(|b| b.parent_backup_id == Some(id)))
    }

    /// The backup currently holding the running slot, if any
    pub fn running_for(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<Option<Backup>> {
        let data = self.refresh()?;
        Ok(data
            .values()
            .find(|b| b.same_slot(project_id, kind) && b.is_running())
            .cloned())
    }

    /// Most recently finished completed backup of the slot
    pub fn latest_completed(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<Option<Backup>> {
        Ok(self
            .for_slot(project_id, kind)?
            .into_iter()
            .filter(|b| b.is_completed() && !b.deleting)
            .max_by(|a, b| {
                a.completed_at
                    .cmp(&b.completed_at)
                    .then(a.started_at.cmp(&b.started_at))
            }))
    }

    /// Most recently finished completed full backup of the slot
    pub fn latest_completed_full(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<Option<Backup>> {
        Ok(self
            .for_slot(project_id, kind)?
            .into_iter()
            .filter(|b| b.is_completed() && b.is_full() && !b.deleting)
            .max_by(|a, b| a.completed_at.cmp(&b.completed_at)))
    }

    /// Insert a new backup record.
    ///
    /// An incremental is only accepted while its parent exists, is completed,
    /// belongs to the same project and kind, and is not being deleted. The
    /// check runs under the file lock, so a parent claimed by retention can
    /// never gain a child.
    pub fn insert(&self, backup: Backup) -> VaultResult<()> {
        backup.validate()?;

        self.mutate(|data| {
            if data.contains_key(&backup.id) {
                return Err(VaultError::Duplicate {
                    entity_type: "Backup",
                    identifier: backup.id.to_string(),
                });
            }

            if let Some(parent_id) = backup.parent_backup_id {
                let reason = match data.get(&parent_id) {
                    None => Some(format!("parent backup {} does not exist", parent_id)),
                    Some(p) if p.deleting => Some(format!("parent backup {} is being deleted", parent_id)),
                    Some(p) if !p.is_completed() => {
                        Some(format!("parent backup {} is {}", parent_id, p.status))
                    }
                    Some(p) if !p.same_slot(backup.project_id, backup.kind) => Some(format!(
                        "parent backup {} belongs to a different project or kind",
                        parent_id
                    )),
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    return Err(VaultError::InvalidParentBackup { reason });
                }
            }

            data.insert(backup.id, backup);
            Ok(((), true))
        })
    }

    /// Move a pending backup to running, unless another backup of the same
    /// project and kind already holds the slot.
    ///
    /// The check and the update happen under one lock, so of two racing
    /// callers exactly one gets the slot, in this process or another.
    pub fn start_run(&self, id: BackupId, at: DateTime<Utc>) -> VaultResult<Backup> {
        self.mutate(|data| {
            let mut backup = data
                .get(&id)
                .cloned()
                .ok_or_else(|| VaultError::backup_not_found(id.to_string()))?;

            if !backup.status.can_transition_to(BackupStatus::Running) {
                return Err(VaultError::Validation(format!(
                    "backup {} is {} and cannot start",
                    id, backup.status
                )));
            }

            if data
                .values()
                .any(|b| b.id != id && b.same_slot(backup.project_id, backup.kind) && b.is_running())
            {
                return Err(VaultError::BackupAlreadyRunning {
                    project_id: backup.project_id.to_string(),
                    kind: backup.kind.to_string(),
                });
            }

            backup.status = BackupStatus::Running;
            backup.started_at = at;
            data.insert(id, backup.clone());
            Ok((backup, true))
        })
    }

    /// Apply `mutate` to a backup only if it is still in status `from`.
    ///
    /// Returns `None` when the row has moved on (for example a run that was
    /// cancelled from another process while it was finishing) or no longer
    /// exists.
    pub fn transition<F>(&self, id: BackupId, from: BackupStatus, mutate: F) -> VaultResult<Option<Backup>>
    where
        F: FnOnce(&mut Backup),
    {
        self.mutate(|data| {
            let mut backup = match data.get(&id) {
                Some(b) if b.status == from => b.clone(),
                _ => return Ok((None, false)),
            };

            mutate(&mut backup);
            if backup.status != from && !from.can_transition_to(backup.status) {
                return Err(VaultError::Validation(format!(
                    "backup {} cannot move from {} to {}",
                    id, from, backup.status
                )));
            }
            backup.validate()?;

            data.insert(id, backup.clone());
            Ok((Some(backup), true))
        })
    }

    /// Replace an existing record
    pub fn update(&self, backup: Backup) -> VaultResult<()> {
        backup.validate()?;

        self.mutate(|data| {
            if !data.contains_key(&backup.id) {
                return Err(VaultError::backup_not_found(backup.id.to_string()));
            }
            data.insert(backup.id, backup);
            Ok(((), true))
        })
    }

    /// Delete a record, returning it if it existed
    pub fn remove(&self, id: BackupId) -> VaultResult<Option<Backup>> {
        self.mutate(|data| {
            let removed = data.remove(&id);
            let changed = removed.is_some();
            Ok((removed, changed))
        })
    }

    /// Mark a finished leaf backup as being deleted.
    ///
    /// Fails with `BackupHasDependents` if anything names it as parent. Once
    /// claimed, `insert` refuses new children, so the artifact can be removed
    /// without a child appearing underneath it. A row that is already
    /// claimed (a deletion interrupted by a crash) can be claimed again.
    pub fn claim_for_deletion(&self, id: BackupId) -> VaultResult<Backup> {
        self.mutate(|data| {
            let dependents = data
                .values()
                .filter(|b| b.parent_backup_id == Some(id))
                .count();
            if dependents > 0 {
                return Err(VaultError::BackupHasDependents {
                    backup_id: id.to_string(),
                    dependents,
                });
            }

            let backup = data
                .get_mut(&id)
                .ok_or_else(|| VaultError::backup_not_found(id.to_string()))?;
            if !backup.status.is_terminal() {
                return Err(VaultError::Validation(format!(
                    "backup {} is {} and cannot be deleted",
                    id, backup.status
                )));
            }

            backup.deleting = true;
            Ok((backup.clone(), true))
        })
    }

    /// Give a claimed row back after its artifact could not be deleted; only
    /// the deletion flag and the error message change
    pub fn release_deletion(&self, id: BackupId, message: impl Into<String>) -> VaultResult<Option<Backup>> {
        let message = message.into();
        self.mutate(|data| match data.get_mut(&id) {
            Some(backup) => {
                backup.deleting = false;
                backup.error_message = Some(message);
                Ok((Some(backup.clone()), true))
            }
            None => Ok((None, false)),
        })
    }

    /// Remove a row claimed by `claim_for_deletion`
    pub fn remove_claimed(&self, id: BackupId) -> VaultResult<Option<Backup>> {
        self.mutate(|data| match data.get(&id) {
            Some(b) if b.deleting => {
                let removed = data.remove(&id);
                Ok((removed, true))
            }
            Some(_) => Err(VaultError::Validation(format!(
                "backup {} is not claimed for deletion",
                id
            ))),
            None => Ok((None, false)),
        })
    }

    pub fn count(&self) -> VaultResult<usize> {
        Ok(self.refresh()?.len())
    }
}
