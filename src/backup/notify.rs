//! Backup event notifications
//!
//! Terminal events (completed, failed, deleted, restored) are handed to a
//! [`Notifier`] fire-and-forget: a notifier that cannot deliver logs a
//! warning and the backup operation carries on. [`EventLog`] appends each
//! event as one JSON line to `events.log`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupKind, BackupType, ProjectId};

/// What happened to a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupEventKind {
    Completed,
    Failed,
    Deleted,
    Restored,
}

/// One terminal event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub timestamp: DateTime<Utc>,
    pub event: BackupEventKind,
    pub backup_id: BackupId,
    pub project_id: ProjectId,
    pub kind: BackupKind,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BackupEvent {
    pub fn for_backup(event: BackupEventKind, backup: &Backup) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            backup_id: backup.id,
            project_id: backup.project_id,
            kind: backup.kind,
            backup_type: backup.backup_type,
            size_bytes: backup.size_bytes,
            message: backup.error_message.clone(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Receives terminal backup events
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &BackupEvent);
}

/// Append-only JSONL log of backup events
pub struct EventLog {
    log_path: PathBuf,
}

impl EventLog {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Append one event and flush
    pub fn log(&self, event: &BackupEvent) -> VaultResult<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| VaultError::Io(format!("Failed to open event log: {}", e)))?;

        let json = serde_json::to_string(event)
            .map_err(|e| VaultError::Json(format!("Failed to serialize event: {}", e)))?;

        writeln!(file, "{}", json)
            .map_err(|e| VaultError::Io(format!("Failed to write event: {}", e)))?;

        file.flush()
            .map_err(|e| VaultError::Io(format!("Failed to flush event log: {}", e)))?;

        Ok(())
    }

    /// Read all events, oldest first
    pub fn read_all(&self) -> VaultResult<Vec<BackupEvent>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .map_err(|e| VaultError::Io(format!("Failed to open event log: {}", e)))?;

        let mut events = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                VaultError::Io(format!("Failed to read event log line {}: {}", line_num + 1, e))
            })?;

            if line.trim().is_empty() {
                continue;
            }

            let event: BackupEvent = serde_json::from_str(&line).map_err(|e| {
                VaultError::Json(format!(
                    "Failed to parse event at line {}: {}",
                    line_num + 1,
                    e
                ))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    /// The most recent `count` events
    pub fn read_recent(&self, count: usize) -> VaultResult<Vec<BackupEvent>> {
        let all = self.read_all()?;
        let start = all.len().saturating_sub(count);
        Ok(all[start..].to_vec())
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Notifier for EventLog {
    fn notify(&self, event: &BackupEvent) {
        if let Err(e) = self.log(event) {
            warn!(backup_id = %event.backup_id, error = %e, "failed to record backup event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StorageDisk;
    use tempfile::TempDir;

    fn backup() -> Backup {
        Backup::pending(
            ProjectId::new(),
            BackupKind::File,
            BackupType::Full,
            None,
            StorageDisk::Local,
        )
    }

    #[test]
    fn test_log_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let log = EventLog::new(temp_dir.path().join("events.log"));

        let b = backup();
        log.notify(&BackupEvent::for_backup(BackupEventKind::Completed, &b));
        log.notify(
            &BackupEvent::for_backup(BackupEventKind::Failed, &b).with_message("disk full"),
        );

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, BackupEventKind::Completed);
        assert_eq!(events[1].message.as_deref(), Some("disk full"));

        let recent = log.read_recent(1).unwrap();
        assert_eq!(recent[0].event, BackupEventKind::Failed);
    }

    #[test]
    fn test_jsonl_format() {
        let temp_dir = TempDir::new().unwrap();
        let log = EventLog::new(temp_dir.path().join("events.log"));
        log.log(&BackupEvent::for_backup(BackupEventKind::Deleted, &backup()))
            .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(r#""event":"deleted""#));
    }

    #[test]
    fn test_read_missing_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = EventLog::new(temp_dir.path().join("none.log"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
