//! CLI command handlers
//!
//! This module contains the implementation of CLI commands,
//! bridging the clap argument parsing with the backup services.

pub mod backup;
pub mod disk;
pub mod project;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod scheduler;

pub use backup::{handle_backup_command, BackupCommands};
pub use disk::{handle_disk_command, DiskCommands};
pub use project::{handle_project_command, ProjectCommands};
pub use restore::{handle_restore_command, RestoreArgs};
pub use retention::{handle_retention_command, RetentionCommands};
pub use schedule::{handle_schedule_command, ScheduleCommands};
pub use scheduler::{handle_scheduler_command, SchedulerCommands};

use crate::config::settings::{ProjectSource, Settings};
use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupSchedule};
use crate::storage::Storage;

/// Find a backup by full id or unique id prefix (`bak-1a2b3c4d` as listed)
pub fn resolve_backup(storage: &Storage, input: &str) -> VaultResult<Backup> {
    if let Ok(id) = input.parse() {
        return storage.backups.require(id);
    }

    let matches: Vec<Backup> = storage
        .backups
        .get_all()?
        .into_iter()
        .filter(|b| id_matches(&b.id.to_string(), &b.id.as_uuid().to_string(), input))
        .collect();
    single(matches, "Backup", input)
}

/// Find a schedule by full id or unique id prefix
pub fn resolve_schedule(storage: &Storage, input: &str) -> VaultResult<BackupSchedule> {
    if let Ok(id) = input.parse() {
        return storage.schedules.require(id);
    }

    let matches: Vec<BackupSchedule> = storage
        .schedules
        .get_all()?
        .into_iter()
        .filter(|s| id_matches(&s.id.to_string(), &s.id.as_uuid().to_string(), input))
        .collect();
    single(matches, "Schedule", input)
}

/// Find a configured project by name, full id or unique id prefix
pub fn resolve_project<'a>(settings: &'a Settings, input: &str) -> VaultResult<&'a ProjectSource> {
    if let Some(project) = settings
        .projects
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(input.trim()))
    {
        return Ok(project);
    }

    let matches: Vec<&ProjectSource> = settings
        .projects
        .iter()
        .filter(|p| {
            id_matches(
                &p.project_id.to_string(),
                &p.project_id.as_uuid().to_string(),
                input,
            )
        })
        .collect();
    single(matches, "Project", input)
}

fn id_matches(display: &str, bare: &str, input: &str) -> bool {
    let input = input.trim();
    input.len() >= 4 && (display.starts_with(input) || bare.starts_with(input))
}

fn single<T>(mut matches: Vec<T>, entity_type: &'static str, input: &str) -> VaultResult<T> {
    match matches.len() {
        0 => Err(VaultError::NotFound {
            entity_type,
            identifier: input.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        n => Err(VaultError::Validation(format!(
            "'{}' matches {} {}s; use more of the id",
            input,
            n,
            entity_type.to_lowercase()
        ))),
    }
}
