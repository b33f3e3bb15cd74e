//! Backup CLI commands
//!
//! Implements CLI commands for creating, inspecting and deleting backups.

use clap::Subcommand;

use super::{resolve_backup, resolve_project};
use crate::backup::{merge_excludes, BackupServices, CreateRequest, ProjectDirectory, SettingsDirectory, SourceSelector};
use crate::config::settings::Settings;
use crate::display::{format_backup_details, format_backup_list};
use crate::error::{VaultError, VaultResult};
use crate::models::{BackupKind, BackupType, StorageDisk};

/// Backup subcommands
#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a backup and wait for it to finish
    Create {
        /// Project name or ID
        project: String,
        /// What to back up (file, database)
        #[arg(short, long, default_value = "file")]
        kind: String,
        /// Backup type (full, incremental)
        #[arg(short = 't', long = "type", default_value = "full")]
        backup_type: String,
        /// Parent backup ID for incremental backups ('latest' for the newest completed)
        #[arg(short, long)]
        parent: Option<String>,
        /// Storage disk (local, s3, gcs, azure)
        #[arg(short, long, default_value = "local")]
        disk: String,
        /// Extra exclude glob for this run (repeatable)
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,
    },

    /// List backups
    List {
        /// Only this project
        #[arg(short, long)]
        project: Option<String>,
        /// Only this kind (file, database)
        #[arg(short, long)]
        kind: Option<String>,
        /// Number of backups to show, newest last
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show details of a backup
    Show {
        /// Backup ID
        backup: String,
    },

    /// Recompute a backup's checksum against its stored artifact
    Verify {
        /// Backup ID
        backup: String,
    },

    /// Cancel a running backup
    Cancel {
        /// Backup ID
        backup: String,
    },

    /// Delete a backup and its artifact
    Delete {
        /// Backup ID
        backup: String,
        /// Also delete every backup that depends on it
        #[arg(long)]
        cascade: bool,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Show recent backup events
    Events {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Handle a backup command
pub async fn handle_backup_command(
    services: &BackupServices,
    settings: &Settings,
    cmd: BackupCommands,
) -> VaultResult<()> {
    let storage = &services.storage;

    match cmd {
        BackupCommands::Create {
            project,
            kind,
            backup_type,
            parent,
            disk,
            excludes,
        } => {
            let project = resolve_project(settings, &project)?;
            let kind: BackupKind = kind.parse()?;
            let backup_type: BackupType = backup_type.parse()?;
            let storage_disk: StorageDisk = disk.parse()?;

            let parent_backup_id = match parent.as_deref() {
                None => None,
                Some(p) if p.eq_ignore_ascii_case("latest") => Some(
                    storage
                        .backups
                        .latest_completed(project.project_id, kind)?
                        .ok_or_else(|| VaultError::InvalidParentBackup {
                            reason: format!("{} has no completed {} backup", project.name, kind),
                        })?
                        .id,
                ),
                Some(p) => Some(resolve_backup(storage, p)?.id),
            };

            let source = match SettingsDirectory::from_settings(settings).resolve(project.project_id, kind)? {
                SourceSelector::Files { root, exclude } => SourceSelector::Files {
                    root,
                    exclude: merge_excludes(&[&exclude, &excludes]),
                },
                database => database,
            };

            println!("Creating {} {} backup of {}...", backup_type, kind, project.name);
            let backup = services
                .chain
                .create(CreateRequest {
                    project_id: project.project_id,
                    kind,
                    backup_type,
                    parent_backup_id,
                    storage_disk,
                    source,
                })
                .await?;

            let depth = services.chain.depth(backup.id).ok();
            print!("{}", format_backup_details(&backup, depth));

            if !backup.is_completed() {
                return Err(VaultError::Io(format!(
                    "backup {} failed: {}",
                    backup.id.short(),
                    backup.error_message.as_deref().unwrap_or("unknown error")
                )));
            }
        }

        BackupCommands::List {
            project,
            kind,
            limit,
        } => {
            let project_id = match project {
                Some(p) => Some(resolve_project(settings, &p)?.project_id),
                None => None,
            };
            let kind: Option<BackupKind> = kind.map(|k| k.parse()).transpose()?;

            let backups: Vec<_> = storage
                .backups
                .get_all()?
                .into_iter()
                .filter(|b| project_id.map_or(true, |id| b.project_id == id))
                .filter(|b| kind.map_or(true, |k| b.kind == k))
                .collect();
            let skip = backups.len().saturating_sub(limit);

            print!("{}", format_backup_list(&backups[skip..]));
        }

        BackupCommands::Show { backup } => {
            let backup = resolve_backup(storage, &backup)?;
            let depth = services.chain.depth(backup.id).ok();
            print!("{}", format_backup_details(&backup, depth));

            let children = storage.backups.children_of(backup.id)?;
            if !children.is_empty() {
                println!();
                println!("  Dependents:");
                for child in children {
                    println!("    {} ({})", child.id.short(), child.status);
                }
            }
        }

        BackupCommands::Verify { backup } => {
            let backup = resolve_backup(storage, &backup)?;
            services.chain.verify(backup.id).await?;
            println!(
                "Checksum OK: {} ({})",
                backup.id.short(),
                backup.checksum.as_deref().unwrap_or("")
            );
        }

        BackupCommands::Cancel { backup } => {
            let backup = resolve_backup(storage, &backup)?;
            let cancelled = services.chain.cancel(backup.id)?;
            println!("Cancelled backup {}", cancelled.id.short());
        }

        BackupCommands::Delete {
            backup,
            cascade,
            force,
        } => {
            let backup = resolve_backup(storage, &backup)?;

            if !force {
                let dependents = storage.backups.children_of(backup.id)?;
                println!("Would delete backup {} ({})", backup.id.short(), backup.storage_path);
                if !dependents.is_empty() {
                    println!(
                        "It has {} direct dependent(s){}.",
                        dependents.len(),
                        if cascade { ", which will be deleted too" } else { "" }
                    );
                }
                println!("To proceed, run again with --force flag:");
                println!(
                    "  chainvault backup delete {}{} --force",
                    backup.id.short(),
                    if cascade { " --cascade" } else { "" }
                );
                return Ok(());
            }

            let deleted = services.retention.delete(backup.id, cascade).await?;
            for id in &deleted {
                println!("Deleted {}", id.short());
            }
            println!("Deleted {} backup(s).", deleted.len());
        }

        BackupCommands::Events { limit } => {
            let events = services.events.read_recent(limit)?;
            if events.is_empty() {
                println!("No backup events recorded.");
                return Ok(());
            }
            for event in events {
                println!(
                    "{}  {:<9}  {}  {} {}{}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    format!("{:?}", event.event).to_lowercase(),
                    event.backup_id.short(),
                    event.kind,
                    event.backup_type,
                    event
                        .message
                        .map(|m| format!("  {}", m))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
