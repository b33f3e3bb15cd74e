//! Restore CLI command

use std::path::PathBuf;

use clap::Args;

use super::{resolve_backup, resolve_project};
use crate::artifact::dump::{DatabaseEngine, DatabaseTarget};
use crate::backup::{BackupServices, RestoreDestination};
use crate::config::settings::Settings;
use crate::error::{VaultError, VaultResult};
use crate::models::BackupKind;

/// Restore arguments
#[derive(Args)]
pub struct RestoreArgs {
    /// Backup ID to restore to (its whole chain is replayed)
    pub backup: String,

    /// Directory to unpack a file backup into
    #[arg(long, conflicts_with = "database")]
    pub to: Option<PathBuf>,

    /// Database to replay a database backup into (defaults to the project's)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Engine of --database (mysql, postgres, sqlite)
    #[arg(short, long)]
    pub engine: Option<String>,

    /// Replace existing data at the destination
    #[arg(long)]
    pub overwrite: bool,
}

/// Handle the restore command
pub async fn handle_restore_command(
    services: &BackupServices,
    settings: &Settings,
    args: RestoreArgs,
) -> VaultResult<()> {
    let backup = resolve_backup(&services.storage, &args.backup)?;

    let destination = match backup.kind {
        BackupKind::File => {
            let dir = args.to.ok_or_else(|| {
                VaultError::Validation("restoring a file backup needs --to <dir>".into())
            })?;
            RestoreDestination::Directory(dir)
        }
        BackupKind::Database => {
            let configured = resolve_project(settings, &backup.project_id.to_string())
                .ok()
                .and_then(|p| p.database.clone());

            let target = match (args.database, configured) {
                (Some(name), Some(mut target)) => {
                    if let Some(engine) = args.engine {
                        target.engine = engine.parse()?;
                    }
                    target.database = name;
                    target
                }
                (Some(name), None) => {
                    let engine: DatabaseEngine = args.engine.as_deref().unwrap_or("mysql").parse()?;
                    DatabaseTarget::new(engine, name)
                }
                (None, Some(target)) => target,
                (None, None) => {
                    return Err(VaultError::Validation(
                        "restoring a database backup needs --database <name>".into(),
                    ))
                }
            };
            RestoreDestination::Database(target)
        }
    };

    println!("Restoring {} ...", backup.id.short());
    let result = services
        .restore
        .restore(backup.id, destination, args.overwrite)
        .await?;

    println!("Restore complete!");
    println!("{}", result.summary());
    Ok(())
}
