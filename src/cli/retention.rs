//! Retention CLI commands

use chrono::Utc;
use clap::Subcommand;

use super::resolve_schedule;
use crate::backup::BackupServices;
use crate::display::format_retention_report;
use crate::error::VaultResult;

/// Retention subcommands
#[derive(Subcommand)]
pub enum RetentionCommands {
    /// Delete expired backups now
    Enforce {
        /// Only this schedule (default: every active schedule)
        #[arg(short, long)]
        schedule: Option<String>,
    },
}

/// Handle a retention command
pub async fn handle_retention_command(services: &BackupServices, cmd: RetentionCommands) -> VaultResult<()> {
    match cmd {
        RetentionCommands::Enforce { schedule } => {
            let now = Utc::now();
            let reports = match schedule {
                Some(s) => {
                    let schedule = resolve_schedule(&services.storage, &s)?;
                    let report = services.retention.enforce(&schedule, now).await?;
                    vec![(schedule.id, report)]
                }
                None => services.retention.enforce_all(now).await?,
            };

            if reports.is_empty() {
                println!("No active schedules.");
            }
            for (id, report) in reports {
                println!("Schedule {}:", id.short());
                print!("{}", format_retention_report(&report));
            }
        }
    }

    Ok(())
}
