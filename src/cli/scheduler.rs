//! Scheduler CLI commands
//!
//! `tick` handles due schedules once and waits for the runs; `run` keeps the
//! scheduler and retention loops going until interrupted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backup::{BackupServices, TickOutcome};
use crate::config::settings::Settings;
use crate::error::{VaultError, VaultResult};

/// Scheduler subcommands
#[derive(Subcommand)]
pub enum SchedulerCommands {
    /// Run due schedules once and wait for them
    Tick,
    /// Run the scheduler and retention loops until Ctrl-C
    Run,
}

/// Handle a scheduler command
pub async fn handle_scheduler_command(
    services: &BackupServices,
    settings: &Settings,
    cmd: SchedulerCommands,
) -> VaultResult<()> {
    match cmd {
        SchedulerCommands::Tick => {
            let runs = services.scheduler.tick(Utc::now())?;
            if runs.is_empty() {
                println!("No schedules due.");
                return Ok(());
            }

            for run in runs {
                let schedule = run.schedule_id.short();
                match run.outcome.clone() {
                    TickOutcome::Started { backup_id, backup_type } => {
                        println!("{}: started {} backup {}", schedule, backup_type, backup_id.short());
                        if let Some(result) = run.wait().await {
                            let backup = result?;
                            println!(
                                "{}: backup {} {}{}",
                                schedule,
                                backup.id.short(),
                                backup.status,
                                backup
                                    .error_message
                                    .map(|m| format!(" ({})", m))
                                    .unwrap_or_default()
                            );
                        }
                    }
                    TickOutcome::Skipped(reason) => println!("{}: skipped, {}", schedule, reason),
                    TickOutcome::Failed(reason) => println!("{}: not started, {}", schedule, reason),
                }
            }
        }

        SchedulerCommands::Run => {
            let shutdown = CancellationToken::new();

            let scheduler = tokio::spawn(Arc::clone(&services.scheduler).run(
                Duration::from_secs(settings.tick_interval_seconds.max(1)),
                shutdown.clone(),
            ));
            let retention = tokio::spawn(Arc::clone(&services.retention).run(
                Duration::from_secs(settings.retention_interval_seconds.max(1)),
                shutdown.clone(),
            ));

            println!("Scheduler running. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            shutdown.cancel();

            for task in [scheduler, retention] {
                task.await
                    .map_err(|e| VaultError::Io(format!("background task failed: {}", e)))?;
            }
        }
    }

    Ok(())
}
