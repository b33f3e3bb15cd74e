//! Schedule CLI commands

use chrono::Utc;
use clap::Subcommand;

use super::{resolve_project, resolve_schedule};
use crate::backup::BackupServices;
use crate::config::settings::Settings;
use crate::display::format_schedule_list;
use crate::error::VaultResult;
use crate::models::{BackupKind, BackupSchedule, Frequency, StorageDisk};

/// Schedule subcommands
#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Add a recurring backup schedule
    Add {
        /// Project name or ID
        project: String,
        /// What to back up (file, database)
        #[arg(short, long, default_value = "database")]
        kind: String,
        /// hourly, daily, weekly or monthly
        #[arg(short, long, default_value = "daily")]
        frequency: String,
        /// Time of day (HH:MM)
        #[arg(short, long, default_value = "02:00")]
        time: String,
        /// Weekday for weekly schedules (0 = Sunday)
        #[arg(long)]
        day_of_week: Option<u8>,
        /// Day of month for monthly schedules (1-31)
        #[arg(long)]
        day_of_month: Option<u8>,
        /// Days to keep backups
        #[arg(short, long, default_value = "7")]
        retention_days: u32,
        /// Storage disk (local, s3, gcs, azure)
        #[arg(short, long, default_value = "local")]
        disk: String,
    },
    /// List schedules
    List,
    /// Resume a schedule
    Enable {
        /// Schedule ID
        schedule: String,
    },
    /// Pause a schedule; existing backups are kept
    Disable {
        /// Schedule ID
        schedule: String,
    },
    /// Delete a schedule; existing backups are kept
    Remove {
        /// Schedule ID
        schedule: String,
    },
}

/// Handle a schedule command
pub fn handle_schedule_command(
    services: &BackupServices,
    settings: &Settings,
    cmd: ScheduleCommands,
) -> VaultResult<()> {
    let now = Utc::now();

    match cmd {
        ScheduleCommands::Add {
            project,
            kind,
            frequency,
            time,
            day_of_week,
            day_of_month,
            retention_days,
            disk,
        } => {
            let project = resolve_project(settings, &project)?;
            let kind: BackupKind = kind.parse()?;
            let frequency: Frequency = frequency.parse()?;
            let storage_disk: StorageDisk = disk.parse()?;
            services.adapters.get(storage_disk)?;

            let mut schedule = BackupSchedule::new(
                project.project_id,
                kind,
                frequency,
                BackupSchedule::parse_time(&time)?,
                retention_days,
                storage_disk,
            );
            schedule.day_of_week = day_of_week;
            schedule.day_of_month = day_of_month;

            let schedule = services.scheduler.register(schedule, now)?;
            println!("Added schedule: {}", schedule.id);
            println!("  {} {} backups of {}", schedule.frequency_label(), kind, project.name);
            if let Some(next) = schedule.next_run_at {
                println!("  Next run: {}", next.format("%Y-%m-%d %H:%M UTC"));
            }
        }

        ScheduleCommands::List => {
            let schedules = services.storage.schedules.get_all()?;
            print!("{}", format_schedule_list(&schedules));
        }

        ScheduleCommands::Enable { schedule } => {
            let schedule = resolve_schedule(&services.storage, &schedule)?;
            let schedule = services.scheduler.set_active(schedule.id, true, now)?;
            println!("Enabled schedule {}", schedule.id.short());
        }

        ScheduleCommands::Disable { schedule } => {
            let schedule = resolve_schedule(&services.storage, &schedule)?;
            let schedule = services.scheduler.set_active(schedule.id, false, now)?;
            println!("Disabled schedule {}", schedule.id.short());
        }

        ScheduleCommands::Remove { schedule } => {
            let schedule = resolve_schedule(&services.storage, &schedule)?;
            services.storage.schedules.delete(schedule.id)?;
            println!("Removed schedule {}", schedule.id.short());
        }
    }

    Ok(())
}
