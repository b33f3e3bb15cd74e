use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chainvault::backup::BackupServices;
use chainvault::cli::{
    handle_backup_command, handle_disk_command, handle_project_command, handle_restore_command,
    handle_retention_command, handle_schedule_command, handle_scheduler_command,
};
use chainvault::config::{paths::VaultPaths, settings::Settings};

#[derive(Parser)]
#[command(
    name = "chainvault",
    version,
    about = "Full and incremental backups of project files and databases",
    long_about = "chainvault creates full and incremental backup chains of project \
                  files and databases, runs them on schedules, expires them by \
                  retention policy and restores any point in a chain."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Project management commands
    #[command(subcommand)]
    Project(chainvault::cli::ProjectCommands),

    /// Backup management commands
    #[command(subcommand)]
    Backup(chainvault::cli::BackupCommands),

    /// Restore a backup chain
    Restore(chainvault::cli::RestoreArgs),

    /// Schedule management commands
    #[command(subcommand)]
    Schedule(chainvault::cli::ScheduleCommands),

    /// Retention commands
    #[command(subcommand)]
    Retention(chainvault::cli::RetentionCommands),

    /// Run scheduled backups
    #[command(subcommand)]
    Scheduler(chainvault::cli::SchedulerCommands),

    /// Storage disk commands
    #[command(subcommand)]
    Disk(chainvault::cli::DiskCommands),

    /// Initialize the data directory
    Init,

    /// Show current configuration and paths
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chainvault=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Initialize paths and settings
    let paths = VaultPaths::new()?;
    let mut settings = Settings::load_or_create(&paths)?;

    match cli.command {
        Some(Commands::Project(cmd)) => {
            handle_project_command(&paths, &mut settings, cmd)?;
        }
        Some(Commands::Backup(cmd)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_backup_command(&services, &settings, cmd).await?;
        }
        Some(Commands::Restore(args)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_restore_command(&services, &settings, args).await?;
        }
        Some(Commands::Schedule(cmd)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_schedule_command(&services, &settings, cmd)?;
        }
        Some(Commands::Retention(cmd)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_retention_command(&services, cmd).await?;
        }
        Some(Commands::Scheduler(cmd)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_scheduler_command(&services, &settings, cmd).await?;
        }
        Some(Commands::Disk(cmd)) => {
            let services = BackupServices::open(paths, &settings)?;
            handle_disk_command(&services, cmd).await?;
        }
        Some(Commands::Init) => {
            println!("Initializing chainvault at: {}", paths.base_dir().display());
            paths.ensure_directories()?;
            settings.save(&paths)?;
            println!("Initialization complete!");
            println!();
            println!("Register a project with:");
            println!("  chainvault project add <name> --path <dir> [--database <name>]");
        }
        Some(Commands::Config) => {
            println!("chainvault Configuration");
            println!("========================");
            println!("Base directory:     {}", paths.base_dir().display());
            println!("Data directory:     {}", paths.data_dir().display());
            println!("Artifact directory: {}", paths.artifact_dir().display());
            println!("Settings file:      {}", paths.settings_file().display());
            println!(
                "Initialized:        {}",
                if paths.is_initialized() { "yes" } else { "no (run 'chainvault init')" }
            );
            println!();
            println!("Settings:");
            println!("  Max chain depth:       {}", settings.max_chain_depth);
            println!("  Max incremental depth: {}", settings.max_incremental_depth);
            println!("  Tick interval:         {}s", settings.tick_interval_seconds);
            println!("  Retention interval:    {}s", settings.retention_interval_seconds);
            println!("  UTC offset:            {}m", settings.utc_offset_minutes);
            println!("  Projects:              {}", settings.projects.len());
        }
        None => {
            println!("chainvault - backup chains for project files and databases");
            println!();
            println!("Run 'chainvault --help' for usage information.");
        }
    }

    Ok(())
}
