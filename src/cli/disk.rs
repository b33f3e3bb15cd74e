//! Storage disk CLI commands

use clap::Subcommand;

use crate::backup::BackupServices;
use crate::display::format_connection_report;
use crate::error::{VaultError, VaultResult};
use crate::models::StorageDisk;

/// Disk subcommands
#[derive(Subcommand)]
pub enum DiskCommands {
    /// List configured disks
    List,
    /// Check that a disk can list, write, read and delete
    Test {
        /// Disk to test (local, s3, gcs, azure)
        #[arg(default_value = "local")]
        disk: String,
    },
}

/// Handle a disk command
pub async fn handle_disk_command(services: &BackupServices, cmd: DiskCommands) -> VaultResult<()> {
    match cmd {
        DiskCommands::List => {
            for disk in services.adapters.disks() {
                let sealed = if services.adapters.is_encrypted(disk) {
                    " (encrypted)"
                } else {
                    ""
                };
                println!("{}{}", disk, sealed);
            }
        }
        DiskCommands::Test { disk } => {
            let disk: StorageDisk = disk.parse()?;
            let report = services.adapters.test_connection(disk).await?;
            print!("{}", format_connection_report(&report));

            if let Some((check, error)) = report.failure {
                return Err(VaultError::StorageIo(format!(
                    "disk {} failed the {} check: {}",
                    disk, check, error
                )));
            }
            println!("Disk {} is reachable.", disk);
        }
    }

    Ok(())
}
