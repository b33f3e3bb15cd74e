//! Record store for chainvault
//!
//! Backup and schedule rows kept as JSON files with atomic writes. Artifacts
//! themselves live on the storage disks, see [`crate::artifact`].

pub mod backups;
pub mod file_io;
pub mod schedules;

pub use backups::BackupRepository;
pub use file_io::{read_json, write_json_atomic};
pub use schedules::ScheduleRepository;

use crate::config::paths::VaultPaths;
use crate::error::VaultError;

/// Main storage coordinator that provides access to all repositories
pub struct Storage {
    paths: VaultPaths,
    pub backups: BackupRepository,
    pub schedules: ScheduleRepository,
}

impl Storage {
    /// Create a new Storage instance
    pub fn new(paths: VaultPaths) -> Result<Self, VaultError> {
        paths.ensure_directories()?;

        Ok(Self {
            backups: BackupRepository::new(paths.backups_file()),
            schedules: ScheduleRepository::new(paths.schedules_file()),
            paths,
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    /// Load all data from disk
    pub fn load_all(&self) -> Result<(), VaultError> {
        self.backups.load()?;
        self.schedules.load()?;
        Ok(())
    }

    /// Save all data to disk
    pub fn save_all(&self) -> Result<(), VaultError> {
        self.backups.save()?;
        self.schedules.save()?;
        Ok(())
    }
}
