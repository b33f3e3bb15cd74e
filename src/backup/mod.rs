//! Backup chains for chainvault
//!
//! # Architecture
//!
//! - `BackupChainManager`: creates full and incremental backups, one running
//!   backup per project and kind
//! - `Scheduler`: turns due schedules into backup runs
//! - `RetentionEnforcer`: deletes expired backups, leaves first
//! - `RestoreEngine`: replays a chain from its full root
//!
//! All four share the record store and the storage adapters. They coordinate
//! through record status and parent links only.
//!
//! # Example
//!
//! ```rust,ignore
//! use chainvault::backup::{BackupServices, RestoreDestination};
//! use chainvault::config::{paths::VaultPaths, settings::Settings};
//!
//! let paths = VaultPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let services = BackupServices::open(paths, &settings)?;
//!
//! let backup = services.chain.create(request).await?;
//! let result = services
//!     .restore
//!     .restore(backup.id, RestoreDestination::Directory("/srv/restore".into()), false)
//!     .await?;
//! println!("{}", result.summary());
//! ```

pub mod chain;
pub mod notify;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{resolve_chain, BackupChainManager, CreateRequest, RunHandle};
pub use notify::{BackupEvent, BackupEventKind, EventLog, Notifier};
pub use restore::{RestoreDestination, RestoreEngine, RestoreResult};
pub use retention::{RetentionEnforcer, RetentionReport};
pub use scheduler::{Scheduler, TickOutcome, TriggeredRun};
pub use source::{merge_excludes, ProjectDirectory, SettingsDirectory, SourceSelector};

use std::sync::Arc;

use crate::artifact::adapter::StorageRegistry;
use crate::artifact::dump::{CommandDumper, DatabaseDumper};
use crate::config::{Settings, VaultPaths};
use crate::error::VaultResult;
use crate::storage::Storage;

/// The backup services wired to one data directory
pub struct BackupServices {
    pub storage: Arc<Storage>,
    pub adapters: StorageRegistry,
    pub events: Arc<EventLog>,
    pub chain: Arc<BackupChainManager>,
    pub scheduler: Arc<Scheduler>,
    pub retention: Arc<RetentionEnforcer>,
    pub restore: Arc<RestoreEngine>,
}

impl BackupServices {
    /// Load the record store and build every service from `settings`
    pub fn open(paths: VaultPaths, settings: &Settings) -> VaultResult<Self> {
        let adapters = StorageRegistry::from_settings(settings, &paths)?;
        let events = Arc::new(EventLog::new(paths.events_log()));

        let storage = Arc::new(Storage::new(paths)?);
        storage.load_all()?;

        let dumper: Arc<dyn DatabaseDumper> = Arc::new(CommandDumper::new());
        let notifier: Arc<dyn Notifier> = events.clone();

        let chain = Arc::new(BackupChainManager::new(
            Arc::clone(&storage),
            adapters.clone(),
            Arc::clone(&dumper),
            Arc::clone(&notifier),
            settings,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&chain),
            Arc::new(SettingsDirectory::from_settings(settings)),
            settings,
        )?);
        let retention = Arc::new(RetentionEnforcer::new(
            Arc::clone(&storage),
            adapters.clone(),
            Arc::clone(&notifier),
        ));
        let restore = Arc::new(RestoreEngine::new(
            Arc::clone(&storage),
            adapters.clone(),
            dumper,
            notifier,
            settings.max_chain_depth,
        ));

        Ok(Self {
            storage,
            adapters,
            events,
            chain,
            scheduler,
            retention,
            restore,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_empty_vault() {
        let temp = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp.path().to_path_buf());
        let services = BackupServices::open(paths.clone(), &Settings::default()).unwrap();

        assert_eq!(services.storage.backups.count().unwrap(), 0);
        assert!(services.adapters.get(crate::models::StorageDisk::Local).is_ok());
        assert_eq!(services.events.path(), &paths.events_log());
    }
}
