//! Shared fixtures for the backup service tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use object_store::memory::InMemory;
use tempfile::TempDir;

use super::chain::{BackupChainManager, CreateRequest};
use super::notify::{BackupEvent, Notifier};
use super::source::SourceSelector;
use crate::artifact::adapter::{ObjectStoreAdapter, StorageAdapter, StorageRegistry};
use crate::artifact::dump::{
    DatabaseDumper, DatabaseEngine, DatabaseTarget, GunzipChunker, GzipChunker,
};
use crate::artifact::ArtifactSink;
use crate::config::{Settings, VaultPaths};
use crate::error::{VaultError, VaultResult};
use crate::models::{Backup, BackupId, BackupKind, BackupType, ProjectId, StorageDisk};
use crate::storage::Storage;

/// Dumper keeping database contents in memory
#[derive(Default)]
pub struct MemoryDumper {
    pub databases: Mutex<HashMap<String, Vec<u8>>>,
    /// Plain-text dumps replayed by `restore`, in order
    pub replayed: Mutex<Vec<Vec<u8>>>,
    pub delay: Mutex<Option<Duration>>,
}

impl MemoryDumper {
    pub fn set(&self, database: &str, content: &[u8]) {
        self.databases
            .lock()
            .unwrap()
            .insert(database.to_string(), content.to_vec());
    }

    pub fn content(&self, database: &str) -> Option<Vec<u8>> {
        self.databases.lock().unwrap().get(database).cloned()
    }

    pub fn slow(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl DatabaseDumper for MemoryDumper {
    async fn dump(&self, target: &DatabaseTarget, out: &mut dyn ArtifactSink) -> VaultResult<()> {
        let content = self
            .content(&target.database)
            .ok_or_else(|| VaultError::Io(format!("unknown database {}", target.database)))?;

        let mut gzip = GzipChunker::new();
        for chunk in content.chunks(16) {
            out.write(&gzip.update(chunk)?).await?;
            // a slow dump that is cut off leaves partial output behind
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        out.write(&gzip.finish()?).await
    }

    async fn restore(&self, target: &DatabaseTarget, artifact: &Path) -> VaultResult<()> {
        let compressed = tokio::fs::read(artifact).await?;
        let mut gunzip = GunzipChunker::new();
        let mut sql = gunzip.update(&compressed)?;
        sql.extend(gunzip.finish()?);
        self.replayed.lock().unwrap().push(sql.clone());
        self.set(&target.database, &sql);
        Ok(())
    }

    async fn has_data(&self, target: &DatabaseTarget) -> VaultResult<bool> {
        Ok(self
            .content(&target.database)
            .map_or(false, |c| !c.is_empty()))
    }
}

/// Notifier remembering every event
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<BackupEvent>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &BackupEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
    pub storage: Arc<Storage>,
    pub adapters: StorageRegistry,
    pub dumper: Arc<MemoryDumper>,
    pub events: Arc<RecordingNotifier>,
    pub project_id: ProjectId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(dir.path().join("vault"));
        let storage = Arc::new(Storage::new(paths).unwrap());

        let mut adapters = StorageRegistry::new();
        adapters.insert(Arc::new(ObjectStoreAdapter::new(
            StorageDisk::Local,
            Arc::new(InMemory::new()),
            None,
        )));

        Self {
            dir,
            settings,
            storage,
            adapters,
            dumper: Arc::new(MemoryDumper::default()),
            events: Arc::new(RecordingNotifier::default()),
            project_id: ProjectId::new(),
        }
    }

    pub fn adapter(&self) -> Arc<dyn StorageAdapter> {
        self.adapters.get(StorageDisk::Local).unwrap()
    }

    pub fn manager(&self) -> Arc<BackupChainManager> {
        Arc::new(BackupChainManager::new(
            Arc::clone(&self.storage),
            self.adapters.clone(),
            self.dumper.clone(),
            self.events.clone(),
            &self.settings,
        ))
    }

    pub fn db_target(&self) -> DatabaseTarget {
        DatabaseTarget::new(DatabaseEngine::Mysql, "shop")
    }

    pub fn db_request(&self, backup_type: BackupType, parent: Option<BackupId>) -> CreateRequest {
        CreateRequest {
            project_id: self.project_id,
            kind: BackupKind::Database,
            backup_type,
            parent_backup_id: parent,
            storage_disk: StorageDisk::Local,
            source: SourceSelector::Database(self.db_target()),
        }
    }

    /// Run a database backup to completion with `content` as the dump
    pub async fn db_backup(
        &self,
        manager: &Arc<BackupChainManager>,
        content: &str,
        parent: Option<BackupId>,
    ) -> Backup {
        self.dumper.set("shop", content.as_bytes());
        let backup_type = if parent.is_some() {
            BackupType::Incremental
        } else {
            BackupType::Full
        };
        manager
            .create(self.db_request(backup_type, parent))
            .await
            .unwrap()
    }
}
