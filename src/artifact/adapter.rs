//! Storage adapters
//!
//! A [`StorageAdapter`] gives the backup core one streaming surface over
//! every disk: `create` an upload, `open` a download, `delete`, `exists` and
//! `list`. All four disks are served by `object_store` backends; the
//! registry builds one adapter per configured disk from [`Settings`] and
//! layers optional encryption and checksumming on top.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::buffered::BufWriter;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::checksum::Checksum;
use super::crypto::{ArtifactCipher, FrameEncryptor};
use super::ArtifactSink;
use crate::config::paths::VaultPaths;
use crate::config::settings::{EncryptionSettings, Settings};
use crate::error::{VaultError, VaultResult};
use crate::models::StorageDisk;

/// An upload in progress; nothing is committed until `finish`
#[async_trait]
pub trait ArtifactWriter: ArtifactSink {
    async fn finish(self: Box<Self>) -> VaultResult<()>;

    /// Give up on the upload, discarding whatever the backend staged
    async fn abort(self: Box<Self>) -> VaultResult<()>;
}

/// Uniform access to one storage disk
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Which disk this adapter serves
    fn disk(&self) -> StorageDisk;

    /// Start a streaming upload to `path`, replacing anything already there
    async fn create(&self, path: &str) -> VaultResult<Box<dyn ArtifactWriter>>;

    /// Stream the stored bytes of `path`
    async fn open(&self, path: &str) -> VaultResult<BoxStream<'static, VaultResult<Vec<u8>>>>;

    /// Remove `path`; a missing object is not an error
    async fn delete(&self, path: &str) -> VaultResult<()>;

    async fn exists(&self, path: &str) -> VaultResult<bool>;

    /// Up to `limit` stored paths under `prefix`
    async fn list(&self, prefix: &str, limit: usize) -> VaultResult<Vec<String>>;

    /// Store `bytes` at `path` in one go
    async fn write(&self, path: &str, bytes: Vec<u8>) -> VaultResult<()> {
        let mut writer = self.create(path).await?;
        writer.write(&bytes).await?;
        writer.finish().await
    }

    async fn read(&self, path: &str) -> VaultResult<Vec<u8>> {
        let mut stream = self.open(path).await?;
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes)
    }
}

fn upload_error(location: &ObjectPath, e: std::io::Error) -> VaultError {
    VaultError::StorageIo(format!("upload to {} failed: {}", location, e))
}

/// Upload through `object_store`'s buffered writer, which switches to a
/// multipart upload once the data outgrows one part
struct ObjectStoreWriter {
    inner: BufWriter,
    location: ObjectPath,
}

#[async_trait]
impl ArtifactSink for ObjectStoreWriter {
    async fn write(&mut self, chunk: &[u8]) -> VaultResult<()> {
        self.inner
            .write_all(chunk)
            .await
            .map_err(|e| upload_error(&self.location, e))
    }
}

#[async_trait]
impl ArtifactWriter for ObjectStoreWriter {
    async fn finish(mut self: Box<Self>) -> VaultResult<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| upload_error(&self.location, e))
    }

    async fn abort(mut self: Box<Self>) -> VaultResult<()> {
        self.inner.abort().await?;
        Ok(())
    }
}

/// [`StorageAdapter`] over any `object_store` backend
pub struct ObjectStoreAdapter {
    disk: StorageDisk,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectStoreAdapter {
    pub fn new(disk: StorageDisk, store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            disk,
            store,
            prefix,
        }
    }

    fn location(&self, path: &str) -> VaultResult<ObjectPath> {
        let path = path.trim_matches('/');
        let full = match &self.prefix {
            Some(prefix) if path.is_empty() => prefix.clone(),
            Some(prefix) => format!("{}/{}", prefix, path),
            None => path.to_string(),
        };
        ObjectPath::parse(&full)
            .map_err(|e| VaultError::StorageIo(format!("invalid artifact path '{}': {}", full, e)))
    }

    /// Strip the disk prefix from a listed location
    fn relative(&self, location: &ObjectPath) -> String {
        let full = location.as_ref();
        match &self.prefix {
            Some(prefix) => full
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(full)
                .to_string(),
            None => full.to_string(),
        }
    }
}

#[async_trait]
impl StorageAdapter for ObjectStoreAdapter {
    fn disk(&self) -> StorageDisk {
        self.disk
    }

    async fn create(&self, path: &str) -> VaultResult<Box<dyn ArtifactWriter>> {
        let location = self.location(path)?;
        debug!(disk = %self.disk, %location, "starting upload");
        Ok(Box::new(ObjectStoreWriter {
            inner: BufWriter::new(Arc::clone(&self.store), location.clone()),
            location,
        }))
    }

    async fn open(&self, path: &str) -> VaultResult<BoxStream<'static, VaultResult<Vec<u8>>>> {
        let location = self.location(path)?;
        let result = self.store.get(&location).await?;
        Ok(result
            .into_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(VaultError::from)
            .boxed())
    }

    async fn delete(&self, path: &str) -> VaultResult<()> {
        let location = self.location(path)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> VaultResult<bool> {
        let location = self.location(path)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> VaultResult<Vec<String>> {
        let location = self.location(prefix)?;
        let scope = if location.as_ref().is_empty() {
            None
        } else {
            Some(&location)
        };

        let mut listing = self.store.list(scope);
        let mut paths = Vec::new();
        while paths.len() < limit {
            match listing.next().await {
                Some(meta) => paths.push(self.relative(&meta?.location)),
                None => break,
            }
        }
        Ok(paths)
    }
}

/// Size and checksum of an artifact as stored on its disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub size_bytes: u64,
    pub checksum: String,
}

/// Streaming upload of one artifact: plaintext in, encrypted (when the disk
/// has a passphrase) and hashed on the way to the disk.
///
/// `written` counts stored bytes as they leave, so a run that fails half way
/// can report how far it got.
pub struct ArtifactUpload {
    writer: Box<dyn ArtifactWriter>,
    encryptor: Option<FrameEncryptor>,
    checksum: Checksum,
    stored: u64,
    written: Arc<AtomicU64>,
}

impl ArtifactUpload {
    pub fn new(
        writer: Box<dyn ArtifactWriter>,
        encryptor: Option<FrameEncryptor>,
        written: Arc<AtomicU64>,
    ) -> Self {
        Self {
            writer,
            encryptor,
            checksum: Checksum::new(),
            stored: 0,
            written,
        }
    }

    async fn store(&mut self, bytes: &[u8]) -> VaultResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.checksum.update(bytes);
        self.writer.write(bytes).await?;
        self.stored += bytes.len() as u64;
        self.written.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flush the last frame and commit the upload
    pub async fn finish(mut self) -> VaultResult<StoredArtifact> {
        if let Some(encryptor) = self.encryptor.take() {
            let tail = encryptor.finish()?;
            self.store(&tail).await?;
        }

        let Self {
            writer,
            checksum,
            stored,
            ..
        } = self;
        writer.finish().await?;

        Ok(StoredArtifact {
            size_bytes: stored,
            checksum: checksum.finalize(),
        })
    }

    pub async fn abort(self) -> VaultResult<()> {
        self.writer.abort().await
    }
}

#[async_trait]
impl ArtifactSink for ArtifactUpload {
    async fn write(&mut self, chunk: &[u8]) -> VaultResult<()> {
        match self.encryptor.as_mut() {
            Some(encryptor) => {
                let sealed = encryptor.update(chunk)?;
                self.store(&sealed).await
            }
            None => self.store(chunk).await,
        }
    }
}

/// Result of streaming an artifact to a local file.
///
/// A decryption failure is held back so the caller can report a checksum
/// mismatch first; tampered ciphertext should read as corruption.
pub struct Download {
    pub stored: StoredArtifact,
    decode_error: Option<VaultError>,
}

impl Download {
    /// The stored artifact, or the error hit while decoding it
    pub fn decoded(self) -> VaultResult<StoredArtifact> {
        match self.decode_error {
            Some(e) => Err(e),
            None => Ok(self.stored),
        }
    }
}

/// One step of a disk connection test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCheck {
    List,
    Write,
    Read,
    Delete,
}

impl std::fmt::Display for ConnectionCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Outcome of [`StorageRegistry::test_connection`]
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub disk: StorageDisk,
    /// Steps that passed, with their timing
    pub passed: Vec<(ConnectionCheck, Duration)>,
    /// First step that failed, and why
    pub failure: Option<(ConnectionCheck, String)>,
}

impl ConnectionReport {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// One adapter per configured disk
#[derive(Clone, Default)]
pub struct StorageRegistry {
    adapters: HashMap<StorageDisk, Arc<dyn StorageAdapter>>,
    ciphers: HashMap<StorageDisk, Arc<ArtifactCipher>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for the local disk and every configured cloud disk
    pub fn from_settings(settings: &Settings, paths: &VaultPaths) -> VaultResult<Self> {
        let mut registry = Self::new();
        let disks = &settings.disks;

        let local_root = disks
            .local_root
            .clone()
            .unwrap_or_else(|| paths.artifact_dir());
        std::fs::create_dir_all(&local_root).map_err(|e| {
            VaultError::Io(format!("Failed to create {}: {}", local_root.display(), e))
        })?;
        let local = LocalFileSystem::new_with_prefix(&local_root)?;
        registry.insert(Arc::new(ObjectStoreAdapter::new(
            StorageDisk::Local,
            Arc::new(local),
            None,
        )));
        if let Some(encryption) = &disks.local_encryption {
            registry.encrypt_disk(StorageDisk::Local, encryption)?;
        }

        if let Some(s3) = &disks.s3 {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(&s3.bucket)
                .with_allow_http(s3.allow_http);
            if let Some(region) = &s3.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &s3.endpoint {
                builder = builder.with_endpoint(endpoint);
            }
            if let Some(key) = &s3.access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = &s3.secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            registry.insert(Arc::new(ObjectStoreAdapter::new(
                StorageDisk::S3,
                Arc::new(builder.build()?),
                s3.path_prefix.clone(),
            )));
            if let Some(encryption) = &s3.encryption {
                registry.encrypt_disk(StorageDisk::S3, encryption)?;
            }
        }

        if let Some(gcs) = &disks.gcs {
            let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&gcs.bucket);
            if let Some(path) = &gcs.service_account_path {
                builder = builder.with_service_account_path(path.to_string_lossy());
            }
            registry.insert(Arc::new(ObjectStoreAdapter::new(
                StorageDisk::Gcs,
                Arc::new(builder.build()?),
                gcs.path_prefix.clone(),
            )));
            if let Some(encryption) = &gcs.encryption {
                registry.encrypt_disk(StorageDisk::Gcs, encryption)?;
            }
        }

        if let Some(azure) = &disks.azure {
            let mut builder = MicrosoftAzureBuilder::from_env()
                .with_account(&azure.account)
                .with_container_name(&azure.container);
            if let Some(key) = &azure.access_key {
                builder = builder.with_access_key(key);
            }
            registry.insert(Arc::new(ObjectStoreAdapter::new(
                StorageDisk::Azure,
                Arc::new(builder.build()?),
                azure.path_prefix.clone(),
            )));
            if let Some(encryption) = &azure.encryption {
                registry.encrypt_disk(StorageDisk::Azure, encryption)?;
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, adapter: Arc<dyn StorageAdapter>) {
        self.adapters.insert(adapter.disk(), adapter);
    }

    /// Seal every artifact written to `disk` from now on
    pub fn encrypt_disk(&mut self, disk: StorageDisk, settings: &EncryptionSettings) -> VaultResult<()> {
        self.ciphers.insert(disk, Arc::new(ArtifactCipher::new(settings)?));
        Ok(())
    }

    pub fn is_encrypted(&self, disk: StorageDisk) -> bool {
        self.ciphers.contains_key(&disk)
    }

    /// Adapter for `disk`, or a storage error if the disk is not configured
    pub fn get(&self, disk: StorageDisk) -> VaultResult<Arc<dyn StorageAdapter>> {
        self.adapters
            .get(&disk)
            .cloned()
            .ok_or_else(|| VaultError::StorageIo(format!("storage disk '{}' is not configured", disk)))
    }

    pub fn disks(&self) -> Vec<StorageDisk> {
        let mut disks: Vec<_> = self.adapters.keys().copied().collect();
        disks.sort_by_key(|d| d.to_string());
        disks
    }

    /// Start uploading an artifact to `disk`
    pub async fn upload(
        &self,
        disk: StorageDisk,
        path: &str,
        written: Arc<AtomicU64>,
    ) -> VaultResult<ArtifactUpload> {
        let adapter = self.get(disk)?;
        let encryptor = match self.ciphers.get(&disk) {
            Some(cipher) => Some(cipher.encryptor()?),
            None => None,
        };
        let writer = adapter.create(path).await?;
        Ok(ArtifactUpload::new(writer, encryptor, written))
    }

    /// Stream an artifact into `dest`, decrypting when the disk is encrypted.
    ///
    /// The checksum always covers the bytes as stored.
    pub async fn download(&self, disk: StorageDisk, path: &str, dest: &Path) -> VaultResult<Download> {
        let adapter = self.get(disk)?;
        let mut decryptor = self.ciphers.get(&disk).map(|c| c.decryptor());

        let mut stream = adapter.open(path).await?;
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            VaultError::Io(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        let write_error =
            |e: std::io::Error| VaultError::Io(format!("Failed to write {}: {}", dest.display(), e));

        let mut checksum = Checksum::new();
        let mut stored = 0u64;
        let mut decode_error = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            checksum.update(&chunk);
            stored += chunk.len() as u64;
            if decode_error.is_some() {
                continue;
            }

            match decryptor.as_mut() {
                Some(dec) => match dec.update(&chunk) {
                    Ok(plain) => file.write_all(&plain).await.map_err(write_error)?,
                    Err(e) => decode_error = Some(e),
                },
                None => file.write_all(&chunk).await.map_err(write_error)?,
            }
        }

        if decode_error.is_none() {
            if let Some(dec) = decryptor {
                decode_error = dec.finish().err();
            }
        }
        file.flush().await.map_err(write_error)?;

        Ok(Download {
            stored: StoredArtifact {
                size_bytes: stored,
                checksum: checksum.finalize(),
            },
            decode_error,
        })
    }

    /// Size and checksum of an artifact as stored, without decoding it
    pub async fn checksum_of(&self, disk: StorageDisk, path: &str) -> VaultResult<StoredArtifact> {
        let mut stream = self.get(disk)?.open(path).await?;
        let mut checksum = Checksum::new();
        let mut stored = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            checksum.update(&chunk);
            stored += chunk.len() as u64;
        }
        Ok(StoredArtifact {
            size_bytes: stored,
            checksum: checksum.finalize(),
        })
    }

    /// List, write, read back and delete a scratch file on `disk`.
    ///
    /// Stops at the first failing step. Only an unconfigured disk is an
    /// error; backend failures are reported in the [`ConnectionReport`].
    pub async fn test_connection(&self, disk: StorageDisk) -> VaultResult<ConnectionReport> {
        let adapter = self.get(disk)?;
        let path = format!(".chainvault-connection-test-{}.txt", uuid::Uuid::new_v4().simple());
        let content = format!("chainvault storage test {}", chrono::Utc::now().to_rfc3339());

        let mut report = ConnectionReport {
            disk,
            passed: Vec::new(),
            failure: None,
        };

        let start = Instant::now();
        if let Err(e) = adapter.list("", 1).await {
            report.failure = Some((ConnectionCheck::List, e.to_string()));
            return Ok(report);
        }
        report.passed.push((ConnectionCheck::List, start.elapsed()));

        let start = Instant::now();
        if let Err(e) = adapter.write(&path, content.clone().into_bytes()).await {
            report.failure = Some((ConnectionCheck::Write, e.to_string()));
            return Ok(report);
        }
        report.passed.push((ConnectionCheck::Write, start.elapsed()));

        let start = Instant::now();
        let read = match adapter.read(&path).await {
            Ok(bytes) if bytes == content.as_bytes() => None,
            Ok(_) => Some("content read back differs from what was written".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = read {
            if let Err(e) = adapter.delete(&path).await {
                warn!(%disk, %path, error = %e, "failed to remove connection test file");
            }
            report.failure = Some((ConnectionCheck::Read, reason));
            return Ok(report);
        }
        report.passed.push((ConnectionCheck::Read, start.elapsed()));

        let start = Instant::now();
        let deleted = match adapter.delete(&path).await {
            Ok(()) => match adapter.exists(&path).await {
                Ok(false) => None,
                Ok(true) => Some("file still exists after delete".to_string()),
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };
        match deleted {
            Some(reason) => report.failure = Some((ConnectionCheck::Delete, reason)),
            None => report.passed.push((ConnectionCheck::Delete, start.elapsed())),
        }

        Ok(report)
    }
}
