//! Settings for chainvault
//!
//! Storage disk credentials, capture limits, scheduler cadence and the
//! project directory. Every field has a default so a missing or partial
//! `config.json` still loads.

use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use super::paths::VaultPaths;
use crate::artifact::dump::DatabaseTarget;
use crate::error::VaultError;
use crate::models::{BackupKind, ProjectId};

/// Client-side artifact encryption for one disk.
///
/// Artifacts are sealed with AES-256-GCM under a key derived from the
/// passphrase with Argon2id; the cost parameters and a fresh salt are stored
/// in each artifact's header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub passphrase: String,
    /// Argon2 memory cost in KiB (default: 64 MiB)
    #[serde(default = "default_memory_cost")]
    pub memory_cost_kib: u32,
    #[serde(default = "default_time_cost")]
    pub time_cost: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

fn default_memory_cost() -> u32 {
    65536
}

fn default_time_cost() -> u32 {
    3
}

fn default_parallelism() -> u32 {
    4
}

impl EncryptionSettings {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            memory_cost_kib: default_memory_cost(),
            time_cost: default_time_cost(),
            parallelism: default_parallelism(),
        }
    }
}

/// S3-compatible bucket
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3Settings {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
}

/// Google Cloud Storage bucket
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GcsSettings {
    pub bucket: String,
    #[serde(default)]
    pub service_account_path: Option<PathBuf>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
}

/// Azure Blob container
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AzureSettings {
    pub account: String,
    pub container: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub encryption: Option<EncryptionSettings>,
}

/// Storage disk configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiskSettings {
    /// Overrides the `artifacts/` directory for the local disk
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    #[serde(default)]
    pub local_encryption: Option<EncryptionSettings>,
    #[serde(default)]
    pub s3: Option<S3Settings>,
    #[serde(default)]
    pub gcs: Option<GcsSettings>,
    #[serde(default)]
    pub azure: Option<AzureSettings>,
}

/// Maximum run duration per backup kind, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    pub file_seconds: u64,
    pub database_seconds: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            file_seconds: 3600,
            database_seconds: 3600,
        }
    }
}

impl RunLimits {
    pub fn for_kind(&self, kind: BackupKind) -> Duration {
        match kind {
            BackupKind::File => Duration::from_secs(self.file_seconds),
            BackupKind::Database => Duration::from_secs(self.database_seconds),
        }
    }
}

/// What to back up for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSource {
    pub project_id: ProjectId,
    #[serde(default)]
    pub name: String,
    /// Root of the project's file tree
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    /// Extra exclude globs on top of the defaults
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub database: Option<DatabaseTarget>,
}

/// Settings for chainvault
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub disks: DiskSettings,

    #[serde(default = "default_excludes")]
    pub default_excludes: Vec<String>,

    #[serde(default)]
    pub max_run_seconds: RunLimits,

    /// Upper bound when walking parent links
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// Scheduled runs start a new full chain once the newest chain is this deep
    #[serde(default = "default_max_incremental_depth")]
    pub max_incremental_depth: usize,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,

    #[serde(default = "default_retention_interval")]
    pub retention_interval_seconds: u64,

    /// Offset applied to schedule times of day, in minutes east of UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,

    #[serde(default)]
    pub projects: Vec<ProjectSource>,
}

fn default_schema_version() -> u32 {
    1
}

fn default_excludes() -> Vec<String> {
    [
        "storage/logs/*",
        "storage/framework/cache/*",
        "storage/framework/sessions/*",
        "storage/framework/views/*",
        "node_modules/*",
        "vendor/*",
        ".git/*",
        "*.log",
        ".env",
        ".env.*",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

fn default_max_chain_depth() -> usize {
    64
}

fn default_max_incremental_depth() -> usize {
    6
}

fn default_tick_interval() -> u64 {
    60
}

fn default_retention_interval() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            disks: DiskSettings::default(),
            default_excludes: default_excludes(),
            max_run_seconds: RunLimits::default(),
            max_chain_depth: default_max_chain_depth(),
            max_incremental_depth: default_max_incremental_depth(),
            tick_interval_seconds: default_tick_interval(),
            retention_interval_seconds: default_retention_interval(),
            utc_offset_minutes: 0,
            projects: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from disk, or return defaults if the file doesn't exist
    pub fn load_or_create(paths: &VaultPaths) -> Result<Self, VaultError> {
        let settings_path = paths.settings_file();

        if !settings_path.exists() {
            return Ok(Settings::default());
        }

        let contents = std::fs::read_to_string(&settings_path)
            .map_err(|e| VaultError::Io(format!("Failed to read settings file: {}", e)))?;

        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| VaultError::Config(format!("Failed to parse settings file: {}", e)))?;

        settings.schedule_offset()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, paths: &VaultPaths) -> Result<(), VaultError> {
        paths.ensure_directories()?;

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::Config(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(paths.settings_file(), contents)
            .map_err(|e| VaultError::Io(format!("Failed to write settings file: {}", e)))?;

        Ok(())
    }

    /// Time zone used for schedule times of day
    pub fn schedule_offset(&self) -> Result<FixedOffset, VaultError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            VaultError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })
    }

    pub fn project(&self, project_id: ProjectId) -> Option<&ProjectSource> {
        self.projects.iter().find(|p| p.project_id == project_id)
    }
}
