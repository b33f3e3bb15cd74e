//! Path management for chainvault
//!
//! ## Path Resolution Order
//!
//! 1. `CHAINVAULT_DATA_DIR` environment variable (if set)
//! 2. Unix (Linux/macOS): `$XDG_CONFIG_HOME/chainvault` or `~/.config/chainvault`
//! 3. Windows: `%APPDATA%\chainvault`

use std::path::PathBuf;

use crate::error::VaultError;

/// Manages all paths used by chainvault
#[derive(Debug, Clone)]
pub struct VaultPaths {
    base_dir: PathBuf,
}

impl VaultPaths {
    /// Resolve paths from the environment
    pub fn new() -> Result<Self, VaultError> {
        let base_dir = if let Ok(custom) = std::env::var("CHAINVAULT_DATA_DIR") {
            PathBuf::from(custom)
        } else {
            resolve_default_path()?
        };

        Ok(Self { base_dir })
    }

    /// Create VaultPaths with a custom base directory (useful for testing)
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Record store directory (backups.json, schedules.json)
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Root of the `local` storage disk
    pub fn artifact_dir(&self) -> PathBuf {
        self.base_dir.join("artifacts")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Append-only log of terminal backup events
    pub fn events_log(&self) -> PathBuf {
        self.base_dir.join("events.log")
    }

    pub fn backups_file(&self) -> PathBuf {
        self.data_dir().join("backups.json")
    }

    pub fn schedules_file(&self) -> PathBuf {
        self.data_dir().join("schedules.json")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<(), VaultError> {
        for dir in [self.base_dir.clone(), self.data_dir(), self.artifact_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                VaultError::Io(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Check if chainvault has been initialized (config file exists)
    pub fn is_initialized(&self) -> bool {
        self.settings_file().exists()
    }
}

#[cfg(not(windows))]
fn resolve_default_path() -> Result<PathBuf, VaultError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("chainvault"));
    }
    let home = std::env::var("HOME")
        .map_err(|_| VaultError::Config("HOME environment variable not set".into()))?;
    Ok(PathBuf::from(home).join(".config").join("chainvault"))
}

#[cfg(windows)]
fn resolve_default_path() -> Result<PathBuf, VaultError> {
    let appdata = std::env::var("APPDATA")
        .map_err(|_| VaultError::Config("Could not determine APPDATA directory".into()))?;
    Ok(PathBuf::from(appdata).join("chainvault"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_custom_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp_dir.path().to_path_buf());

        assert_eq!(paths.base_dir(), temp_dir.path());
        assert_eq!(paths.data_dir(), temp_dir.path().join("data"));
        assert_eq!(paths.artifact_dir(), temp_dir.path().join("artifacts"));
        assert_eq!(
            paths.backups_file(),
            temp_dir.path().join("data").join("backups.json")
        );
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = VaultPaths::with_base_dir(temp_dir.path().join("vault"));

        paths.ensure_directories().unwrap();

        assert!(paths.data_dir().exists());
        assert!(paths.artifact_dir().exists());
        assert!(!paths.is_initialized());
    }
}
