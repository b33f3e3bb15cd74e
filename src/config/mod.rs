//! Configuration module for chainvault
//!
//! - Data directory resolution
//! - Settings persistence (disks, limits, project directory)

pub mod paths;
pub mod settings;

pub use paths::VaultPaths;
pub use settings::Settings;
