//! chainvault - backup chains for project files and databases
//!
//! This library provides the core of the chainvault backup engine: full and
//! incremental backups of a project's file tree or database, recurring
//! schedules, retention and point-in-time restore.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Configuration and path management
//! - `error`: Custom error types
//! - `models`: Backup records, schedules and typed ids
//! - `storage`: JSON record store
//! - `artifact`: Storage disks, checksums, archives and database dumps
//! - `backup`: Chain manager, scheduler, retention and restore
//! - `cli`, `display`: Command-line front end
//!
//! # Example
//!
//! ```rust,ignore
//! use chainvault::backup::BackupServices;
//! use chainvault::config::{paths::VaultPaths, settings::Settings};
//!
//! let paths = VaultPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let services = BackupServices::open(paths, &settings)?;
//! ```

pub mod artifact;
pub mod backup;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod models;
pub mod storage;

pub use error::{VaultError, VaultResult};
