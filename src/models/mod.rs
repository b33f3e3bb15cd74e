//! Core data models for chainvault
//!
//! Backup records, backup schedules and the typed ids that link them.

pub mod backup;
pub mod ids;
pub mod schedule;

pub use backup::{Backup, BackupKind, BackupStatus, BackupType, ManifestEntry, StorageDisk};
pub use ids::{BackupId, ProjectId, ScheduleId};
pub use schedule::{BackupSchedule, Frequency};
