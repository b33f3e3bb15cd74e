//! Backup display formatting
//!
//! Formats backup records for terminal output in table and detail views.

use super::{format_duration, format_size};
use crate::artifact::adapter::ConnectionReport;
use crate::backup::RetentionReport;
use crate::models::Backup;

/// Format a list of backups as a table
pub fn format_backup_list(backups: &[Backup]) -> String {
    if backups.is_empty() {
        return "No backups found.".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "{:<13}  {:<8}  {:<11}  {:<13}  {:<9}  {:>10}  {:<16}\n",
        "ID", "Kind", "Type", "Parent", "Status", "Size", "Started"
    ));
    output.push_str(&format!(
        "{:-<13}  {:-<8}  {:-<11}  {:-<13}  {:-<9}  {:->10}  {:-<16}\n",
        "", "", "", "", "", "", ""
    ));

    for backup in backups {
        let parent = backup
            .parent_backup_id
            .map(|p| p.short())
            .unwrap_or_else(|| "-".to_string());
        let size = backup
            .size_bytes
            .map(format_size)
            .unwrap_or_else(|| "-".to_string());

        output.push_str(&format!(
            "{:<13}  {:<8}  {:<11}  {:<13}  {:<9}  {:>10}  {}\n",
            backup.id.short(),
            backup.kind.to_string(),
            backup.backup_type.to_string(),
            parent,
            backup.status.to_string(),
            size,
            backup.started_at.format("%Y-%m-%d %H:%M"),
        ));
    }

    output.push_str(&format!("\nTotal: {} backup(s)\n", backups.len()));
    output
}

/// Format a single backup's details
pub fn format_backup_details(backup: &Backup, depth: Option<usize>) -> String {
    let mut output = String::new();

    output.push_str(&format!("Backup: {}\n", backup.id));
    output.push_str(&format!("  Project:   {}\n", backup.project_id));
    output.push_str(&format!("  Kind:      {}\n", backup.kind));
    output.push_str(&format!("  Type:      {}\n", backup.backup_type));
    if let Some(parent) = backup.parent_backup_id {
        output.push_str(&format!("  Parent:    {}\n", parent));
    }
    if let Some(depth) = depth {
        output.push_str(&format!("  Depth:     {}\n", depth));
    }
    output.push_str(&format!("  Status:    {}\n", backup.status));
    output.push_str(&format!("  Disk:      {}\n", backup.storage_disk));
    output.push_str(&format!("  Path:      {}\n", backup.storage_path));

    if let Some(database) = &backup.database_name {
        output.push_str(&format!("  Database:  {}\n", database));
    }
    if let Some(size) = backup.size_bytes {
        output.push_str(&format!("  Size:      {}\n", format_size(size)));
    }
    if let Some(files) = backup.files_count {
        output.push_str(&format!("  Files:     {}\n", files));
    }
    if let Some(checksum) = &backup.checksum {
        output.push_str(&format!("  Checksum:  {}\n", checksum));
    }

    output.push('\n');
    output.push_str(&format!(
        "  Started:   {}\n",
        backup.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(done) = backup.completed_at {
        output.push_str(&format!(
            "  Finished:  {}\n",
            done.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    if let Some(duration) = backup.duration() {
        output.push_str(&format!("  Duration:  {}\n", format_duration(duration)));
    }

    if let Some(error) = &backup.error_message {
        output.push('\n');
        output.push_str(&format!("  Error: {}\n", error));
    }

    output
}

pub fn format_retention_report(report: &RetentionReport) -> String {
    let mut output = format!(
        "Deleted {}, retained {}, skipped {} (depended upon)\n",
        report.deleted.len(),
        report.retained.len(),
        report.skipped.len()
    );
    for id in &report.deleted {
        output.push_str(&format!("  deleted {}\n", id.short()));
    }
    for (id, error) in &report.errors {
        output.push_str(&format!("  error   {}: {}\n", id.short(), error));
    }
    output
}

pub fn format_connection_report(report: &ConnectionReport) -> String {
    let mut output = format!("Disk {}:\n", report.disk);
    for (check, took) in &report.passed {
        output.push_str(&format!("  {:<7} ok     {}ms\n", check.to_string(), took.as_millis()));
    }
    if let Some((check, error)) = &report.failure {
        output.push_str(&format!("  {:<7} FAILED {}\n", check.to_string(), error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::adapter::ConnectionCheck;
    use crate::models::{BackupKind, BackupStatus, BackupType, ProjectId, StorageDisk};

    fn completed() -> Backup {
        let mut backup = Backup::pending(
            ProjectId::new(),
            BackupKind::File,
            BackupType::Full,
            None,
            StorageDisk::Local,
        );
        backup.status = BackupStatus::Running;
        let at = backup.started_at + chrono::Duration::seconds(90);
        backup.mark_completed("ab12".into(), 2048, Some(vec![]), at);
        backup
    }

    #[test]
    fn test_format_backup_list() {
        let backup = completed();
        let output = format_backup_list(&[backup.clone()]);
        assert!(output.contains(&backup.id.short()));
        assert!(output.contains("completed"));
        assert!(output.contains("2.0 KB"));
        assert!(output.contains("Total: 1 backup(s)"));
        assert_eq!(format_backup_list(&[]), "No backups found.");
    }

    #[test]
    fn test_format_connection_report() {
        let report = ConnectionReport {
            disk: StorageDisk::S3,
            passed: vec![
                (ConnectionCheck::List, std::time::Duration::from_millis(12)),
                (ConnectionCheck::Write, std::time::Duration::from_millis(30)),
            ],
            failure: Some((ConnectionCheck::Read, "access denied".into())),
        };
        let output = format_connection_report(&report);
        assert!(output.starts_with("Disk s3:"));
        assert!(output.contains("list    ok     12ms"));
        assert!(output.contains("read    FAILED access denied"));
    }

    #[test]
    fn test_format_backup_details() {
        let output = format_backup_details(&completed(), Some(0));
        assert!(output.contains("Checksum:  ab12"));
        assert!(output.contains("Depth:     0"));
        assert!(output.contains("Duration:  1m 30s"));
        assert!(!output.contains("Error"));
    }

    #[test]
    fn test_format_retention_report() {
        let backup = completed();
        let report = RetentionReport {
            deleted: vec![backup.id],
            errors: vec![(backup.id, "bucket unreachable".into())],
            ..Default::default()
        };
        let output = format_retention_report(&report);
        assert!(output.starts_with("Deleted 1, retained 0, skipped 0"));
        assert!(output.contains("bucket unreachable"));
    }
}
