//! Schedule display formatting

use crate::models::BackupSchedule;

/// Format a list of schedules as a table
pub fn format_schedule_list(schedules: &[BackupSchedule]) -> String {
    if schedules.is_empty() {
        return "No schedules found.".to_string();
    }

    let label_width = schedules
        .iter()
        .map(|s| s.frequency_label().len())
        .max()
        .unwrap_or(9)
        .max(9);

    let mut output = String::new();
    output.push_str(&format!(
        "{:<13}  {:<13}  {:<8}  {:<label_width$}  {:>9}  {:<6}  {:<8}  {}\n",
        "ID",
        "Project",
        "Kind",
        "Frequency",
        "Retention",
        "Disk",
        "Status",
        "Next Run",
        label_width = label_width,
    ));
    output.push_str(&format!(
        "{:-<13}  {:-<13}  {:-<8}  {:-<label_width$}  {:->9}  {:-<6}  {:-<8}  {:-<16}\n",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        label_width = label_width,
    ));

    for schedule in schedules {
        let next = schedule
            .next_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        output.push_str(&format!(
            "{:<13}  {:<13}  {:<8}  {:<label_width$}  {:>8}d  {:<6}  {:<8}  {}\n",
            schedule.id.short(),
            schedule.project_id.short(),
            schedule.kind.to_string(),
            schedule.frequency_label(),
            schedule.retention_days,
            schedule.storage_disk.to_string(),
            if schedule.is_active { "active" } else { "inactive" },
            next,
            label_width = label_width,
        ));
    }

    output
}
