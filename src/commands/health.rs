use anyhow::Result;

use crate::commands::{CommandReport, open_service};

pub fn run() -> Result<CommandReport> {
    let svc = open_service()?;
    let summary = svc.get_health_summary()?;
    let mut report = CommandReport::new("health");

    report.detail(format!("cache_files={}", summary.cache_files));
    report.detail(format!("array_files={}", summary.array_files));
    report.detail(format!("backups={}", summary.backups));
    report.detail(format!("exclude_entries={}", summary.exclude_entries));
    report.detail(format!("timestamp_entries={}", summary.timestamp_entries));
    report.detail(format!("orphaned_backup={}", summary.orphaned_backup));
    report.detail(format!("duplicate={}", summary.duplicate));
    report.detail(format!("unprotected={}", summary.unprotected));
    report.detail(format!("stale_exclude={}", summary.stale_exclude));
    report.detail(format!("stale_timestamp={}", summary.stale_timestamp));
    report.detail(format!("invalid_timestamp={}", summary.invalid_timestamp));
    if let Some(age) = svc.cache_age_display() {
        report.detail(format!("computed={age}"));
    }
    if !summary.healthy {
        report.issue(format!("unhealthy issues_total={}", summary.issues_total));
    }
    report.attach(&summary)?;
    Ok(report)
}
