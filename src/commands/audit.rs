use anyhow::Result;
use plexcache_tier::tier::util::iso_time;

use crate::commands::{CommandReport, open_service};

#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    pub refresh: bool,
}

/// Full findings; anomalies are listed as details, not issues, so the
/// command only fails when the audit itself cannot run.
pub fn run(opts: &AuditOptions) -> Result<CommandReport> {
    let svc = open_service()?;
    let (audit, computed_at) = svc.cached_audit(opts.refresh)?;
    let mut report = CommandReport::new("audit");

    report.detail(format!("computed_at={}", iso_time::format(&computed_at)));
    report.detail(format!(
        "healthy={} issues_total={}",
        audit.summary.healthy, audit.summary.issues_total
    ));
    for path in &audit.orphaned_backup {
        report.detail(format!("orphaned_backup path={path}"));
    }
    for path in &audit.duplicate {
        report.detail(format!("duplicate path={path}"));
    }
    for file in &audit.unprotected {
        report.detail(format!(
            "unprotected path={} has_backup={} has_array_copy={}",
            file.path, file.has_backup, file.has_array_copy
        ));
    }
    for path in &audit.stale_exclude {
        report.detail(format!("stale_exclude path={path}"));
    }
    for path in &audit.stale_timestamp {
        report.detail(format!("stale_timestamp path={path}"));
    }
    for entry in &audit.invalid_timestamp {
        let kind = serde_json::to_value(&entry.problem)
            .ok()
            .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string))
            .unwrap_or_default();
        report.detail(format!("invalid_timestamp path={} kind={kind}", entry.path));
    }

    report.attach(audit.as_ref())?;
    Ok(report)
}
