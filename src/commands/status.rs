use anyhow::Result;
use plexcache_tier::tier::config::unknown_env_keys;
use plexcache_tier::tier::ondeck::OnDeckTracker;
use serde_json::Value;
use std::fs;

use crate::commands::{CommandReport, open_service};

pub fn run() -> Result<CommandReport> {
    let svc = open_service()?;
    let paths = svc.layout();
    let config = svc.config();
    let mut report = CommandReport::new("status");

    report.detail(format!("plexcache_home={}", paths.home.display()));
    report.detail(format!("data_dir={}", paths.data_dir.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("cache_root={}", paths.cache_root.display()));
    report.detail(format!("array_root={}", paths.array_root.display()));
    report.detail(format!("share_root={}", paths.share_root.display()));
    report.detail(format!(
        "retention.ondeck_retention_days={}",
        config.retention.ondeck_retention_days
    ));
    report.detail(format!(
        "retention.evict_untracked={}",
        config.retention.evict_untracked
    ));
    report.detail(format!("audit.cache_ttl_secs={}", config.audit.cache_ttl_secs));
    report.detail(format!("mover.verify={}", config.mover.verify.as_str()));

    if !paths.cache_root.is_dir() {
        report.issue(format!("missing cache tier root ({})", paths.cache_root.display()));
    }
    if !paths.array_root.is_dir() {
        report.issue(format!("missing array tier root ({})", paths.array_root.display()));
    }

    match OnDeckTracker::open(paths.ledger_file(), config.lock.clone()) {
        Ok(tracker) => report.detail(format!("ledger.entries={}", tracker.len())),
        Err(err) => report.issue(format!("ledger unreadable: {err}")),
    }
    match svc.exclude_store().paths() {
        Ok(entries) => report.detail(format!("exclude.entries={}", entries.len())),
        Err(err) => report.issue(format!("exclude list unreadable: {err}")),
    }
    match svc.timestamp_store().entries() {
        Ok(entries) => report.detail(format!("timestamps.entries={}", entries.len())),
        Err(err) => report.issue(format!("timestamp store unreadable: {err}")),
    }

    let lock_path = paths.run_lock_file();
    match fs::read_to_string(&lock_path) {
        Ok(raw) if raw.trim().is_empty() => report.detail("run_lock=idle"),
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(owner) => {
                let pid = owner.get("pid").and_then(Value::as_u64).unwrap_or(0);
                let started = owner.get("started_at").and_then(Value::as_str).unwrap_or("-");
                report.detail(format!("run_lock.last_owner pid={pid} started_at={started}"));
                if let Some(uuid) = owner.get("build_uuid").and_then(Value::as_str) {
                    let current_uuid = env!("BUILD_UUID");
                    if uuid == current_uuid {
                        report.detail("run_lock.build_match=ok");
                    } else {
                        report.detail(format!(
                            "run_lock.build_match=differs (lock={uuid} current={current_uuid})"
                        ));
                    }
                }
            }
            Err(err) => report.issue(format!("run lock owner unreadable ({err})")),
        },
        Err(_) => report.detail("run_lock=not_found (no run yet)"),
    }

    for key in unknown_env_keys() {
        report.issue(format!("unknown environment variable {key} (typo?)"));
    }

    Ok(report)
}
