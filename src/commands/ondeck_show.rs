use anyhow::{Context, Result};
use plexcache_tier::tier::ondeck::OnDeckTracker;
use plexcache_tier::tier::util::iso_time;

use crate::commands::{CommandReport, open_service};

#[derive(Debug, Clone, Default)]
pub struct OnDeckShowOptions {
    pub path: Option<String>,
}

pub fn run(opts: &OnDeckShowOptions) -> Result<CommandReport> {
    let svc = open_service()?;
    let tracker = OnDeckTracker::open(svc.layout().ledger_file(), svc.config().lock.clone())
        .context("failed to open on-deck ledger")?;
    let retention = svc.config().retention.ondeck_retention_days;
    let mut report = CommandReport::new("ondeck-show");

    if let Some(path) = &opts.path {
        let Some(entry) = tracker.get_entry(path) else {
            report.issue(format!("not tracked: {path}"));
            return Ok(report);
        };
        report.detail(format!("path={path}"));
        report.detail(format!("users={}", entry.users.join(",")));
        report.detail(format!("ondeck_users={}", entry.ondeck_users.join(",")));
        if let Some(info) = &entry.episode_info {
            report.detail(format!(
                "episode show={} season={} episode={}",
                info.show, info.season, info.episode
            ));
        }
        if let Some(first_seen) = &entry.first_seen {
            report.detail(format!("first_seen={}", iso_time::format(first_seen)));
        }
        if let Some(last_seen) = &entry.last_seen {
            report.detail(format!("last_seen={}", iso_time::format(last_seen)));
        }
        report.detail(format!("expired={}", tracker.is_expired(path, retention)));
        report.attach(entry)?;
        return Ok(report);
    }

    report.detail(format!("entries={}", tracker.len()));
    for (path, entry) in tracker.entries() {
        report.detail(format!(
            "entry path={path} users={} expired={}",
            entry.users.join(","),
            tracker.is_expired(path, retention)
        ));
    }
    report.attach(tracker.entries())?;
    Ok(report)
}
