use anyhow::{Context, Result};
use plexcache_tier::tier::cycle::{read_feed, run_cycle};
use std::path::PathBuf;

use crate::commands::{CommandReport, open_service, report_outcomes, report_summary};

#[derive(Debug, Clone, Default)]
pub struct OnDeckRunOptions {
    pub feed: PathBuf,
    pub dry_run: bool,
}

pub fn run(opts: &OnDeckRunOptions) -> Result<CommandReport> {
    let svc = open_service()?;
    let items = read_feed(&opts.feed)
        .with_context(|| format!("failed to load on-deck feed {}", opts.feed.display()))?;
    let run = run_cycle(&svc, &items, opts.dry_run).context("on-deck run failed")?;

    let mut report = CommandReport::new("ondeck-run");
    report.detail(format!("dry_run={}", run.dry_run));
    report.detail(format!("refreshed={}", run.refreshed));
    report.detail(format!("removed_entries={}", run.removed_entries));
    report.detail(format!("expired={}", run.expired));
    report.detail(format!("already_cached={}", run.already_cached));
    report_outcomes(&mut report, "evict", &run.evictions);
    report_outcomes(&mut report, "cache_in", &run.cache_ins);
    report_summary(&mut report, &run.summary);
    report.attach(&run)?;
    Ok(report)
}
