use anyhow::{Result, bail};
use plexcache_tier::tier::maintenance::{ActionResult, Keep, MaintenanceService, Selection, StalePreview};

use crate::commands::{CommandReport, open_service, report_outcomes, report_summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum RepairKind {
    RestorePlexcached,
    FixWithBackup,
    SyncToArray,
    AddToExclude,
    ProtectWithBackup,
    CleanExclude,
    CleanTimestamps,
    FixFileTimestamps,
    ResolveDuplicate,
}

#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub kind: RepairKind,
    pub paths: Vec<String>,
    pub all: bool,
    pub keep: Option<Keep>,
    pub apply: bool,
}

fn selection(opts: &RepairOptions) -> Result<Selection> {
    match (opts.all, opts.paths.is_empty()) {
        (true, true) => Ok(Selection::All),
        (false, false) => Ok(Selection::Paths(opts.paths.clone())),
        (true, false) => bail!("pass either PATHS or --all, not both"),
        (false, true) => bail!("no paths given; pass PATHS or --all"),
    }
}

fn report_preview(report: &mut CommandReport, label: &str, preview: &StalePreview) {
    report.detail(format!("{label}.total={}", preview.total));
    for entry in &preview.entries {
        report.detail(format!("{label}.entry path={entry}"));
    }
}

fn dispatch(svc: &MaintenanceService, opts: &RepairOptions, report: &mut CommandReport) -> Result<ActionResult> {
    let dry_run = !opts.apply;
    let selection = selection(opts)?;
    let result = match opts.kind {
        RepairKind::RestorePlexcached => match selection {
            Selection::All => svc.restore_all_plexcached(dry_run)?,
            Selection::Paths(paths) => svc.restore_plexcached(paths, dry_run)?,
        },
        RepairKind::FixWithBackup => svc.fix_with_backup(selection, dry_run)?,
        RepairKind::SyncToArray => svc.sync_to_array(selection, dry_run)?,
        RepairKind::AddToExclude => svc.add_to_exclude(selection, dry_run)?,
        RepairKind::ProtectWithBackup => svc.protect_with_backup(selection, dry_run)?,
        RepairKind::CleanExclude => {
            if selection == Selection::All {
                report_preview(report, "stale_exclude", &svc.preview_stale_exclude()?);
            }
            svc.clean_exclude(selection, dry_run)?
        }
        RepairKind::CleanTimestamps => {
            if selection == Selection::All {
                report_preview(report, "stale_timestamp", &svc.preview_stale_timestamps()?);
            }
            svc.clean_timestamps(selection, dry_run)?
        }
        RepairKind::FixFileTimestamps => svc.fix_file_timestamps(selection, dry_run)?,
        RepairKind::ResolveDuplicate => {
            let Some(keep) = opts.keep else {
                bail!("resolve_duplicate needs --keep cache|array");
            };
            svc.resolve_duplicate(selection, keep, dry_run)?
        }
    };
    Ok(result)
}

pub fn run(opts: &RepairOptions) -> Result<CommandReport> {
    let svc = open_service()?;
    let mut report = CommandReport::new("repair");
    let result = dispatch(&svc, opts, &mut report)?;

    report.detail(format!("action={}", result.action.as_str()));
    if result.dry_run {
        report.detail("mode=dry-run (pass --apply to execute)");
    } else {
        report.detail("mode=apply");
    }
    report_outcomes(&mut report, "path", &result.outcomes);
    report_summary(&mut report, &result.summary);
    report.attach(&result)?;
    Ok(report)
}
