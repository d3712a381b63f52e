//! One scheduled run: refresh the on-deck ledger from a feed, then bring the
//! cache tier in line with it.
//!
//! Eviction only ever considers paths listed in the exclude store, so files
//! the run did not place on the cache tier are never moved.

use crate::error::{TierError, TierResult};
use crate::tier::journal;
use crate::tier::layout::TierPaths;
use crate::tier::maintenance::{ActionSummary, MaintenanceService};
use crate::tier::mover::{Action, Executor, MoveEngine, PathOutcome, Step, StepError, executor};
use crate::tier::ondeck::{EpisodeInfo, OnDeckTracker};
use crate::tier::scan::cache_rel;
use crate::tier::store::FileLock;
use crate::tier::util::{iso_time, modified_at};
use crate::tier::warn::{self, WarnEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// One on-deck report from the metadata source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDeckItem {
    pub path: String,
    pub user: String,
    #[serde(default = "default_on_deck")]
    pub is_on_deck: bool,
    #[serde(default)]
    pub episode_info: Option<EpisodeInfo>,
}

fn default_on_deck() -> bool {
    true
}

/// Read a feed file: a JSON array of [`OnDeckItem`].
pub fn read_feed(path: &Path) -> TierResult<Vec<OnDeckItem>> {
    let raw = fs::read_to_string(path).map_err(|err| TierError::fs("read feed", path, err))?;
    serde_json::from_str(&raw)
        .map_err(|err| TierError::validation(path.display().to_string(), format!("invalid feed: {err}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub refreshed: usize,
    pub removed_entries: usize,
    pub expired: usize,
    pub already_cached: usize,
    pub evictions: Vec<PathOutcome>,
    pub cache_ins: Vec<PathOutcome>,
    pub summary: ActionSummary,
}

pub fn run_cycle(svc: &MaintenanceService, items: &[OnDeckItem], dry_run: bool) -> TierResult<RunReport> {
    run_cycle_at(svc, items, dry_run, Utc::now())
}

pub fn run_cycle_at(
    svc: &MaintenanceService,
    items: &[OnDeckItem],
    dry_run: bool,
    now: DateTime<Utc>,
) -> TierResult<RunReport> {
    let layout = svc.layout();
    let config = svc.config();
    let mut lock = FileLock::acquire(
        &layout.run_lock_file(),
        config.lock.timeout(),
        config.lock.poll_interval(),
    )?;
    lock.write_owner(&json!({
        "pid": std::process::id(),
        "build_uuid": env!("BUILD_UUID"),
        "started_at": iso_time::format(&now),
        "dry_run": dry_run,
    }));

    let mut tracker = OnDeckTracker::open(layout.ledger_file(), config.lock.clone())?;
    tracker.prepare_for_run()?;
    let mut refreshed = BTreeSet::new();
    for item in items {
        tracker.update_entry_at(
            &item.path,
            &item.user,
            item.episode_info.clone(),
            item.is_on_deck,
            now,
        )?;
        refreshed.insert(item.path.as_str());
    }
    let removed_entries = tracker.cleanup_unseen()?;

    let retention = config.retention.ondeck_retention_days;
    let expired_entries = tracker.expired_paths(retention, now);
    let mut wanted = BTreeMap::<String, PathBuf>::new();
    let mut expired = BTreeSet::<String>::new();
    for path in tracker.entries().keys() {
        let Some(rel) = layout.relative_str(path) else {
            tracing::warn!(path = %path, "tracked path is outside the managed tiers");
            continue;
        };
        let key = layout.cache_key(&rel);
        if expired_entries.contains(path) {
            expired.insert(key);
        } else {
            wanted.insert(key, rel);
        }
    }

    let evict_untracked = config.retention.evict_untracked;
    let to_evict = svc
        .exclude_store()
        .paths()?
        .into_iter()
        .filter(|key| !wanted.contains_key(key))
        .filter(|key| evict_untracked || expired.contains(key))
        .filter_map(|key| cache_rel(layout, &key).map(|rel| (key, rel)))
        .filter(|(_, rel)| layout.cache_path(rel).is_file())
        .collect::<Vec<_>>();

    let engine = MoveEngine::new(layout, config.mover.verify);
    let mut exec = executor(dry_run);

    let mut evictions = Vec::with_capacity(to_evict.len());
    for (key, rel) in to_evict {
        let step = evict_one(svc, &engine, exec.as_mut(), &key, &rel);
        evictions.push(PathOutcome::from_step(key, Action::RestoreBackup, step, exec.take_effects()));
    }

    let mut cache_ins = Vec::new();
    let mut already_cached = 0usize;
    for (key, rel) in &wanted {
        if layout.cache_path(rel).exists() {
            already_cached += 1;
            continue;
        }
        let step = cache_in_one(svc, &engine, exec.as_mut(), key, rel);
        cache_ins.push(PathOutcome::from_step(key.clone(), Action::CacheIn, step, exec.take_effects()));
    }

    let summary = ActionSummary::tally(evictions.iter().chain(cache_ins.iter()));
    let report = RunReport {
        dry_run,
        refreshed: refreshed.len(),
        removed_entries,
        expired: expired.len(),
        already_cached,
        evictions,
        cache_ins,
        summary,
    };

    tracing::info!(
        dry_run,
        refreshed = report.refreshed,
        removed = report.removed_entries,
        moved = report.summary.fixed,
        skipped = report.summary.skipped,
        failed = report.summary.failed,
        "on-deck run finished"
    );
    if !dry_run {
        svc.invalidate_caches();
        record_run(layout, &report);
    }
    Ok(report)
}

fn record_run(layout: &TierPaths, report: &RunReport) {
    let status = if report.summary.failed == 0 { "ok" } else { "partial" };
    journal::record(
        layout,
        "ondeck-run",
        status,
        &format!(
            "refreshed={} removed={} moved={} skipped={} failed={}",
            report.refreshed,
            report.removed_entries,
            report.summary.fixed,
            report.summary.skipped,
            report.summary.failed
        ),
    );
}

fn evict_one(
    svc: &MaintenanceService,
    engine: &MoveEngine<'_>,
    exec: &mut dyn Executor,
    key: &str,
    rel: &Path,
) -> Step {
    let action = engine.evict(exec, rel)?;
    let exclude = svc.exclude_store();
    let timestamps = svc.timestamp_store();
    exec.store_edit("exclude", format!("remove {key}"), &mut || {
        exclude.remove([key]).map(|_| ())
    })
    .and_then(|()| {
        exec.store_edit("timestamps", format!("remove {key}"), &mut || {
            timestamps.remove([key]).map(|_| ())
        })
    })
    .map_err(|err| {
        StepError::Fail(format!(
            "evicted, but tracking entries were left behind: {err}"
        ))
    })?;
    Ok(action)
}

fn cache_in_one(
    svc: &MaintenanceService,
    engine: &MoveEngine<'_>,
    exec: &mut dyn Executor,
    key: &str,
    rel: &Path,
) -> Step {
    let source_mtime = modified_at(&svc.layout().array_path(rel)).ok();
    let action = engine.cache_in(exec, rel)?;

    let exclude = svc.exclude_store();
    let timestamps = svc.timestamp_store();
    let recorded = exec
        .store_edit("exclude", format!("add {key}"), &mut || {
            exclude.add([key]).map(|_| ())
        })
        .and_then(|()| match source_mtime {
            Some(mtime) => exec.store_edit(
                "timestamps",
                format!("set {key} {}", iso_time::format(&mtime)),
                &mut || timestamps.set(key, mtime),
            ),
            None => Ok(()),
        });

    if let Err(err) = recorded {
        let mut reason = format!("could not record cached file: {err}");
        if let Err(undo_err) = exec.store_edit("exclude", format!("remove {key}"), &mut || {
            exclude.remove([key]).map(|_| ())
        }) {
            rollback_failed(key, "remove-exclude-entry", &reason, &undo_err.to_string());
            reason = format!("{reason}; exclude entry left behind ({undo_err})");
        }
        return match engine.evict(exec, rel) {
            Ok(_) => Err(StepError::Fail(format!("{reason}; cache copy rolled back"))),
            Err(StepError::Skip(why) | StepError::Fail(why)) => {
                rollback_failed(key, "evict-cache-copy", &reason, &why);
                Err(StepError::Fail(format!("{reason}; rollback failed ({why})")))
            }
        };
    }
    Ok(action)
}

fn rollback_failed(key: &str, action: &str, reason: &str, err: &str) {
    warn::emit(WarnEvent {
        code: "ROLLBACK_FAILED",
        stage: "ondeck-run",
        action,
        path: key,
        retry: "next-audit",
        reason,
        err,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::config::{TierConfig, VerifyMode};
    use crate::tier::mover::{Effect, FsExecutor, OutcomeStatus};
    use crate::tier::store::lock_path_for;
    use chrono::Duration;
    use tempfile::{TempDir, tempdir};

    fn setup(retention_days: u64) -> (TempDir, MaintenanceService) {
        let tmp = tempdir().expect("tempdir");
        let layout = TierPaths::under(tmp.path());
        fs::create_dir_all(&layout.cache_root).expect("mkdir cache");
        fs::create_dir_all(&layout.array_root).expect("mkdir array");
        let mut config = TierConfig::default();
        config.retention.ondeck_retention_days = retention_days;
        (tmp, MaintenanceService::new(layout, config))
    }

    fn put(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn item(svc: &MaintenanceService, rel: &str, user: &str) -> OnDeckItem {
        OnDeckItem {
            path: svc.layout().share_root.join(rel).display().to_string(),
            user: user.to_string(),
            is_on_deck: true,
            episode_info: None,
        }
    }

    #[test]
    fn run_caches_on_deck_files_and_protects_them() {
        let (_tmp, svc) = setup(0);
        let rel = Path::new("tv/Show/S01E02.mkv");
        put(&svc.layout().array_path(rel), "ep2");

        let report = run_cycle(&svc, &[item(&svc, "tv/Show/S01E02.mkv", "alice")], false)
            .expect("run");
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.summary.fixed, 1);
        assert_eq!(report.cache_ins[0].action_taken, Action::CacheIn);
        assert!(svc.layout().cache_path(rel).exists());
        assert!(svc.layout().backup_path(rel).exists());

        let key = svc.layout().cache_key(rel);
        assert!(svc.exclude_store().contains(&key).expect("contains"));
        assert!(svc.timestamp_store().get(&key).expect("get").is_some());
        assert!(svc.run_full_audit().expect("audit").summary.healthy);

        let again = run_cycle(&svc, &[item(&svc, "tv/Show/S01E02.mkv", "alice")], false)
            .expect("second run");
        assert_eq!(again.already_cached, 1);
        assert!(again.cache_ins.is_empty());
    }

    #[test]
    fn dropped_entries_are_evicted_back_to_the_array() {
        let (_tmp, svc) = setup(0);
        let rel = Path::new("movies/Heat.mkv");
        put(&svc.layout().array_path(rel), "heat");
        run_cycle(&svc, &[item(&svc, "movies/Heat.mkv", "alice")], false).expect("first run");

        let report = run_cycle(&svc, &[], false).expect("second run");
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.evictions.len(), 1);
        assert_eq!(report.evictions[0].action_taken, Action::RestoreBackup);
        assert!(!svc.layout().cache_path(rel).exists());
        assert!(!svc.layout().backup_path(rel).exists());
        assert_eq!(
            fs::read_to_string(svc.layout().array_path(rel)).expect("array"),
            "heat"
        );
        assert!(svc.exclude_store().paths().expect("paths").is_empty());
        assert!(svc.timestamp_store().entries().expect("entries").is_empty());
    }

    #[test]
    fn expired_entries_are_evicted_but_stay_tracked() {
        let (_tmp, svc) = setup(7);
        let rel = Path::new("movies/Alien.mkv");
        put(&svc.layout().array_path(rel), "alien");
        let feed = [item(&svc, "movies/Alien.mkv", "bob")];
        let start = Utc::now() - Duration::days(10);
        run_cycle_at(&svc, &feed, false, start).expect("first run");
        assert!(svc.layout().cache_path(rel).exists());

        let report = run_cycle(&svc, &feed, false).expect("later run");
        assert_eq!(report.expired, 1);
        assert_eq!(report.summary.fixed, 1);
        assert!(!svc.layout().cache_path(rel).exists());

        let tracker =
            OnDeckTracker::open(svc.layout().ledger_file(), svc.config().lock.clone()).expect("open");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn untouched_cache_files_are_never_evicted() {
        let (_tmp, svc) = setup(0);
        let rel = Path::new("manual.mkv");
        put(&svc.layout().cache_path(rel), "mine");

        let report = run_cycle(&svc, &[], false).expect("run");
        assert!(report.evictions.is_empty());
        assert!(svc.layout().cache_path(rel).exists());
    }

    #[test]
    fn dry_run_moves_nothing_but_updates_the_ledger() {
        let (_tmp, svc) = setup(0);
        let rel = Path::new("a.mkv");
        put(&svc.layout().array_path(rel), "a");

        let report = run_cycle(&svc, &[item(&svc, "a.mkv", "alice")], true).expect("run");
        assert!(report.dry_run);
        assert_eq!(report.cache_ins[0].status, OutcomeStatus::Done);
        assert!(!report.cache_ins[0].effects.is_empty());
        assert!(svc.layout().array_path(rel).exists());
        assert!(!svc.layout().cache_path(rel).exists());
        assert!(svc.exclude_store().paths().expect("paths").is_empty());

        let tracker =
            OnDeckTracker::open(svc.layout().ledger_file(), svc.config().lock.clone()).expect("open");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn missing_array_original_is_reported_as_skipped() {
        let (_tmp, svc) = setup(0);
        let report = run_cycle(&svc, &[item(&svc, "ghost.mkv", "alice")], false).expect("run");
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.cache_ins[0].status, OutcomeStatus::Skipped);
    }

    fn fast_lock_service() -> (TempDir, MaintenanceService) {
        let tmp = tempdir().expect("tempdir");
        let layout = TierPaths::under(tmp.path());
        let mut config = TierConfig::default();
        config.lock.timeout_secs = 0;
        config.lock.poll_interval_ms = 5;
        (tmp, MaintenanceService::new(layout, config))
    }

    fn hold(path: &Path) -> FileLock {
        FileLock::acquire(
            path,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_millis(5),
        )
        .expect("hold lock")
    }

    #[test]
    fn held_run_lock_aborts_before_touching_the_ledger() {
        let (_tmp, svc) = fast_lock_service();
        let _held = hold(&svc.layout().run_lock_file());

        let err = run_cycle(&svc, &[item(&svc, "a.mkv", "alice")], false).expect_err("timeout");
        assert!(matches!(err, TierError::LockTimeout { .. }));
        assert!(!svc.layout().ledger_file().exists());
    }

    #[test]
    fn held_ledger_lock_aborts_the_run() {
        let (_tmp, svc) = fast_lock_service();
        let _held = hold(&lock_path_for(&svc.layout().ledger_file()));

        let err = run_cycle(&svc, &[item(&svc, "a.mkv", "alice")], false).expect_err("timeout");
        assert_eq!(err.code().as_str(), "E001_LOCK_TIMEOUT");
        assert!(!svc.layout().ledger_file().exists());
    }

    /// Real executor whose store edits fail unless they add an entry.
    struct OnlyAddsSucceed(FsExecutor);

    impl Executor for OnlyAddsSucceed {
        fn dry_run(&self) -> bool {
            false
        }

        fn rename(&mut self, from: &Path, to: &Path) -> TierResult<()> {
            self.0.rename(from, to)
        }

        fn copy_verified(&mut self, from: &Path, to: &Path, verify: VerifyMode) -> TierResult<u64> {
            self.0.copy_verified(from, to, verify)
        }

        fn remove_file(&mut self, path: &Path) -> TierResult<()> {
            self.0.remove_file(path)
        }

        fn set_mtime(&mut self, path: &Path, mtime: DateTime<Utc>) -> TierResult<()> {
            self.0.set_mtime(path, mtime)
        }

        fn store_edit(
            &mut self,
            store: &str,
            change: String,
            apply: &mut dyn FnMut() -> TierResult<()>,
        ) -> TierResult<()> {
            if !change.starts_with("add ") {
                return Err(TierError::validation(store, "store is read-only"));
            }
            self.0.store_edit(store, change, apply)
        }

        fn take_effects(&mut self) -> Vec<Effect> {
            self.0.take_effects()
        }
    }

    #[test]
    fn failed_cache_in_bookkeeping_reports_leftover_exclude_entry() {
        let (_tmp, svc) = setup(0);
        let rel = Path::new("a.mkv");
        put(&svc.layout().array_path(rel), "orig");
        let key = svc.layout().cache_key(rel);
        let engine = MoveEngine::new(svc.layout(), VerifyMode::Size);
        let mut exec = OnlyAddsSucceed(FsExecutor::default());

        let reason = match cache_in_one(&svc, &engine, &mut exec, &key, rel) {
            Err(StepError::Fail(reason)) => reason,
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(reason.contains("could not record cached file"));
        assert!(reason.contains("exclude entry left behind"));
        assert!(reason.contains("cache copy rolled back"));
        assert!(!svc.layout().cache_path(rel).exists());
        assert_eq!(fs::read_to_string(svc.layout().array_path(rel)).expect("array"), "orig");
        assert!(svc.exclude_store().contains(&key).expect("contains"));
    }

    #[test]
    fn feed_defaults_on_deck_flag() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("feed.json");
        fs::write(
            &path,
            r#"[{"path": "/mnt/user/a.mkv", "user": "alice"},
                {"path": "/mnt/user/b.mkv", "user": "bob", "is_on_deck": false,
                 "episode_info": {"show": "Show", "season": 1, "episode": 2}}]"#,
        )
        .expect("write");
        let items = read_feed(&path).expect("feed");
        assert_eq!(items.len(), 2);
        assert!(items[0].is_on_deck);
        assert!(!items[1].is_on_deck);
        assert_eq!(items[1].episode_info.as_ref().map(|e| e.episode), Some(2));

        fs::write(&path, "{not json").expect("write");
        assert!(matches!(read_feed(&path), Err(TierError::Validation { .. })));
    }
}
