//! Health audit and repair actions over both tiers and the tracking stores.
//!
//! The audit is read-only. Every repair re-checks each path against the live
//! filesystem before touching it, applies its changes all-or-nothing per
//! path, and routes every mutation (file or store) through an [`Executor`],
//! so a dry run reports exactly the effects a real run would perform.

use crate::error::TierResult;
use crate::tier::audit_cache::AuditCache;
use crate::tier::config::TierConfig;
use crate::tier::exclude::ExcludeStore;
use crate::tier::journal;
use crate::tier::layout::TierPaths;
use crate::tier::mover::{
    Action, Executor, MoveEngine, OutcomeStatus, PathOutcome, Step, StepError, executor,
};
use crate::tier::scan::{AuditInputs, HealthReport, HealthSummary, cache_rel, classify_inputs, scan_tiers};
use crate::tier::timestamps::{TimestampProblem, TimestampStore, classify, parse_expected};
use crate::tier::util::{iso_time, modified_at};
use crate::tier::warn::{self, WarnEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Preview lists shown before a bulk clean are capped at this many entries.
pub const PREVIEW_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    RestorePlexcached,
    RestoreAllPlexcached,
    FixWithBackup,
    SyncToArray,
    AddToExclude,
    ProtectWithBackup,
    CleanExclude,
    CleanTimestamps,
    FixFileTimestamps,
    ResolveDuplicate,
}

impl RepairAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestorePlexcached => "restore_plexcached",
            Self::RestoreAllPlexcached => "restore_all_plexcached",
            Self::FixWithBackup => "fix_with_backup",
            Self::SyncToArray => "sync_to_array",
            Self::AddToExclude => "add_to_exclude",
            Self::ProtectWithBackup => "protect_with_backup",
            Self::CleanExclude => "clean_exclude",
            Self::CleanTimestamps => "clean_timestamps",
            Self::FixFileTimestamps => "fix_file_timestamps",
            Self::ResolveDuplicate => "resolve_duplicate",
        }
    }
}

/// Which paths an action targets: an explicit list, or everything the audit
/// currently reports for that action's anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Paths(Vec<String>),
}

/// Which copy of a duplicate survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keep {
    Cache,
    Array,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionSummary {
    pub fixed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub action: RepairAction,
    pub dry_run: bool,
    pub outcomes: Vec<PathOutcome>,
    pub summary: ActionSummary,
}

impl ActionSummary {
    pub fn tally<'a>(outcomes: impl IntoIterator<Item = &'a PathOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Done => summary.fixed += 1,
                OutcomeStatus::Skipped => summary.skipped += 1,
                OutcomeStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

impl ActionResult {
    fn new(action: RepairAction, dry_run: bool, outcomes: Vec<PathOutcome>) -> Self {
        Self {
            action,
            dry_run,
            summary: ActionSummary::tally(&outcomes),
            outcomes,
        }
    }

    pub fn ok(&self) -> bool {
        self.summary.failed == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StalePreview {
    pub total: usize,
    pub entries: Vec<String>,
}

fn preview(entries: Vec<String>) -> StalePreview {
    StalePreview {
        total: entries.len(),
        entries: entries.into_iter().take(PREVIEW_LIMIT).collect(),
    }
}

fn dedup(paths: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    paths
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect()
}

pub struct MaintenanceService {
    layout: TierPaths,
    config: TierConfig,
    exclude: ExcludeStore,
    timestamps: TimestampStore,
    cache: AuditCache,
}

impl MaintenanceService {
    pub fn new(layout: TierPaths, config: TierConfig) -> Self {
        let exclude = ExcludeStore::new(layout.exclude_file(), config.lock.clone());
        let timestamps = TimestampStore::new(layout.timestamps_file(), config.lock.clone());
        let cache = AuditCache::new(Duration::from_secs(config.audit.cache_ttl_secs));
        Self {
            layout,
            config,
            exclude,
            timestamps,
            cache,
        }
    }

    pub fn layout(&self) -> &TierPaths {
        &self.layout
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn exclude_store(&self) -> &ExcludeStore {
        &self.exclude
    }

    pub fn timestamp_store(&self) -> &TimestampStore {
        &self.timestamps
    }

    fn engine(&self) -> MoveEngine<'_> {
        MoveEngine::new(&self.layout, self.config.mover.verify)
    }

    /// One walk of both tiers plus one read of each store. Never mutates.
    pub fn run_full_audit(&self) -> TierResult<HealthReport> {
        let sets = scan_tiers(&self.layout)?;
        let exclude = self.exclude.paths()?;
        let timestamps = self.timestamps.entries()?;
        let report = classify_inputs(&AuditInputs {
            layout: &self.layout,
            sets: &sets,
            exclude: &exclude,
            timestamps: &timestamps,
            tolerance_secs: self.config.timestamps.tolerance_secs,
            now: Utc::now(),
        });
        tracing::debug!(
            issues = report.summary.issues_total,
            cache_files = report.summary.cache_files,
            "audit complete"
        );
        Ok(report)
    }

    pub fn cached_audit(&self, force_refresh: bool) -> TierResult<(Arc<HealthReport>, DateTime<Utc>)> {
        self.cache
            .get_or_compute(force_refresh, || self.run_full_audit())
    }

    /// Counts only. Served from the cache while it is fresh.
    pub fn get_health_summary(&self) -> TierResult<HealthSummary> {
        if let Some(summary) = self.cache.cached_summary() {
            return Ok(summary);
        }
        Ok(self.cached_audit(false)?.0.health_summary())
    }

    pub fn invalidate_caches(&self) {
        self.cache.invalidate();
    }

    pub fn cache_age_display(&self) -> Option<String> {
        self.cache.age_display()
    }

    pub fn preview_stale_exclude(&self) -> TierResult<StalePreview> {
        Ok(preview(self.run_full_audit()?.stale_exclude))
    }

    pub fn preview_stale_timestamps(&self) -> TierResult<StalePreview> {
        Ok(preview(self.run_full_audit()?.stale_timestamp))
    }

    fn targets(
        &self,
        selection: Selection,
        from_report: impl FnOnce(HealthReport) -> Vec<String>,
    ) -> TierResult<Vec<String>> {
        match selection {
            Selection::All => Ok(from_report(self.run_full_audit()?)),
            Selection::Paths(paths) => Ok(dedup(paths)),
        }
    }

    /// Run `step` for each path against one executor and collect outcomes.
    fn run_batch(
        &self,
        action: RepairAction,
        dry_run: bool,
        paths: Vec<String>,
        attempted: Action,
        mut step: impl FnMut(&mut dyn Executor, &str) -> (String, Step),
    ) -> ActionResult {
        let mut exec = executor(dry_run);
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let (key, result) = step(exec.as_mut(), &path);
            let effects = exec.take_effects();
            if let Err(StepError::Fail(reason)) = &result {
                tracing::warn!(action = action.as_str(), path = %key, %reason, "repair step failed");
            }
            outcomes.push(PathOutcome::from_step(key, attempted, result, effects));
        }
        let result = ActionResult::new(action, dry_run, outcomes);

        tracing::info!(
            action = action.as_str(),
            dry_run,
            fixed = result.summary.fixed,
            skipped = result.summary.skipped,
            failed = result.summary.failed,
            "repair finished"
        );
        if !dry_run {
            self.invalidate_caches();
            let status = if result.ok() { "ok" } else { "partial" };
            journal::record(
                &self.layout,
                &format!("repair:{}", action.as_str()),
                status,
                &format!(
                    "fixed={} skipped={} failed={}",
                    result.summary.fixed, result.summary.skipped, result.summary.failed
                ),
            );
        }
        result
    }

    /// Relative path and cache key for a caller-supplied path on any tier.
    fn resolve(&self, path: &str) -> Result<(PathBuf, String), (String, StepError)> {
        match self.layout.relative_str(path) {
            Some(rel) => {
                let key = self.layout.cache_key(&rel);
                Ok((rel, key))
            }
            None => Err((
                path.to_string(),
                StepError::Skip("path is outside the managed tiers".to_string()),
            )),
        }
    }

    fn excluded(&self, key: &str) -> Result<bool, StepError> {
        self.exclude.contains(key).map_err(StepError::from)
    }

    fn add_exclude(&self, exec: &mut dyn Executor, key: &str) -> TierResult<()> {
        exec.store_edit("exclude", format!("add {key}"), &mut || {
            self.exclude.add([key]).map(|_| ())
        })
    }

    fn remove_exclude(&self, exec: &mut dyn Executor, key: &str) -> TierResult<()> {
        exec.store_edit("exclude", format!("remove {key}"), &mut || {
            self.exclude.remove([key]).map(|_| ())
        })
    }

    fn set_timestamp(&self, exec: &mut dyn Executor, key: &str, at: DateTime<Utc>) -> TierResult<()> {
        exec.store_edit(
            "timestamps",
            format!("set {key} {}", iso_time::format(&at)),
            &mut || self.timestamps.set(key, at),
        )
    }

    fn remove_timestamp(&self, exec: &mut dyn Executor, key: &str) -> TierResult<()> {
        exec.store_edit("timestamps", format!("remove {key}"), &mut || {
            self.timestamps.remove([key]).map(|_| ())
        })
    }

    fn undo(&self, stage: &str, key: &str, reason: &str, result: TierResult<()>) -> String {
        match result {
            Ok(()) => format!("{reason}; rolled back"),
            Err(err) => {
                warn::emit(WarnEvent {
                    code: "ROLLBACK_FAILED",
                    stage,
                    action: "undo-store-edit",
                    path: key,
                    retry: "next-audit",
                    reason,
                    err: &err.to_string(),
                });
                format!("{reason}; rollback failed ({err})")
            }
        }
    }

    /// Restore the given orphaned backups to their original array paths.
    pub fn restore_plexcached(&self, paths: Vec<String>, dry_run: bool) -> TierResult<ActionResult> {
        Ok(self.restore_orphans(RepairAction::RestorePlexcached, dedup(paths), dry_run))
    }

    pub fn restore_all_plexcached(&self, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.run_full_audit()?.orphaned_backup;
        Ok(self.restore_orphans(RepairAction::RestoreAllPlexcached, paths, dry_run))
    }

    fn restore_orphans(&self, action: RepairAction, paths: Vec<String>, dry_run: bool) -> ActionResult {
        let engine = self.engine();
        self.run_batch(action, dry_run, paths, Action::RestoreOrphan, |exec, path| {
            match self.resolve(path) {
                Ok((rel, key)) => (key, engine.restore_orphan(exec, &rel)),
                Err((key, err)) => (key, Err(err)),
            }
        })
    }

    /// Cache file with a backup but no exclude entry: record it as managed.
    pub fn fix_with_backup(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| {
            r.unprotected
                .into_iter()
                .filter(|u| u.has_backup)
                .map(|u| u.path)
                .collect()
        })?;
        Ok(self.run_batch(RepairAction::FixWithBackup, dry_run, paths, Action::AddToExclude, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                let cache = self.layout.cache_path(&rel);
                if !cache.is_file() {
                    return Err(StepError::Skip("no cache-tier file".to_string()));
                }
                if !self.layout.backup_path(&rel).is_file() {
                    return Err(StepError::Skip("no backup marker; use protect_with_backup".to_string()));
                }
                if self.excluded(&key)? {
                    return Err(StepError::Skip("already in the exclude list".to_string()));
                }
                let mtime = modified_at(&cache)?;
                self.add_exclude(exec, &key)
                    .map_err(|err| StepError::Fail(err.to_string()))?;
                if let Err(err) = self.set_timestamp(exec, &key, mtime) {
                    let reason = format!("timestamp record failed: {err}");
                    let undo = self.remove_exclude(exec, &key);
                    return Err(StepError::Fail(self.undo("fix_with_backup", &key, &reason, undo)));
                }
                Ok(Action::AddToExclude)
            })();
            (key, step)
        }))
    }

    /// Move an unprotected cache file back to the array and drop whatever
    /// tracking state it has.
    pub fn sync_to_array(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| r.unprotected.into_iter().map(|u| u.path).collect())?;
        let engine = self.engine();
        Ok(self.run_batch(RepairAction::SyncToArray, dry_run, paths, Action::CopyToArray, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                if !self.layout.cache_path(&rel).is_file() {
                    return Err(StepError::Skip("no cache-tier file".to_string()));
                }
                if self.excluded(&key)? {
                    return Err(StepError::Skip(
                        "file is in the exclude list; it is not unprotected".to_string(),
                    ));
                }
                let previous = self.timestamps.get(&key)?;
                if previous.is_some() {
                    self.remove_timestamp(exec, &key)
                        .map_err(|err| StepError::Fail(err.to_string()))?;
                }
                match engine.evict(exec, &rel) {
                    Ok(action) => Ok(action),
                    Err(err) => {
                        if let Some(value) = previous {
                            let undo = exec.store_edit("timestamps", format!("restore {key}"), &mut || {
                                self.timestamps.insert_raw(&key, value.clone())
                            });
                            if let Err(undo_err) = undo {
                                let _ = self.undo("sync_to_array", &key, "evict failed", Err(undo_err));
                            }
                        }
                        Err(err)
                    }
                }
            })();
            (key, step)
        }))
    }

    /// Mark cache files as managed without creating a backup.
    pub fn add_to_exclude(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| r.unprotected.into_iter().map(|u| u.path).collect())?;
        Ok(self.run_batch(RepairAction::AddToExclude, dry_run, paths, Action::AddToExclude, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                if !self.layout.cache_path(&rel).is_file() {
                    return Err(StepError::Skip("no cache-tier file".to_string()));
                }
                if self.excluded(&key)? {
                    return Err(StepError::Skip("already in the exclude list".to_string()));
                }
                self.add_exclude(exec, &key)
                    .map_err(|err| StepError::Fail(err.to_string()))?;
                Ok(Action::AddToExclude)
            })();
            (key, step)
        }))
    }

    /// Copy a cache-only file to the array as a backup marker, then mark it
    /// managed. The new backup is removed if the exclude edit fails.
    pub fn protect_with_backup(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| {
            r.unprotected
                .into_iter()
                .filter(|u| !u.has_backup && !u.has_array_copy)
                .map(|u| u.path)
                .collect()
        })?;
        let engine = self.engine();
        Ok(self.run_batch(RepairAction::ProtectWithBackup, dry_run, paths, Action::CreateBackup, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                if self.excluded(&key)? {
                    return Err(StepError::Skip("already in the exclude list".to_string()));
                }
                let action = engine.create_backup(exec, &rel)?;
                if let Err(err) = self.add_exclude(exec, &key) {
                    let reason = format!("exclude edit failed: {err}");
                    return match engine.drop_created_backup(exec, &rel) {
                        Ok(()) => Err(StepError::Fail(format!("{reason}; new backup removed"))),
                        Err(rb) => Err(StepError::Fail(self.undo(
                            "protect_with_backup",
                            &key,
                            &reason,
                            Err(rb),
                        ))),
                    };
                }
                Ok(action)
            })();
            (key, step)
        }))
    }

    /// Drop exclude entries whose cache file no longer exists.
    pub fn clean_exclude(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| r.stale_exclude)?;
        Ok(self.run_batch(RepairAction::CleanExclude, dry_run, paths, Action::RemoveExclude, |exec, key| {
            let step = (|| -> Step {
                if !self.excluded(key)? {
                    return Err(StepError::Skip("not in the exclude list".to_string()));
                }
                if self.live_cache_file(key) {
                    return Err(StepError::Skip("cache file exists; entry is not stale".to_string()));
                }
                self.remove_exclude(exec, key)
                    .map_err(|err| StepError::Fail(err.to_string()))?;
                Ok(Action::RemoveExclude)
            })();
            (key.to_string(), step)
        }))
    }

    /// Drop timestamp entries whose cache file no longer exists.
    pub fn clean_timestamps(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| r.stale_timestamp)?;
        Ok(self.run_batch(RepairAction::CleanTimestamps, dry_run, paths, Action::RemoveTimestamp, |exec, key| {
            let step = (|| -> Step {
                if self.timestamps.get(key)?.is_none() {
                    return Err(StepError::Skip("no timestamp entry".to_string()));
                }
                if self.live_cache_file(key) {
                    return Err(StepError::Skip("cache file exists; entry is not stale".to_string()));
                }
                self.remove_timestamp(exec, key)
                    .map_err(|err| StepError::Fail(err.to_string()))?;
                Ok(Action::RemoveTimestamp)
            })();
            (key.to_string(), step)
        }))
    }

    fn live_cache_file(&self, key: &str) -> bool {
        cache_rel(&self.layout, key).is_some_and(|rel| self.layout.cache_path(&rel).is_file())
    }

    /// Mismatched files get their mtime reset to the recorded value; entries
    /// that cannot be trusted are rewritten from the backup (or the file,
    /// clamped to now).
    pub fn fix_file_timestamps(&self, selection: Selection, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| {
            r.invalid_timestamp.into_iter().map(|t| t.path).collect()
        })?;
        let tolerance = self.config.timestamps.tolerance_secs;
        Ok(self.run_batch(RepairAction::FixFileTimestamps, dry_run, paths, Action::FixMtime, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                let Some(value) = self.timestamps.get(&key)? else {
                    return Err(StepError::Skip("no timestamp entry".to_string()));
                };
                let cache = self.layout.cache_path(&rel);
                if !cache.is_file() {
                    return Err(StepError::Skip("no cache-tier file; entry is stale".to_string()));
                }
                let actual = modified_at(&cache)?;
                let now = Utc::now();
                match classify(&value, Some(actual), now, tolerance) {
                    None => Err(StepError::Skip("timestamp already consistent".to_string())),
                    Some(TimestampProblem::Mismatch { .. }) => {
                        let expected = parse_expected(&value)
                            .ok_or_else(|| StepError::Skip("timestamp entry unreadable".to_string()))?;
                        exec.set_mtime(&cache, expected)
                            .map_err(|err| StepError::Fail(err.to_string()))?;
                        Ok(Action::FixMtime)
                    }
                    Some(TimestampProblem::Unparsable | TimestampProblem::Future { .. }) => {
                        let backup = self.layout.backup_path(&rel);
                        let source = if backup.is_file() { modified_at(&backup)? } else { actual };
                        let replacement = source.min(now);
                        self.set_timestamp(exec, &key, replacement)
                            .map_err(|err| StepError::Fail(err.to_string()))?;
                        Ok(Action::RewriteTimestamp)
                    }
                }
            })();
            (key, step)
        }))
    }

    /// Settle a file present on both tiers with no backup marker.
    pub fn resolve_duplicate(&self, selection: Selection, keep: Keep, dry_run: bool) -> TierResult<ActionResult> {
        let paths = self.targets(selection, |r| r.duplicate)?;
        let engine = self.engine();
        let attempted = match keep {
            Keep::Cache => Action::PromoteArrayCopy,
            Keep::Array => Action::DiscardCacheCopy,
        };
        Ok(self.run_batch(RepairAction::ResolveDuplicate, dry_run, paths, attempted, |exec, path| {
            let (rel, key) = match self.resolve(path) {
                Ok(found) => found,
                Err((key, err)) => return (key, Err(err)),
            };
            let step = (|| -> Step {
                if !self.layout.cache_path(&rel).is_file() || !self.layout.array_path(&rel).is_file() {
                    return Err(StepError::Skip("not present on both tiers".to_string()));
                }
                if self.layout.backup_path(&rel).exists() {
                    return Err(StepError::Skip("backup marker present; not a duplicate".to_string()));
                }
                match keep {
                    Keep::Cache => self.keep_cache_copy(exec, &engine, &rel, &key),
                    Keep::Array => self.keep_array_copy(exec, &engine, &rel, &key),
                }
            })();
            (key, step)
        }))
    }

    fn keep_cache_copy(
        &self,
        exec: &mut dyn Executor,
        engine: &MoveEngine<'_>,
        rel: &std::path::Path,
        key: &str,
    ) -> Step {
        let action = engine.promote_array_copy(exec, rel)?;
        if self.excluded(key)? {
            return Ok(action);
        }
        if let Err(err) = self.add_exclude(exec, key) {
            let reason = format!("exclude edit failed: {err}");
            let backup = self.layout.backup_path(rel);
            let array = self.layout.array_path(rel);
            let undo = exec.rename(&backup, &array);
            return Err(StepError::Fail(self.undo("resolve_duplicate", key, &reason, undo)));
        }
        Ok(action)
    }

    fn keep_array_copy(
        &self,
        exec: &mut dyn Executor,
        engine: &MoveEngine<'_>,
        rel: &std::path::Path,
        key: &str,
    ) -> Step {
        let was_excluded = self.excluded(key)?;
        let previous = self.timestamps.get(key)?;
        if was_excluded {
            self.remove_exclude(exec, key)
                .map_err(|err| StepError::Fail(err.to_string()))?;
        }
        if previous.is_some() {
            if let Err(err) = self.remove_timestamp(exec, key) {
                let reason = format!("timestamp edit failed: {err}");
                let undo = if was_excluded {
                    self.add_exclude(exec, key)
                } else {
                    Ok(())
                };
                return Err(StepError::Fail(self.undo("resolve_duplicate", key, &reason, undo)));
            }
        }

        match engine.discard_cache_copy(exec, rel) {
            Ok(action) => Ok(action),
            Err(err) => {
                let mut undo = if was_excluded {
                    self.add_exclude(exec, key)
                } else {
                    Ok(())
                };
                if let Some(value) = previous {
                    let restored = exec.store_edit("timestamps", format!("restore {key}"), &mut || {
                        self.timestamps.insert_raw(key, value.clone())
                    });
                    undo = undo.and(restored);
                }
                if let Err(undo_err) = undo {
                    let _ = self.undo("resolve_duplicate", key, "discard did not happen", Err(undo_err));
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::mover::{Effect, FsExecutor};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::fs::{self, File};
    use std::path::Path;
    use std::time::SystemTime;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, MaintenanceService) {
        let tmp = tempdir().expect("tempdir");
        let layout = TierPaths::under(tmp.path());
        fs::create_dir_all(&layout.cache_root).expect("mkdir cache");
        fs::create_dir_all(&layout.array_root).expect("mkdir array");
        (tmp, MaintenanceService::new(layout, TierConfig::default()))
    }

    fn put(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn set_mtime(path: &Path, at: DateTime<Utc>) {
        File::options()
            .write(true)
            .open(path)
            .expect("open")
            .set_modified(SystemTime::from(at))
            .expect("set mtime");
    }

    /// A file cached the normal way: backup marker, cache copy, exclude entry.
    fn cached(svc: &MaintenanceService, rel: &str, content: &str) -> String {
        let rel = Path::new(rel);
        put(&svc.layout().array_path(rel), content);
        MoveEngine::new(svc.layout(), svc.config().mover.verify)
            .cache_in(&mut FsExecutor::default(), rel)
            .expect("cache in");
        let key = svc.layout().cache_key(rel);
        svc.exclude_store().add([key.as_str()]).expect("exclude");
        key
    }

    #[test]
    fn healthy_tiers_report_no_issues() {
        let (_tmp, svc) = setup();
        cached(&svc, "movies/Heat.mkv", "heat");
        put(&svc.layout().array_path(Path::new("movies/Alien.mkv")), "alien");

        let report = svc.run_full_audit().expect("audit");
        assert!(report.summary.healthy, "{report:?}");
        assert_eq!(report.summary.cache_files, 1);
        assert_eq!(report.summary.backups, 1);
        assert_eq!(report.summary.array_files, 1);
    }

    #[test]
    fn orphaned_backup_is_found_and_restored() {
        let (_tmp, svc) = setup();
        let key = cached(&svc, "tv/Show/S01E01.mkv", "ep1");
        let rel = Path::new("tv/Show/S01E01.mkv");
        fs::remove_file(svc.layout().cache_path(rel)).expect("lose cache copy");

        let report = svc.run_full_audit().expect("audit");
        assert_eq!(report.orphaned_backup, vec![key.clone()]);
        assert_eq!(report.stale_exclude, vec![key.clone()]);

        let preview = svc.restore_all_plexcached(true).expect("dry run");
        assert!(preview.dry_run);
        assert_eq!(preview.summary.fixed, 1);
        assert!(svc.layout().backup_path(rel).exists());

        let applied = svc.restore_plexcached(vec![key.clone()], false).expect("apply");
        assert_eq!(applied.summary.fixed, 1);
        assert_eq!(applied.outcomes[0].action_taken, Action::RestoreOrphan);
        assert_eq!(preview.outcomes[0].effects, applied.outcomes[0].effects);
        assert_eq!(
            fs::read_to_string(svc.layout().array_path(rel)).expect("array"),
            "ep1"
        );
        assert!(!svc.layout().backup_path(rel).exists());

        let after = svc.run_full_audit().expect("audit");
        assert!(after.orphaned_backup.is_empty());
        assert_eq!(after.stale_exclude, vec![key]);
    }

    #[test]
    fn audit_is_read_only_and_repeatable() {
        let (_tmp, svc) = setup();
        cached(&svc, "a.mkv", "a");
        put(&svc.layout().cache_path(Path::new("loose.mkv")), "loose");
        svc.exclude_store().add(["/elsewhere/x.mkv"]).expect("exclude");
        let exclude_before = fs::read(svc.exclude_store().path()).expect("read");

        let first = svc.run_full_audit().expect("first");
        let second = svc.run_full_audit().expect("second");
        assert!(first.same_findings(&second));
        assert_eq!(fs::read(svc.exclude_store().path()).expect("read"), exclude_before);
        assert!(svc.layout().backup_path(Path::new("a.mkv")).exists());
    }

    #[test]
    fn executed_repairs_invalidate_the_cached_audit() {
        let (_tmp, svc) = setup();
        cached(&svc, "a.mkv", "a");
        fs::remove_file(svc.layout().cache_path(Path::new("a.mkv"))).expect("remove");

        let (before, _) = svc.cached_audit(false).expect("audit");
        assert_eq!(svc.get_health_summary().expect("summary").stale_exclude, 1);

        svc.clean_exclude(Selection::All, true).expect("dry run");
        let (still, _) = svc.cached_audit(false).expect("audit");
        assert!(Arc::ptr_eq(&before, &still));

        svc.clean_exclude(Selection::All, false).expect("apply");
        let (fresh, _) = svc.cached_audit(false).expect("audit");
        assert!(!Arc::ptr_eq(&before, &fresh));
        assert_eq!(fresh.summary.stale_exclude, 0);
    }

    #[test]
    fn clean_exclude_revalidates_each_path() {
        let (_tmp, svc) = setup();
        let live = cached(&svc, "live.mkv", "l");
        svc.exclude_store().add(["/elsewhere/gone.mkv"]).expect("exclude");

        let result = svc
            .clean_exclude(
                Selection::Paths(vec![live.clone(), "/elsewhere/gone.mkv".to_string()]),
                false,
            )
            .expect("clean");
        assert_eq!(result.summary.fixed, 1);
        assert_eq!(result.summary.skipped, 1);
        let remaining = svc.exclude_store().paths().expect("paths");
        assert_eq!(remaining, BTreeSet::from([live]));
    }

    #[test]
    fn clean_exclude_dry_run_changes_nothing() {
        let (_tmp, svc) = setup();
        svc.exclude_store()
            .add(["/elsewhere/a.mkv", "/elsewhere/b.mkv"])
            .expect("exclude");

        let preview = svc.preview_stale_exclude().expect("preview");
        assert_eq!(preview.total, 2);
        let result = svc.clean_exclude(Selection::All, true).expect("dry run");
        assert_eq!(result.summary.fixed, 2);
        assert!(matches!(result.outcomes[0].effects[0], Effect::Store { .. }));
        assert_eq!(svc.exclude_store().paths().expect("paths").len(), 2);
    }

    #[test]
    fn clean_timestamps_drops_only_stale_entries() {
        let (_tmp, svc) = setup();
        let live = cached(&svc, "live.mkv", "l");
        let mtime = modified_at(&svc.layout().cache_path(Path::new("live.mkv"))).expect("mtime");
        svc.timestamp_store().set(&live, mtime).expect("set");
        svc.timestamp_store().set("/elsewhere/old.mkv", mtime).expect("set");

        assert_eq!(svc.preview_stale_timestamps().expect("preview").total, 1);
        let result = svc.clean_timestamps(Selection::All, false).expect("clean");
        assert_eq!(result.summary.fixed, 1);
        let entries = svc.timestamp_store().entries().expect("entries");
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec![&live]);
    }

    #[test]
    fn fix_with_backup_records_exclude_and_timestamp() {
        let (_tmp, svc) = setup();
        let key = cached(&svc, "a.mkv", "a");
        svc.exclude_store().remove([key.as_str()]).expect("unexclude");

        let report = svc.run_full_audit().expect("audit");
        assert_eq!(report.unprotected.len(), 1);
        assert!(report.unprotected[0].has_backup);

        let result = svc.fix_with_backup(Selection::All, false).expect("fix");
        assert_eq!(result.summary.fixed, 1);
        assert!(svc.exclude_store().contains(&key).expect("contains"));
        assert!(svc.timestamp_store().get(&key).expect("get").is_some());
        assert!(svc.run_full_audit().expect("audit").summary.healthy);
    }

    #[test]
    fn protect_with_backup_creates_marker_then_excludes() {
        let (_tmp, svc) = setup();
        let rel = Path::new("new.mkv");
        put(&svc.layout().cache_path(rel), "fresh");
        let key = svc.layout().cache_key(rel);

        let result = svc.protect_with_backup(Selection::All, false).expect("protect");
        assert_eq!(result.summary.fixed, 1);
        assert_eq!(result.outcomes[0].action_taken, Action::CreateBackup);
        assert_eq!(
            fs::read_to_string(svc.layout().backup_path(rel)).expect("backup"),
            "fresh"
        );
        assert!(svc.exclude_store().contains(&key).expect("contains"));
    }

    #[test]
    fn add_to_exclude_skips_missing_and_outside_paths() {
        let (_tmp, svc) = setup();
        put(&svc.layout().cache_path(Path::new("a.mkv")), "a");
        let key = svc.layout().cache_key(Path::new("a.mkv"));
        let missing = svc.layout().cache_key(Path::new("missing.mkv"));

        let result = svc
            .add_to_exclude(
                Selection::Paths(vec![key.clone(), missing, "/tmp/elsewhere.mkv".to_string()]),
                false,
            )
            .expect("add");
        assert_eq!(result.summary.fixed, 1);
        assert_eq!(result.summary.skipped, 2);
        assert!(svc.exclude_store().contains(&key).expect("contains"));
    }

    #[test]
    fn sync_to_array_moves_unprotected_file_back() {
        let (_tmp, svc) = setup();
        let rel = Path::new("stray.mkv");
        put(&svc.layout().cache_path(rel), "stray");
        let key = svc.layout().cache_key(rel);
        svc.timestamp_store().set(&key, Utc::now()).expect("set");

        let result = svc.sync_to_array(Selection::Paths(vec![key.clone()]), false).expect("sync");
        assert_eq!(result.summary.fixed, 1);
        assert_eq!(result.outcomes[0].action_taken, Action::CopyToArray);
        assert!(!svc.layout().cache_path(rel).exists());
        assert_eq!(
            fs::read_to_string(svc.layout().array_path(rel)).expect("array"),
            "stray"
        );
        assert!(svc.timestamp_store().get(&key).expect("get").is_none());
    }

    #[test]
    fn sync_to_array_restores_timestamp_when_evict_skips() {
        let (_tmp, svc) = setup();
        let rel = Path::new("dup.mkv");
        put(&svc.layout().cache_path(rel), "cache");
        put(&svc.layout().array_path(rel), "array");
        let key = svc.layout().cache_key(rel);
        svc.timestamp_store().set(&key, Utc::now()).expect("set");

        let result = svc.sync_to_array(Selection::Paths(vec![key.clone()]), false).expect("sync");
        assert_eq!(result.summary.skipped, 1);
        assert!(svc.timestamp_store().get(&key).expect("get").is_some());
        assert!(svc.layout().cache_path(rel).exists());
    }

    #[test]
    fn fix_file_timestamps_handles_mismatch_and_future() {
        let (_tmp, svc) = setup();
        let drifted = cached(&svc, "drift.mkv", "d");
        let future = cached(&svc, "future.mkv", "f");
        let recorded = Utc::now() - ChronoDuration::days(10);
        svc.timestamp_store().set(&drifted, recorded).expect("set");
        svc.timestamp_store()
            .insert_raw(&future, json!(iso_time::format(&(Utc::now() + ChronoDuration::days(30)))))
            .expect("set");
        let backup_mtime = Utc::now() - ChronoDuration::days(3);
        set_mtime(&svc.layout().backup_path(Path::new("future.mkv")), backup_mtime);
        set_mtime(&svc.layout().cache_path(Path::new("future.mkv")), backup_mtime);

        let report = svc.run_full_audit().expect("audit");
        assert_eq!(report.invalid_timestamp.len(), 2);

        let result = svc.fix_file_timestamps(Selection::All, false).expect("fix");
        assert_eq!(result.summary.fixed, 2, "{result:?}");
        let actions = result.outcomes.iter().map(|o| o.action_taken).collect::<Vec<_>>();
        assert!(actions.contains(&Action::FixMtime));
        assert!(actions.contains(&Action::RewriteTimestamp));

        let mtime = modified_at(&svc.layout().cache_path(Path::new("drift.mkv"))).expect("mtime");
        assert!((mtime - recorded).num_seconds().abs() <= 1);
        let rewritten = parse_expected(
            &svc.timestamp_store().get(&future).expect("get").expect("entry"),
        )
        .expect("parse");
        assert!((rewritten - backup_mtime).num_seconds().abs() <= 1);
        assert!(svc.run_full_audit().expect("audit").invalid_timestamp.is_empty());
    }

    #[test]
    fn resolve_duplicate_keep_cache_promotes_array_copy() {
        let (_tmp, svc) = setup();
        let rel = Path::new("dup.mkv");
        put(&svc.layout().cache_path(rel), "same");
        put(&svc.layout().array_path(rel), "same");
        let key = svc.layout().cache_key(rel);

        let result = svc
            .resolve_duplicate(Selection::All, Keep::Cache, false)
            .expect("resolve");
        assert_eq!(result.summary.fixed, 1);
        assert!(!svc.layout().array_path(rel).exists());
        assert!(svc.layout().backup_path(rel).exists());
        assert!(svc.exclude_store().contains(&key).expect("contains"));
        assert!(svc.run_full_audit().expect("audit").summary.healthy);
    }

    #[test]
    fn resolve_duplicate_keep_array_requires_identical_content() {
        let (_tmp, svc) = setup();
        let same = Path::new("same.mkv");
        let diff = Path::new("diff.mkv");
        put(&svc.layout().cache_path(same), "x");
        put(&svc.layout().array_path(same), "x");
        put(&svc.layout().cache_path(diff), "new");
        put(&svc.layout().array_path(diff), "old");

        let result = svc
            .resolve_duplicate(Selection::All, Keep::Array, false)
            .expect("resolve");
        assert_eq!(result.summary.fixed, 1);
        assert_eq!(result.summary.skipped, 1);
        assert!(!svc.layout().cache_path(same).exists());
        assert!(svc.layout().cache_path(diff).exists());
        let skipped = result
            .outcomes
            .iter()
            .find(|o| o.status == OutcomeStatus::Skipped)
            .expect("skipped");
        assert!(skipped.reason_if_skipped.as_deref().unwrap_or("").contains("differs"));
    }

    #[test]
    fn resolve_duplicate_keep_array_restores_tracking_when_content_differs() {
        let (_tmp, svc) = setup();
        let rel = Path::new("diff.mkv");
        put(&svc.layout().cache_path(rel), "new");
        put(&svc.layout().array_path(rel), "old");
        let key = svc.layout().cache_key(rel);
        svc.exclude_store().add([key.as_str()]).expect("exclude");
        svc.timestamp_store().insert_raw(&key, json!("garbage")).expect("timestamp");

        let result = svc
            .resolve_duplicate(Selection::Paths(vec![key.clone()]), Keep::Array, false)
            .expect("resolve");
        assert_eq!(result.summary.skipped, 1);
        assert!(svc.layout().cache_path(rel).exists());
        assert!(svc.exclude_store().contains(&key).expect("contains"));
        assert_eq!(
            svc.timestamp_store().get(&key).expect("get"),
            Some(json!("garbage"))
        );
    }

    #[test]
    fn resolve_duplicate_keep_array_drops_tracking_with_the_cache_copy() {
        let (_tmp, svc) = setup();
        let rel = Path::new("same.mkv");
        put(&svc.layout().cache_path(rel), "x");
        put(&svc.layout().array_path(rel), "x");
        let key = svc.layout().cache_key(rel);
        svc.exclude_store().add([key.as_str()]).expect("exclude");
        svc.timestamp_store().set(&key, Utc::now()).expect("timestamp");

        let result = svc
            .resolve_duplicate(Selection::Paths(vec![key.clone()]), Keep::Array, false)
            .expect("resolve");
        assert_eq!(result.summary.fixed, 1);
        assert!(!svc.layout().cache_path(rel).exists());
        assert!(svc.exclude_store().paths().expect("paths").is_empty());
        assert!(svc.timestamp_store().entries().expect("entries").is_empty());
    }

    #[test]
    fn paths_climbing_out_of_a_tier_are_skipped_by_every_repair() {
        let (_tmp, svc) = setup();
        let rel = Path::new("movies/only.mkv");
        let only = svc.layout().array_path(rel);
        put(&only, "only copy");
        put(&svc.layout().backup_path(Path::new("movies/marked.mkv")), "marked");
        let escape = |name: &str| {
            svc.layout()
                .cache_root
                .join("../array/movies")
                .join(name)
                .display()
                .to_string()
        };
        let paths = vec![escape("only.mkv"), escape("marked.mkv")];
        let sel = || Selection::Paths(paths.clone());

        let results = vec![
            svc.restore_plexcached(paths.clone(), false).expect("restore"),
            svc.fix_with_backup(sel(), false).expect("fix"),
            svc.sync_to_array(sel(), false).expect("sync"),
            svc.add_to_exclude(sel(), false).expect("exclude"),
            svc.protect_with_backup(sel(), false).expect("protect"),
            svc.fix_file_timestamps(sel(), false).expect("timestamps"),
            svc.resolve_duplicate(sel(), Keep::Array, false).expect("keep array"),
            svc.resolve_duplicate(sel(), Keep::Cache, false).expect("keep cache"),
        ];
        for result in &results {
            assert_eq!(result.summary.skipped, 2, "{:?}", result.action);
            assert!(result.outcomes.iter().all(|o| {
                o.reason_if_skipped.as_deref() == Some("path is outside the managed tiers")
            }));
        }
        assert_eq!(fs::read_to_string(&only).expect("only copy"), "only copy");
        assert!(svc.layout().backup_path(Path::new("movies/marked.mkv")).exists());
        assert!(svc.exclude_store().paths().expect("paths").is_empty());
    }

    #[test]
    fn executed_repairs_are_journaled() {
        let (_tmp, svc) = setup();
        svc.exclude_store().add(["/elsewhere/a.mkv"]).expect("exclude");
        svc.clean_exclude(Selection::All, true).expect("dry run");
        assert!(!journal::journal_path(svc.layout()).exists());
        svc.clean_exclude(Selection::All, false).expect("apply");
        let raw = fs::read_to_string(journal::journal_path(svc.layout())).expect("journal");
        assert!(raw.contains("repair:clean_exclude"));
    }
}
