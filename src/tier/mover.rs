//! Lossless moves between the cache tier and the array tier.
//!
//! Content leaves its source only after the destination copy has been written
//! under a temporary name, verified, and renamed into place. Before an array
//! original makes room for a cache copy it is renamed to a `.plexcached`
//! backup marker, so every cache-tier file placed here can be restored
//! without a re-copy.
//!
//! Every mutation goes through an [`Executor`]: [`FsExecutor`] touches the
//! filesystem, [`DryRunExecutor`] records what would happen. Both return the
//! same effects, so callers never branch on `dry_run`.

use crate::error::{TierError, TierResult};
use crate::tier::config::VerifyMode;
use crate::tier::layout::TierPaths;
use crate::tier::util::{file_hash, file_size, iso_time, same_content};
use crate::tier::warn::{self, WarnEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const PARTIAL_PREFIX: &str = ".plexcache-";
pub const PARTIAL_SUFFIX: &str = ".partial";

/// In-flight copy temporaries are invisible to the audit.
pub fn is_partial_copy(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(PARTIAL_PREFIX) && n.ends_with(PARTIAL_SUFFIX))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Effect {
    Rename { from: String, to: String },
    Copy { from: String, to: String, bytes: u64 },
    Remove { path: String },
    SetMtime { path: String, mtime: String },
    Store { store: String, change: String },
}

pub trait Executor {
    fn dry_run(&self) -> bool;
    fn rename(&mut self, from: &Path, to: &Path) -> TierResult<()>;
    /// Copy to a temporary beside `to`, verify, then rename into place.
    /// Never overwrites an existing `to`.
    fn copy_verified(&mut self, from: &Path, to: &Path, verify: VerifyMode) -> TierResult<u64>;
    fn remove_file(&mut self, path: &Path) -> TierResult<()>;
    fn set_mtime(&mut self, path: &Path, mtime: DateTime<Utc>) -> TierResult<()>;
    fn store_edit(
        &mut self,
        store: &str,
        change: String,
        apply: &mut dyn FnMut() -> TierResult<()>,
    ) -> TierResult<()>;
    fn take_effects(&mut self) -> Vec<Effect>;
}

pub fn executor(dry_run: bool) -> Box<dyn Executor> {
    if dry_run {
        Box::new(DryRunExecutor::default())
    } else {
        Box::new(FsExecutor::default())
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        ErrorKind::AlreadyExists,
        format!("{} already exists", path.display()),
    )
}

#[derive(Debug, Default)]
pub struct FsExecutor {
    effects: Vec<Effect>,
}

impl Executor for FsExecutor {
    fn dry_run(&self) -> bool {
        false
    }

    fn rename(&mut self, from: &Path, to: &Path) -> TierResult<()> {
        if to.exists() {
            return Err(TierError::fs("rename onto", to, already_exists(to)));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|err| TierError::fs("create", parent, err))?;
        }
        fs::rename(from, to).map_err(|err| TierError::fs("rename", from, err))?;
        tracing::debug!(from = %from.display(), to = %to.display(), "renamed");
        self.effects.push(Effect::Rename {
            from: display(from),
            to: display(to),
        });
        Ok(())
    }

    fn copy_verified(&mut self, from: &Path, to: &Path, verify: VerifyMode) -> TierResult<u64> {
        if to.exists() {
            return Err(TierError::fs("copy onto", to, already_exists(to)));
        }
        let parent = to
            .parent()
            .ok_or_else(|| TierError::fs("copy onto", to, io::Error::from(ErrorKind::InvalidInput)))?;
        fs::create_dir_all(parent).map_err(|err| TierError::fs("create", parent, err))?;

        let source_meta = fs::metadata(from).map_err(|err| TierError::fs("stat", from, err))?;
        let mut source = File::open(from).map_err(|err| TierError::fs("open", from, err))?;
        let mut temp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)
            .map_err(|err| TierError::fs("create temp in", parent, err))?;

        let copied = io::copy(&mut source, temp.as_file_mut())
            .map_err(|err| TierError::fs("copy", from, err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| TierError::fs("sync", temp.path().to_path_buf(), err))?;

        let written = file_size(temp.path())?;
        if copied != source_meta.len() || written != source_meta.len() {
            return Err(TierError::fs(
                "verify",
                to,
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "size mismatch: source {} bytes, copy {} bytes",
                        source_meta.len(),
                        written
                    ),
                ),
            ));
        }
        if verify == VerifyMode::Sha256 && file_hash(from)? != file_hash(temp.path())? {
            return Err(TierError::fs(
                "verify",
                to,
                io::Error::new(ErrorKind::InvalidData, "sha256 mismatch"),
            ));
        }

        if let Ok(modified) = source_meta.modified() {
            temp.as_file()
                .set_modified(modified)
                .map_err(|err| TierError::fs("set mtime on", temp.path().to_path_buf(), err))?;
        }
        fs::set_permissions(temp.path(), source_meta.permissions())
            .map_err(|err| TierError::fs("set permissions on", temp.path().to_path_buf(), err))?;
        temp.persist_noclobber(to)
            .map_err(|err| TierError::fs("place copy at", to, err.error))?;

        tracing::debug!(from = %from.display(), to = %to.display(), bytes = copied, "copied and verified");
        self.effects.push(Effect::Copy {
            from: display(from),
            to: display(to),
            bytes: copied,
        });
        Ok(copied)
    }

    fn remove_file(&mut self, path: &Path) -> TierResult<()> {
        fs::remove_file(path).map_err(|err| TierError::fs("remove", path, err))?;
        tracing::debug!(path = %path.display(), "removed");
        self.effects.push(Effect::Remove {
            path: display(path),
        });
        Ok(())
    }

    fn set_mtime(&mut self, path: &Path, mtime: DateTime<Utc>) -> TierResult<()> {
        let file = File::options()
            .write(true)
            .open(path)
            .map_err(|err| TierError::fs("open", path, err))?;
        file.set_modified(SystemTime::from(mtime))
            .map_err(|err| TierError::fs("set mtime on", path, err))?;
        self.effects.push(Effect::SetMtime {
            path: display(path),
            mtime: iso_time::format(&mtime),
        });
        Ok(())
    }

    fn store_edit(
        &mut self,
        store: &str,
        change: String,
        apply: &mut dyn FnMut() -> TierResult<()>,
    ) -> TierResult<()> {
        apply()?;
        self.effects.push(Effect::Store {
            store: store.to_string(),
            change,
        });
        Ok(())
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

/// Records effects without touching anything. Simulated renames and copies
/// are tracked so later steps see the same occupied paths, and sizes, the
/// real run would.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    effects: Vec<Effect>,
    /// Simulated path → real file whose content it holds.
    placed: BTreeMap<PathBuf, PathBuf>,
    vacated: BTreeSet<PathBuf>,
}

impl DryRunExecutor {
    fn origin(&self, path: &Path) -> PathBuf {
        self.placed.get(path).cloned().unwrap_or_else(|| path.to_path_buf())
    }

    fn occupied(&self, path: &Path) -> bool {
        self.placed.contains_key(path) || (path.exists() && !self.vacated.contains(path))
    }

    fn place(&mut self, to: &Path, origin: PathBuf) {
        self.vacated.remove(to);
        if origin != to {
            self.placed.insert(to.to_path_buf(), origin);
        }
    }

    fn vacate(&mut self, path: &Path) {
        self.placed.remove(path);
        self.vacated.insert(path.to_path_buf());
    }
}

impl Executor for DryRunExecutor {
    fn dry_run(&self) -> bool {
        true
    }

    fn rename(&mut self, from: &Path, to: &Path) -> TierResult<()> {
        if self.occupied(to) {
            return Err(TierError::fs("rename onto", to, already_exists(to)));
        }
        let origin = self.origin(from);
        self.vacate(from);
        self.place(to, origin);
        self.effects.push(Effect::Rename {
            from: display(from),
            to: display(to),
        });
        Ok(())
    }

    fn copy_verified(&mut self, from: &Path, to: &Path, _verify: VerifyMode) -> TierResult<u64> {
        if self.occupied(to) {
            return Err(TierError::fs("copy onto", to, already_exists(to)));
        }
        let origin = self.origin(from);
        let bytes = fs::metadata(&origin).map(|m| m.len()).unwrap_or(0);
        self.place(to, origin);
        self.effects.push(Effect::Copy {
            from: display(from),
            to: display(to),
            bytes,
        });
        Ok(bytes)
    }

    fn remove_file(&mut self, path: &Path) -> TierResult<()> {
        self.vacate(path);
        self.effects.push(Effect::Remove {
            path: display(path),
        });
        Ok(())
    }

    fn set_mtime(&mut self, path: &Path, mtime: DateTime<Utc>) -> TierResult<()> {
        self.effects.push(Effect::SetMtime {
            path: display(path),
            mtime: iso_time::format(&mtime),
        });
        Ok(())
    }

    fn store_edit(
        &mut self,
        store: &str,
        change: String,
        _apply: &mut dyn FnMut() -> TierResult<()>,
    ) -> TierResult<()> {
        self.effects.push(Effect::Store {
            store: store.to_string(),
            change,
        });
        Ok(())
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    CacheIn,
    RestoreBackup,
    CopyToArray,
    RestoreOrphan,
    DropRedundantBackup,
    CreateBackup,
    DiscardCacheCopy,
    PromoteArrayCopy,
    AddToExclude,
    RemoveExclude,
    RemoveTimestamp,
    FixMtime,
    RewriteTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Preconditions do not hold; nothing was touched.
    Skip(String),
    /// Something failed; rolled back unless the reason says otherwise.
    Fail(String),
}

impl From<TierError> for StepError {
    fn from(err: TierError) -> Self {
        match err {
            TierError::Validation { reason, .. } => Self::Skip(reason),
            other => Self::Fail(other.to_string()),
        }
    }
}

pub type Step = Result<Action, StepError>;

#[derive(Debug, Clone, Serialize)]
pub struct PathOutcome {
    pub path: String,
    pub action_taken: Action,
    pub status: OutcomeStatus,
    pub success: bool,
    pub reason_if_skipped: Option<String>,
    pub effects: Vec<Effect>,
}

impl PathOutcome {
    pub fn from_step(path: String, attempted: Action, step: Step, effects: Vec<Effect>) -> Self {
        let (action_taken, status, reason) = match step {
            Ok(action) => (action, OutcomeStatus::Done, None),
            Err(StepError::Skip(reason)) => (Action::None, OutcomeStatus::Skipped, Some(reason)),
            Err(StepError::Fail(reason)) => (attempted, OutcomeStatus::Failed, Some(reason)),
        };
        Self {
            path,
            action_taken,
            success: status == OutcomeStatus::Done,
            status,
            reason_if_skipped: reason,
            effects,
        }
    }

    pub fn skipped(path: String, reason: impl Into<String>) -> Self {
        Self::from_step(path, Action::None, Err(StepError::Skip(reason.into())), Vec::new())
    }
}

fn rollback_failed(stage: &str, action: &str, path: &Path, reason: &str, err: &TierError) {
    warn::emit(WarnEvent {
        code: "ROLLBACK_FAILED",
        stage,
        action,
        path: &display(path),
        retry: "next-audit",
        reason,
        err: &err.to_string(),
    });
}

pub struct MoveEngine<'a> {
    layout: &'a TierPaths,
    verify: VerifyMode,
}

impl<'a> MoveEngine<'a> {
    pub fn new(layout: &'a TierPaths, verify: VerifyMode) -> Self {
        Self { layout, verify }
    }

    pub fn layout(&self) -> &TierPaths {
        self.layout
    }

    /// Array original → backup marker → verified cache copy.
    pub fn cache_in(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);
        let backup = self.layout.backup_path(rel);

        if cache.exists() {
            return Err(StepError::Skip("already on the cache tier".to_string()));
        }
        if backup.exists() {
            return Err(StepError::Skip(
                "backup marker already present without a cache copy".to_string(),
            ));
        }
        if !array.is_file() {
            return Err(StepError::Skip("no array original to cache".to_string()));
        }

        exec.rename(&array, &backup)
            .map_err(|err| StepError::Fail(format!("backup creation failed: {err}")))?;

        if let Err(err) = exec.copy_verified(&backup, &cache, self.verify) {
            let reason = format!("copy to cache failed: {err}");
            if let Err(rb) = exec.rename(&backup, &array) {
                rollback_failed("cache-in", "restore-array-original", &backup, &reason, &rb);
                return Err(StepError::Fail(format!(
                    "{reason}; original left as backup marker {} ({rb})",
                    backup.display()
                )));
            }
            return Err(StepError::Fail(format!("{reason}; array original restored")));
        }
        Ok(Action::CacheIn)
    }

    /// Return a cache-tier file to the array. With a backup marker the
    /// original is restored by rename; without one the cache copy is copied
    /// and verified first.
    pub fn evict(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);
        let backup = self.layout.backup_path(rel);

        if !cache.is_file() {
            return Err(StepError::Skip("no cache-tier copy to evict".to_string()));
        }
        let has_backup = backup.is_file();
        if array.exists() {
            return Err(StepError::Skip(if has_backup {
                "array holds both a live copy and a backup marker".to_string()
            } else {
                "array already holds an independent copy (duplicate)".to_string()
            }));
        }

        if has_backup {
            // Restoring the backup deletes the cache copy, so only identical
            // content qualifies regardless of the configured verify mode.
            let unchanged = same_content(&cache, &backup, true).map_err(StepError::from)?;
            if unchanged {
                return self.evict_by_restore(exec, &cache, &array, &backup);
            }
        }

        exec.copy_verified(&cache, &array, self.verify)
            .map_err(|err| StepError::Fail(format!("copy to array failed: {err}")))?;
        if let Err(err) = exec.remove_file(&cache) {
            let reason = format!("copied to array but could not remove cache copy: {err}");
            if let Err(rb) = exec.remove_file(&array) {
                rollback_failed("evict", "remove-array-copy", &array, &reason, &rb);
                return Err(StepError::Fail(format!(
                    "{reason}; array copy also left in place ({rb})"
                )));
            }
            return Err(StepError::Fail(format!("{reason}; array copy rolled back")));
        }
        if has_backup {
            // The cache copy diverged from the preserved original; the new
            // content is now on the array and the old original is obsolete.
            if let Err(err) = exec.remove_file(&backup) {
                warn::emit(WarnEvent {
                    code: "STALE_BACKUP_LEFT",
                    stage: "evict",
                    action: "remove-superseded-backup",
                    path: &display(&backup),
                    retry: "next-audit",
                    reason: "cache copy diverged from backup",
                    err: &err.to_string(),
                });
                return Err(StepError::Fail(format!(
                    "evicted, but superseded backup {} could not be removed: {err}",
                    backup.display()
                )));
            }
        }
        Ok(Action::CopyToArray)
    }

    fn evict_by_restore(
        &self,
        exec: &mut dyn Executor,
        cache: &Path,
        array: &Path,
        backup: &Path,
    ) -> Step {
        exec.rename(backup, array)
            .map_err(|err| StepError::Fail(format!("backup restore failed: {err}")))?;
        if let Err(err) = exec.remove_file(cache) {
            let reason = format!("restored backup but could not remove cache copy: {err}");
            if let Err(rb) = exec.rename(array, backup) {
                rollback_failed("evict", "re-mark-backup", array, &reason, &rb);
                return Err(StepError::Fail(format!(
                    "{reason}; backup not re-marked, array and cache now both hold the file ({rb})"
                )));
            }
            return Err(StepError::Fail(format!("{reason}; backup marker restored")));
        }
        Ok(Action::RestoreBackup)
    }

    /// Restore a backup marker whose cache copy is gone.
    pub fn restore_orphan(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);
        let backup = self.layout.backup_path(rel);

        if !backup.is_file() {
            return Err(StepError::Skip("no backup marker".to_string()));
        }
        if cache.exists() {
            return Err(StepError::Skip(
                "cache copy exists; backup is not orphaned".to_string(),
            ));
        }
        if array.exists() {
            let identical = same_content(&array, &backup, true).map_err(StepError::from)?;
            if !identical {
                return Err(StepError::Skip(
                    "array holds a different file at the original path".to_string(),
                ));
            }
            exec.remove_file(&backup)
                .map_err(|err| StepError::Fail(err.to_string()))?;
            return Ok(Action::DropRedundantBackup);
        }
        exec.rename(&backup, &array)
            .map_err(|err| StepError::Fail(err.to_string()))?;
        Ok(Action::RestoreOrphan)
    }

    /// Preserve a cache-only file on the array as a backup marker.
    pub fn create_backup(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);
        let backup = self.layout.backup_path(rel);

        if !cache.is_file() {
            return Err(StepError::Skip("no cache-tier file".to_string()));
        }
        if backup.exists() {
            return Err(StepError::Skip("backup marker already present".to_string()));
        }
        if array.exists() {
            return Err(StepError::Skip(
                "array already holds a copy (duplicate)".to_string(),
            ));
        }
        exec.copy_verified(&cache, &backup, self.verify)
            .map_err(|err| StepError::Fail(format!("backup copy failed: {err}")))?;
        Ok(Action::CreateBackup)
    }

    /// Undo [`MoveEngine::create_backup`]; the cache copy is still intact.
    pub fn drop_created_backup(&self, exec: &mut dyn Executor, rel: &Path) -> TierResult<()> {
        exec.remove_file(&self.layout.backup_path(rel))
    }

    /// Drop the cache copy of a duplicate whose array copy is identical.
    pub fn discard_cache_copy(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);

        if !cache.is_file() || !array.is_file() {
            return Err(StepError::Skip("not present on both tiers".to_string()));
        }
        let identical = same_content(&cache, &array, true).map_err(StepError::from)?;
        if !identical {
            return Err(StepError::Skip(
                "cache copy differs from array copy; keep cache or reconcile manually".to_string(),
            ));
        }
        exec.remove_file(&cache)
            .map_err(|err| StepError::Fail(err.to_string()))?;
        Ok(Action::DiscardCacheCopy)
    }

    /// Turn the array copy of a duplicate into the cache copy's backup marker.
    pub fn promote_array_copy(&self, exec: &mut dyn Executor, rel: &Path) -> Step {
        let cache = self.layout.cache_path(rel);
        let array = self.layout.array_path(rel);
        let backup = self.layout.backup_path(rel);

        if !cache.is_file() || !array.is_file() {
            return Err(StepError::Skip("not present on both tiers".to_string()));
        }
        if backup.exists() {
            return Err(StepError::Skip("backup marker already present".to_string()));
        }
        exec.rename(&array, &backup)
            .map_err(|err| StepError::Fail(err.to_string()))?;
        Ok(Action::PromoteArrayCopy)
    }
}
