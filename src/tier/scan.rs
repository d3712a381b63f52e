//! Read-only reconciliation of both tiers against the exclude and timestamp
//! stores.

use crate::error::{TierError, TierResult};
use crate::tier::layout::{TierPaths, is_backup_marker, is_contained, strip_backup_suffix};
use crate::tier::mover::is_partial_copy;
use crate::tier::timestamps::{TimestampMap, TimestampProblem, classify};
use crate::tier::util::modified_at;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Relative paths present on each tier, from one walk of both roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierFileSets {
    pub cache: BTreeSet<PathBuf>,
    pub array: BTreeSet<PathBuf>,
    pub backups: BTreeSet<PathBuf>,
}

fn walk_files(root: &Path) -> TierResult<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| {
            let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            TierError::fs("walk", path, err.into())
        })?;
        if !entry.file_type().is_file() || is_partial_copy(entry.path()) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(out)
}

pub fn scan_tiers(layout: &TierPaths) -> TierResult<TierFileSets> {
    let mut sets = TierFileSets::default();
    for rel in walk_files(&layout.cache_root)? {
        sets.cache.insert(rel);
    }
    for rel in walk_files(&layout.array_root)? {
        if is_backup_marker(&rel) {
            sets.backups.insert(strip_backup_suffix(&rel));
        } else {
            sets.array.insert(rel);
        }
    }
    Ok(sets)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnprotectedFile {
    pub path: String,
    pub has_backup: bool,
    pub has_array_copy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidTimestamp {
    pub path: String,
    #[serde(flatten)]
    pub problem: TimestampProblem,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub cache_files: usize,
    pub array_files: usize,
    pub backups: usize,
    pub exclude_entries: usize,
    pub timestamp_entries: usize,
    pub orphaned_backup: usize,
    pub duplicate: usize,
    pub unprotected: usize,
    pub stale_exclude: usize,
    pub stale_timestamp: usize,
    pub invalid_timestamp: usize,
    pub issues_total: usize,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub orphaned_backup: Vec<String>,
    pub duplicate: Vec<String>,
    pub unprotected: Vec<UnprotectedFile>,
    pub stale_exclude: Vec<String>,
    pub stale_timestamp: Vec<String>,
    pub invalid_timestamp: Vec<InvalidTimestamp>,
    pub summary: HealthSummary,
}

impl HealthReport {
    /// Counts-only view; no filesystem access.
    pub fn health_summary(&self) -> HealthSummary {
        self.summary.clone()
    }

    /// Equality ignoring when the report was computed.
    pub fn same_findings(&self, other: &HealthReport) -> bool {
        Self {
            generated_at: other.generated_at,
            ..self.clone()
        } == *other
    }
}

/// Inputs for classification, already loaded.
pub struct AuditInputs<'a> {
    pub layout: &'a TierPaths,
    pub sets: &'a TierFileSets,
    pub exclude: &'a BTreeSet<String>,
    pub timestamps: &'a TimestampMap,
    pub tolerance_secs: u64,
    pub now: DateTime<Utc>,
}

/// Map a stored key to its relative path when it points into the cache tier.
pub fn cache_rel(layout: &TierPaths, key: &str) -> Option<PathBuf> {
    Path::new(key)
        .strip_prefix(&layout.cache_root)
        .ok()
        .filter(|rel| is_contained(rel))
        .map(Path::to_path_buf)
}

pub fn classify_inputs(inputs: &AuditInputs<'_>) -> HealthReport {
    let AuditInputs {
        layout,
        sets,
        exclude,
        timestamps,
        tolerance_secs,
        now,
    } = inputs;
    let key = |rel: &PathBuf| layout.cache_key(rel);

    let orphaned_backup = sets
        .backups
        .difference(&sets.cache)
        .map(key)
        .collect::<Vec<_>>();

    let duplicate = sets
        .cache
        .intersection(&sets.array)
        .filter(|rel| !sets.backups.contains(*rel))
        .map(key)
        .collect::<Vec<_>>();

    let excluded_rel = exclude
        .iter()
        .filter_map(|k| cache_rel(layout, k))
        .collect::<BTreeSet<_>>();
    let unprotected = sets
        .cache
        .difference(&excluded_rel)
        .map(|rel| UnprotectedFile {
            path: key(rel),
            has_backup: sets.backups.contains(rel),
            has_array_copy: sets.array.contains(rel),
        })
        .collect::<Vec<_>>();

    let stale_exclude = exclude
        .iter()
        .filter(|k| cache_rel(layout, k).is_none_or(|rel| !sets.cache.contains(&rel)))
        .cloned()
        .collect::<Vec<_>>();

    let mut stale_timestamp = Vec::new();
    let mut invalid_timestamp = Vec::new();
    for (k, value) in timestamps.iter() {
        let Some(rel) = cache_rel(layout, k).filter(|rel| sets.cache.contains(rel)) else {
            stale_timestamp.push(k.clone());
            continue;
        };
        let actual = modified_at(&layout.cache_path(&rel)).ok();
        if let Some(problem) = classify(value, actual, *now, *tolerance_secs) {
            invalid_timestamp.push(InvalidTimestamp {
                path: k.clone(),
                problem,
            });
        }
    }

    let issues_total = orphaned_backup.len()
        + duplicate.len()
        + unprotected.len()
        + stale_exclude.len()
        + stale_timestamp.len()
        + invalid_timestamp.len();
    let summary = HealthSummary {
        cache_files: sets.cache.len(),
        array_files: sets.array.len(),
        backups: sets.backups.len(),
        exclude_entries: exclude.len(),
        timestamp_entries: timestamps.len(),
        orphaned_backup: orphaned_backup.len(),
        duplicate: duplicate.len(),
        unprotected: unprotected.len(),
        stale_exclude: stale_exclude.len(),
        stale_timestamp: stale_timestamp.len(),
        invalid_timestamp: invalid_timestamp.len(),
        issues_total,
        healthy: issues_total == 0,
    };

    HealthReport {
        generated_at: *now,
        orphaned_backup,
        duplicate,
        unprotected,
        stale_exclude,
        stale_timestamp,
        invalid_timestamp,
        summary,
    }
}
