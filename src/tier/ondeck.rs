//! Ledger of on-deck files that survives across scheduled runs.
//!
//! A run is `prepare_for_run` → `update_entry` per reported item →
//! `cleanup_unseen`. Per-run fields (users, on-deck users, episode info) are
//! rebuilt every run; `first_seen` is written once and never touched again,
//! which is what retention expiry measures against.

use crate::error::TierResult;
use crate::tier::config::LockConfig;
use crate::tier::store::{DocStore, Document, json_decode, json_encode};
use crate::tier::util::iso_time;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub show: String,
    pub season: u32,
    pub episode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackedEntry {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub ondeck_users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_info: Option<EpisodeInfo>,
    #[serde(default, with = "iso_time::option", skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_time::option", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

pub type Ledger = BTreeMap<String, TrackedEntry>;

impl Document for Ledger {
    fn decode(raw: &str) -> Result<Self, String> {
        json_decode(raw)
    }

    fn encode(&self) -> Result<String, String> {
        json_encode(self)
    }
}

pub struct OnDeckTracker {
    store: DocStore<Ledger>,
    entries: Ledger,
    seen_this_run: BTreeSet<String>,
}

impl OnDeckTracker {
    /// Open the ledger at `path`. A corrupt ledger is an error, never an
    /// empty start.
    pub fn open(path: impl Into<PathBuf>, lock: LockConfig) -> TierResult<Self> {
        let store = DocStore::new(path, lock);
        let entries = store.load()?;
        Ok(Self {
            store,
            entries,
            seen_this_run: BTreeSet::new(),
        })
    }

    pub fn ledger_path(&self) -> &std::path::Path {
        self.store.path()
    }

    pub fn entries(&self) -> &Ledger {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_entry(&self, path: &str) -> Option<&TrackedEntry> {
        self.entries.get(path)
    }

    pub fn seen_this_run(&self, path: &str) -> bool {
        self.seen_this_run.contains(path)
    }

    pub fn prepare_for_run(&mut self) -> TierResult<()> {
        self.seen_this_run.clear();
        let ((), ledger) = self.store.update(|ledger| {
            for entry in ledger.values_mut() {
                entry.users.clear();
                entry.ondeck_users.clear();
                entry.episode_info = None;
            }
            Ok(())
        })?;
        self.entries = ledger;
        Ok(())
    }

    pub fn update_entry(
        &mut self,
        path: &str,
        user: &str,
        episode_info: Option<EpisodeInfo>,
        is_current_ondeck: bool,
    ) -> TierResult<()> {
        self.update_entry_at(path, user, episode_info, is_current_ondeck, Utc::now())
    }

    pub fn update_entry_at(
        &mut self,
        path: &str,
        user: &str,
        episode_info: Option<EpisodeInfo>,
        is_current_ondeck: bool,
        now: DateTime<Utc>,
    ) -> TierResult<()> {
        let ((), ledger) = self.store.update(|ledger| {
            let entry = ledger.entry(path.to_string()).or_insert_with(|| TrackedEntry {
                first_seen: Some(now),
                ..TrackedEntry::default()
            });
            if entry.first_seen.is_none() {
                entry.first_seen = Some(now);
            }
            entry.last_seen = Some(now);
            if !entry.users.iter().any(|u| u == user) {
                entry.users.push(user.to_string());
            }
            if is_current_ondeck && !entry.ondeck_users.iter().any(|u| u == user) {
                entry.ondeck_users.push(user.to_string());
            }
            if let Some(info) = episode_info {
                entry.episode_info = Some(info);
            }
            Ok(())
        })?;
        self.entries = ledger;
        self.seen_this_run.insert(path.to_string());
        Ok(())
    }

    /// Remove every entry not refreshed since `prepare_for_run`.
    pub fn cleanup_unseen(&mut self) -> TierResult<usize> {
        let stale = self
            .entries
            .keys()
            .filter(|k| !self.seen_this_run.contains(*k))
            .cloned()
            .collect::<BTreeSet<_>>();
        if stale.is_empty() {
            return Ok(0);
        }

        let (removed, ledger) = self.store.update(|ledger| {
            let before = ledger.len();
            ledger.retain(|path, _| !stale.contains(path));
            Ok(before.saturating_sub(ledger.len()))
        })?;
        self.entries = ledger;
        tracing::info!(removed, "removed on-deck entries not reported this run");
        Ok(removed)
    }

    pub fn is_expired(&self, path: &str, retention_days: u64) -> bool {
        self.is_expired_at(path, retention_days, Utc::now())
    }

    /// Unknown paths, entries without `first_seen`, and a zero retention all
    /// resolve to "not expired".
    pub fn is_expired_at(&self, path: &str, retention_days: u64, now: DateTime<Utc>) -> bool {
        if retention_days == 0 {
            return false;
        }
        let Some(first_seen) = self.entries.get(path).and_then(|e| e.first_seen) else {
            return false;
        };
        let Ok(days) = i64::try_from(retention_days) else {
            return false;
        };
        let Some(window) = Duration::try_days(days) else {
            return false;
        };
        now.signed_duration_since(first_seen) > window
    }

    /// Paths whose retention has run out.
    pub fn expired_paths(&self, retention_days: u64, now: DateTime<Utc>) -> BTreeSet<String> {
        self.entries
            .keys()
            .filter(|path| self.is_expired_at(path, retention_days, now))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn backdate_first_seen(&mut self, path: &str, first_seen: Option<DateTime<Utc>>) {
        let ((), ledger) = self
            .store
            .update(|ledger| {
                if let Some(entry) = ledger.get_mut(path) {
                    entry.first_seen = first_seen;
                }
                Ok(())
            })
            .expect("backdate");
        self.entries = ledger;
    }
}
