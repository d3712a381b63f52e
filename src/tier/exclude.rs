use crate::error::TierResult;
use crate::tier::config::LockConfig;
use crate::tier::store::DocStore;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Cache-tier paths the array mover must leave alone. Stored as one path per
/// line so the mover can read the file directly.
#[derive(Debug, Clone)]
pub struct ExcludeStore {
    store: DocStore<BTreeSet<String>>,
}

impl ExcludeStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockConfig) -> Self {
        Self {
            store: DocStore::new(path, lock),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn paths(&self) -> TierResult<BTreeSet<String>> {
        self.store.load()
    }

    pub fn contains(&self, path: &str) -> TierResult<bool> {
        Ok(self.paths()?.contains(path))
    }

    /// Returns how many of `paths` were newly added.
    pub fn add<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> TierResult<usize> {
        let paths = paths.into_iter().map(str::to_string).collect::<Vec<_>>();
        let (added, _) = self.store.update(|set| {
            let mut added = 0usize;
            for path in paths {
                if set.insert(path) {
                    added += 1;
                }
            }
            Ok(added)
        })?;
        Ok(added)
    }

    pub fn remove<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> TierResult<usize> {
        let paths = paths.into_iter().collect::<BTreeSet<_>>();
        let (removed, _) = self.store.update(|set| {
            let before = set.len();
            set.retain(|p| !paths.contains(p.as_str()));
            Ok(before.saturating_sub(set.len()))
        })?;
        Ok(removed)
    }
}
