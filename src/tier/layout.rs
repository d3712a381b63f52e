use anyhow::Result;
use std::env;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Suffix appended to an array file to mark it as the preserved original of
/// a cache-tier copy.
pub const BACKUP_SUFFIX: &str = ".plexcached";

pub const LEDGER_FILE: &str = "ondeck_tracker.json";
pub const EXCLUDE_FILE: &str = "plexcache_mover_files_to_exclude.txt";
pub const TIMESTAMPS_FILE: &str = "plexcache_timestamps.json";
pub const RUN_LOCK_FILE: &str = "ondeck.run.lock";

#[derive(Debug, Clone)]
pub struct TierPaths {
    pub home: PathBuf,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub cache_root: PathBuf,
    pub array_root: PathBuf,
    pub share_root: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<TierPaths> {
    let home = required_home_dir()?;
    let plexcache_home = env_or_default_path("PLEXCACHE_HOME", home.join("plexcache"));

    let data_dir = env_or_default_path("PLEXCACHE_DATA_DIR", plexcache_home.join("data"));
    let logs_dir = env_or_default_path("PLEXCACHE_LOGS_DIR", plexcache_home.join("logs"));
    let cache_root = env_or_default_path("PLEXCACHE_CACHE_DIR", PathBuf::from("/mnt/cache"));
    let array_root = env_or_default_path("PLEXCACHE_ARRAY_DIR", PathBuf::from("/mnt/user0"));
    let share_root = env_or_default_path("PLEXCACHE_SHARE_DIR", PathBuf::from("/mnt/user"));

    Ok(TierPaths {
        home: plexcache_home,
        data_dir,
        logs_dir,
        cache_root,
        array_root,
        share_root,
    })
}

impl TierPaths {
    /// Layout rooted in a single directory; used by tests and embedders.
    pub fn under(root: &Path) -> Self {
        Self {
            home: root.to_path_buf(),
            data_dir: root.join("data"),
            logs_dir: root.join("logs"),
            cache_root: root.join("cache"),
            array_root: root.join("array"),
            share_root: root.join("share"),
        }
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    pub fn exclude_file(&self) -> PathBuf {
        self.data_dir.join(EXCLUDE_FILE)
    }

    pub fn timestamps_file(&self) -> PathBuf {
        self.data_dir.join(TIMESTAMPS_FILE)
    }

    pub fn run_lock_file(&self) -> PathBuf {
        self.data_dir.join(RUN_LOCK_FILE)
    }

    /// Strip whichever tier root (cache, array, or share view) the path lives
    /// under. Backup markers map to the path they preserve. Remainders that
    /// could climb out of the tier (`..`, absolute parts) are refused.
    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        for root in [&self.cache_root, &self.array_root, &self.share_root] {
            if let Ok(rel) = path.strip_prefix(root) {
                if !is_contained(rel) {
                    return None;
                }
                return Some(strip_backup_suffix(rel));
            }
        }
        None
    }

    pub fn relative_str(&self, path: &str) -> Option<PathBuf> {
        self.relative(Path::new(path))
    }

    pub fn cache_path(&self, rel: &Path) -> PathBuf {
        self.cache_root.join(rel)
    }

    pub fn array_path(&self, rel: &Path) -> PathBuf {
        self.array_root.join(rel)
    }

    pub fn backup_path(&self, rel: &Path) -> PathBuf {
        with_backup_suffix(&self.array_root.join(rel))
    }

    /// Canonical key used by the exclude store, the timestamp store and every
    /// maintenance report: the absolute cache-tier path.
    pub fn cache_key(&self, rel: &Path) -> String {
        self.cache_path(rel).display().to_string()
    }
}

/// True for a non-empty path made only of plain names, so joining it onto a
/// tier root stays inside that root.
pub fn is_contained(rel: &Path) -> bool {
    let mut components = rel.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

pub fn is_backup_marker(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(BACKUP_SUFFIX) && n.len() > BACKUP_SUFFIX.len())
}

pub fn with_backup_suffix(path: &Path) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(BACKUP_SUFFIX);
    PathBuf::from(raw)
}

pub fn strip_backup_suffix(path: &Path) -> PathBuf {
    if !is_backup_marker(path) {
        return path.to_path_buf();
    }
    let raw = path.to_string_lossy();
    PathBuf::from(&raw[..raw.len() - BACKUP_SUFFIX.len()])
}
