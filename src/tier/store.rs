//! Persisted documents behind an advisory lock with atomic replacement.
//!
//! Every read-modify-write takes an exclusive `fs2` lock on a sibling
//! `<file>.lock`, reads the current document, applies the mutation, and
//! replaces the file through a temporary in the same directory. The data file
//! itself is never locked because each write swaps its inode.

use crate::error::{TierError, TierResult};
use crate::tier::config::LockConfig;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

/// A document that knows its on-disk encoding.
pub trait Document: Default {
    fn decode(raw: &str) -> Result<Self, String>;
    fn encode(&self) -> Result<String, String>;
}

pub fn json_decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|err| err.to_string())
}

pub fn json_encode<T: Serialize>(value: &T) -> Result<String, String> {
    let data = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    Ok(format!("{data}\n"))
}

/// Newline-delimited path list; blank lines and `#` comments are ignored.
impl Document for BTreeSet<String> {
    fn decode(raw: &str) -> Result<Self, String> {
        let mut out = BTreeSet::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.contains('\0') {
                return Err("path entry contains a NUL byte".to_string());
            }
            out.insert(trimmed.to_string());
        }
        Ok(out)
    }

    fn encode(&self) -> Result<String, String> {
        let mut out = String::new();
        for path in self {
            out.push_str(path);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Exclusive advisory lock; released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> TierResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| TierError::fs("create", parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|err| TierError::fs("open lock", path, err))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self { file });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock || is_contended(&err) => {
                    if started.elapsed() >= timeout {
                        return Err(TierError::LockTimeout {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        });
                    }
                    thread::sleep(poll);
                }
                Err(err) => return Err(TierError::fs("lock", path, err)),
            }
        }
    }

    /// Record who holds the lock, for operators inspecting a stuck run.
    pub fn write_owner(&mut self, payload: &serde_json::Value) {
        let _ = self.file.set_len(0);
        let _ = self.file.write_all(payload.to_string().as_bytes());
        let _ = self.file.sync_data();
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

#[derive(Debug, Clone)]
pub struct DocStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    lock: LockConfig,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Document> DocStore<T> {
    pub fn new(path: impl Into<PathBuf>, lock: LockConfig) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            lock,
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire(&self) -> TierResult<FileLock> {
        FileLock::acquire(
            &self.lock_path,
            self.lock.timeout(),
            self.lock.poll_interval(),
        )
    }

    pub fn load(&self) -> TierResult<T> {
        let _guard = self.acquire()?;
        self.read_unlocked()
    }

    /// Lock, read, mutate, write. Nothing is written when `apply` fails.
    pub fn update<R>(&self, apply: impl FnOnce(&mut T) -> TierResult<R>) -> TierResult<(R, T)> {
        let _guard = self.acquire()?;
        let mut doc = self.read_unlocked()?;
        let out = apply(&mut doc)?;
        self.write_unlocked(&doc)?;
        Ok((out, doc))
    }

    fn read_unlocked(&self) -> TierResult<T> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(err) => return Err(TierError::fs("read", &self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(T::default());
        }
        T::decode(&raw).map_err(|reason| TierError::CorruptState {
            path: self.path.clone(),
            reason,
        })
    }

    fn write_unlocked(&self, doc: &T) -> TierResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| TierError::fs("create", parent, err))?;

        let data = doc.encode().map_err(|reason| TierError::CorruptState {
            path: self.path.clone(),
            reason,
        })?;
        let mut temp =
            NamedTempFile::new_in(parent).map_err(|err| TierError::fs("create temp in", parent, err))?;
        temp.write_all(data.as_bytes())
            .map_err(|err| TierError::fs("write", temp.path().to_path_buf(), err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| TierError::fs("sync", temp.path().to_path_buf(), err))?;
        temp.persist(&self.path)
            .map_err(|err| TierError::fs("replace", &self.path, err.error))?;
        Ok(())
    }
}
