use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("{path}: {reason}")]
    Validation { path: String, reason: String },
    #[error("failed to {op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lock {} still held after {}s", path.display(), waited.as_secs())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("state file {} is corrupt: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },
    #[error("config invalid or unreadable: {0}")]
    Config(String),
}

impl TierError {
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> TierErrorCode {
        match self {
            Self::LockTimeout { .. } => TierErrorCode::E001LockTimeout,
            Self::CorruptState { .. } => TierErrorCode::E002CorruptState,
            Self::Filesystem { .. } => TierErrorCode::E003Filesystem,
            Self::Validation { .. } => TierErrorCode::E004Validation,
            Self::Config(_) => TierErrorCode::E005ConfigInvalid,
        }
    }
}

pub type TierResult<T> = Result<T, TierError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierErrorCode {
    E001LockTimeout,
    E002CorruptState,
    E003Filesystem,
    E004Validation,
    E005ConfigInvalid,
}

impl TierErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001LockTimeout => "E001_LOCK_TIMEOUT",
            Self::E002CorruptState => "E002_CORRUPT_STATE",
            Self::E003Filesystem => "E003_FILESYSTEM",
            Self::E004Validation => "E004_VALIDATION",
            Self::E005ConfigInvalid => "E005_CONFIG_INVALID",
        }
    }
}
