use crate::error::TierError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

include!(concat!(env!("OUT_DIR"), "/plexcache_env_allowlist.rs"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days an on-deck entry stays cache-eligible after it was first seen.
    /// Zero disables expiry.
    pub ondeck_retention_days: u64,
    pub evict_untracked: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ondeck_retention_days: 0,
            evict_untracked: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub cache_ttl_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    Size,
    Sha256,
}

impl VerifyMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "size" => Some(Self::Size),
            "sha256" | "hash" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Sha256 => "sha256",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MoverConfig {
    pub verify: VerifyMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub tolerance_secs: u64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self { tolerance_secs: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TierConfig {
    pub retention: RetentionConfig,
    pub audit: AuditConfig,
    pub lock: LockConfig,
    pub mover: MoverConfig,
    pub timestamps: TimestampConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTierConfig {
    retention: Option<RetentionConfig>,
    audit: Option<AuditConfig>,
    lock: Option<LockConfig>,
    mover: Option<MoverConfig>,
    timestamps: Option<TimestampConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_verify(var: &str, fallback: VerifyMode) -> VerifyMode {
    match env::var(var) {
        Ok(v) => VerifyMode::parse(&v).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

pub fn validate(cfg: &TierConfig) -> Result<(), TierError> {
    if cfg.audit.cache_ttl_secs == 0 {
        return Err(TierError::Config(
            "invalid audit cache ttl: must be >= 1 second".to_string(),
        ));
    }
    if cfg.lock.poll_interval_ms == 0 {
        return Err(TierError::Config(
            "invalid lock poll interval: must be >= 1 ms".to_string(),
        ));
    }
    if cfg.lock.poll_interval_ms > cfg.lock.timeout_secs.saturating_mul(1000).max(1) {
        return Err(TierError::Config(
            "invalid lock settings: poll interval exceeds timeout".to_string(),
        ));
    }
    if cfg.retention.ondeck_retention_days > 36_500 {
        return Err(TierError::Config(
            "invalid ondeck retention: use 0 to disable, or at most 36500 days".to_string(),
        ));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("PLEXCACHE_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    if let Ok(home) = env::var("PLEXCACHE_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed).join("plexcache.toml"));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join("plexcache").join("plexcache.toml"))
}

fn merge_file_config(base: &mut TierConfig) -> Result<(), TierError> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .map_err(|err| TierError::Config(format!("failed to read {}: {err}", path.display())))?;
    let parsed: PartialTierConfig = toml::from_str(&raw).map_err(|err| {
        TierError::Config(format!(
            "failed to parse plexcache config {}: {err}",
            path.display()
        ))
    })?;
    if let Some(retention) = parsed.retention {
        base.retention = retention;
    }
    if let Some(audit) = parsed.audit {
        base.audit = audit;
    }
    if let Some(lock) = parsed.lock {
        base.lock = lock;
    }
    if let Some(mover) = parsed.mover {
        base.mover = mover;
    }
    if let Some(timestamps) = parsed.timestamps {
        base.timestamps = timestamps;
    }
    Ok(())
}

pub fn load_config() -> Result<TierConfig, TierError> {
    let mut cfg = TierConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.retention.ondeck_retention_days = env_or_u64(
        "PLEXCACHE_ONDECK_RETENTION_DAYS",
        cfg.retention.ondeck_retention_days,
    );
    cfg.retention.evict_untracked =
        env_or_bool("PLEXCACHE_EVICT_UNTRACKED", cfg.retention.evict_untracked);
    cfg.audit.cache_ttl_secs =
        env_or_u64("PLEXCACHE_AUDIT_CACHE_TTL_SECS", cfg.audit.cache_ttl_secs);
    cfg.lock.timeout_secs = env_or_u64("PLEXCACHE_LOCK_TIMEOUT_SECS", cfg.lock.timeout_secs);
    cfg.lock.poll_interval_ms =
        env_or_u64("PLEXCACHE_LOCK_POLL_INTERVAL_MS", cfg.lock.poll_interval_ms);
    cfg.mover.verify = env_or_verify("PLEXCACHE_VERIFY_MODE", cfg.mover.verify);
    cfg.timestamps.tolerance_secs = env_or_u64(
        "PLEXCACHE_TIMESTAMP_TOLERANCE_SECS",
        cfg.timestamps.tolerance_secs,
    );

    validate(&cfg)?;
    Ok(cfg)
}

/// `PLEXCACHE_*` variables present in the environment that no code reads.
pub fn unknown_env_keys() -> Vec<String> {
    let known = GENERATED_PLEXCACHE_ENV_ALLOWLIST
        .iter()
        .copied()
        .collect::<BTreeSet<_>>();
    env::vars()
        .map(|(k, _)| k)
        .filter(|k| k.starts_with("PLEXCACHE_") && !known.contains(k.as_str()))
        .collect()
}
