use crate::tier::layout::TierPaths;
use crate::tier::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub const JOURNAL_FILE: &str = "maintenance.log";

#[derive(Debug, Clone, Serialize)]
pub struct JournalEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn journal_path(paths: &TierPaths) -> PathBuf {
    paths.logs_dir.join(JOURNAL_FILE)
}

/// Append one JSON line describing an executed run or repair.
pub fn append_event(paths: &TierPaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = JournalEvent {
        at_epoch_secs: now_epoch_secs(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = journal_path(paths);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Journal failures never fail the operation being journaled.
pub fn record(paths: &TierPaths, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, phase, status, message) {
        tracing::warn!(error = %format!("{err:#}"), phase, "failed to append journal event");
    }
}
