pub mod audit;
pub mod health;
pub mod ondeck_run;
pub mod ondeck_show;
pub mod repair;
pub mod status;

use anyhow::{Context, Result};
use plexcache_tier::tier::config::load_config;
use plexcache_tier::tier::layout::resolve_paths;
use plexcache_tier::tier::maintenance::{ActionSummary, MaintenanceService};
use plexcache_tier::tier::mover::{OutcomeStatus, PathOutcome};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn attach(&mut self, data: &impl Serialize) -> Result<()> {
        self.data = Some(serde_json::to_value(data).context("failed to encode command data")?);
        Ok(())
    }
}

pub fn open_service() -> Result<MaintenanceService> {
    let paths = resolve_paths()?;
    let config = load_config().context("failed to load plexcache config")?;
    Ok(MaintenanceService::new(paths, config))
}

/// One line per path; failures also become issues.
pub fn report_outcomes(report: &mut CommandReport, label: &str, outcomes: &[PathOutcome]) {
    for outcome in outcomes {
        let action = serde_json::to_value(outcome.action_taken)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        match outcome.status {
            OutcomeStatus::Done => {
                report.detail(format!("{label}.done path={} action={action}", outcome.path));
            }
            OutcomeStatus::Skipped => report.detail(format!(
                "{label}.skipped path={} reason={}",
                outcome.path,
                outcome.reason_if_skipped.as_deref().unwrap_or("-")
            )),
            OutcomeStatus::Failed => report.issue(format!(
                "{label}.failed path={} reason={}",
                outcome.path,
                outcome.reason_if_skipped.as_deref().unwrap_or("-")
            )),
        }
    }
}

pub fn report_summary(report: &mut CommandReport, summary: &ActionSummary) {
    report.detail(format!(
        "summary fixed={} skipped={} failed={}",
        summary.fixed, summary.skipped, summary.failed
    ));
}
