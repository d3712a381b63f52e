use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use plexcache_tier::tier::maintenance::Keep;
use std::path::PathBuf;

use crate::commands::{self, CommandReport};
use crate::commands::audit::AuditOptions;
use crate::commands::ondeck_run::OnDeckRunOptions;
use crate::commands::ondeck_show::OnDeckShowOptions;
use crate::commands::repair::{RepairKind, RepairOptions};
use crate::logging;

/// plexcache - two-tier media cache maintenance
#[derive(Parser, Debug)]
#[command(name = "plexcache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Print the report as JSON instead of key=value lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeepArg {
    Cache,
    Array,
}

impl From<KeepArg> for Keep {
    fn from(value: KeepArg) -> Self {
        match value {
            KeepArg::Cache => Keep::Cache,
            KeepArg::Array => Keep::Array,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show resolved paths, config, and store sizes
    Status,

    /// Refresh the on-deck ledger from a feed and move files between tiers
    OndeckRun {
        /// JSON array of {path, user, is_on_deck?, episode_info?}
        #[arg(long)]
        feed: PathBuf,

        /// Report planned moves without touching any file
        #[arg(long)]
        dry_run: bool,
    },

    /// List tracked on-deck entries, or one entry in detail
    OndeckShow { path: Option<String> },

    /// Full audit of both tiers against the tracking stores
    Audit {
        /// Ignore the cached result
        #[arg(long)]
        refresh: bool,
    },

    /// Anomaly counts only
    Health,

    /// Run a repair action (dry run unless --apply)
    Repair {
        #[arg(value_enum)]
        action: RepairKind,

        /// Paths to repair (cache, array, or share view)
        paths: Vec<String>,

        /// Target everything the audit reports for this action
        #[arg(long)]
        all: bool,

        /// Copy to keep for resolve_duplicate
        #[arg(long, value_enum)]
        keep: Option<KeepArg>,

        /// Execute instead of previewing
        #[arg(long)]
        apply: bool,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("command={} ok={}", report.command, report.ok);
    for line in &report.details {
        println!("{line}");
    }
    for line in &report.issues {
        println!("issue: {line}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let report = match cli.command {
        Command::Status => commands::status::run()?,
        Command::OndeckRun { feed, dry_run } => {
            commands::ondeck_run::run(&OnDeckRunOptions { feed, dry_run })?
        }
        Command::OndeckShow { path } => commands::ondeck_show::run(&OnDeckShowOptions { path })?,
        Command::Audit { refresh } => commands::audit::run(&AuditOptions { refresh })?,
        Command::Health => commands::health::run()?,
        Command::Repair {
            action,
            paths,
            all,
            keep,
            apply,
        } => commands::repair::run(&RepairOptions {
            kind: action,
            paths,
            all,
            keep: keep.map(Keep::from),
            apply,
        })?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
