//! Strata - partition-tracked lakehouse orchestration CLI
//!
//! ## Commands
//!
//! - `reconcile`: run one backfill pass per domain
//! - `diff`: show partitions missing from a domain's manifest
//! - `manifest`: print a domain's manifest
//! - `reset` / `reset-failed`: manifest recovery
//! - `trigger` / `tick`: drive the scheduling cascade by hand
//! - `maintain`: compact and expire table versions
//! - `graph` / `runs`: inspect assets and run history

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use strata_core::reconciler::{diff, KeyOutcome, PassReport};
use strata_core::{
    local_today, AssetId, Domain, RetentionWindow, Runtime, StrataConfig, TriggerOutcome,
};
use strata_state::{FsManifestStore, ManifestStore, PartitionKey, RunRegistry};
use tracing::Level;

#[derive(Parser)]
#[command(name = "strata")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Partition-tracked backfill and medallion scheduling", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "STRATA_CONFIG", default_value = "strata.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration and print the asset graph summary
    Validate,

    /// Run one reconciliation pass
    Reconcile {
        /// Only this domain (default: every configured domain)
        #[arg(short, long)]
        domain: Option<Domain>,

        /// Reconcile as of this date instead of the local today
        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// List partitions in the window that are not committed
    Diff {
        #[arg(short, long)]
        domain: Domain,

        #[arg(long)]
        today: Option<NaiveDate>,
    },

    /// Print a domain's manifest as JSON
    Manifest {
        #[arg(short, long)]
        domain: Domain,
    },

    /// Forget every manifest entry so the next pass replays the window
    Reset {
        #[arg(short, long)]
        domain: Domain,

        /// Required: the reset cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Return quarantined partitions to pending
    ResetFailed {
        #[arg(short, long)]
        domain: Domain,
    },

    /// Trigger an asset for one partition date and wait for the cascade
    Trigger {
        /// Asset id, e.g. bronze/screen_time/raw
        asset: AssetId,

        /// Partition date (YYYY-MM-DD)
        date: NaiveDate,

        /// Return after the trigger without waiting for runs to finish
        #[arg(long)]
        no_wait: bool,
    },

    /// Evaluate cron schedules once and run whatever is due
    Tick,

    /// Compact tables and expire old versions
    Maintain {
        /// Only this table
        #[arg(short, long)]
        table: Option<AssetId>,

        /// Override the configured retention
        #[arg(long)]
        retention_hours: Option<u32>,
    },

    /// Show assets by dependency level
    Graph,

    /// Show recorded runs, newest first
    Runs {
        #[arg(short, long)]
        asset: Option<AssetId>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    strata_core::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => cmd_validate(&config),
        Commands::Reconcile { domain, today } => cmd_reconcile(config, domain, today).await,
        Commands::Diff { domain, today } => cmd_diff(&config, &domain, today).await,
        Commands::Manifest { domain } => cmd_manifest(&config, &domain).await,
        Commands::Reset { domain, yes } => cmd_reset(config, &domain, yes).await,
        Commands::ResetFailed { domain } => cmd_reset_failed(config, &domain).await,
        Commands::Trigger {
            asset,
            date,
            no_wait,
        } => cmd_trigger(config, &asset, date, no_wait).await,
        Commands::Tick => cmd_tick(config).await,
        Commands::Maintain {
            table,
            retention_hours,
        } => cmd_maintain(config, table, retention_hours).await,
        Commands::Graph => cmd_graph(&config),
        Commands::Runs { asset, limit } => cmd_runs(config, asset, limit).await,
    }
}

fn load_config(path: &Path) -> Result<StrataConfig> {
    StrataConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn runtime(config: StrataConfig) -> Result<Runtime> {
    Runtime::build(config)
        .await
        .context("Failed to initialise Strata runtime")
}

fn cmd_validate(config: &StrataConfig) -> Result<()> {
    let graph = config.asset_graph()?;
    println!("Configuration OK");
    println!("Domains: {}", config.domains.len());
    println!(
        "Assets:  {} ({} cron roots)",
        graph.len(),
        graph.roots().count()
    );
    Ok(())
}

async fn cmd_reconcile(
    config: StrataConfig,
    domain: Option<Domain>,
    today: Option<NaiveDate>,
) -> Result<()> {
    let rt = runtime(config).await?;
    let reconciler = rt.reconciler();

    let targets: Vec<_> = match &domain {
        Some(d) => vec![reconciler
            .domain(d)
            .with_context(|| format!("Domain '{d}' is not configured"))?],
        None => reconciler.domains().collect(),
    };

    let mut failed = false;
    for r in targets {
        let day = today.unwrap_or_else(|| r.today());
        match r.run_pass(day).await {
            Ok(report) => {
                print_pass(&report);
                failed |= report.process.aborted.is_some();
            }
            Err(e) => {
                eprintln!("{}: pass failed: {e}", r.domain());
                failed = true;
            }
        }
    }
    if failed {
        bail!("reconciliation did not complete cleanly");
    }
    Ok(())
}

fn print_pass(report: &PassReport) {
    println!(
        "[{}] window {}..={}  missing {}  committed {}  failed {}",
        report.domain,
        report.floor,
        report.ceiling,
        report.missing,
        report.process.committed().len(),
        report.process.failures()
    );
    for (key, outcome) in &report.process.outcomes {
        match outcome {
            KeyOutcome::Committed { records } => println!("  ok       {} ({records} records)", key.date),
            KeyOutcome::Retrying { attempt, error } => {
                println!("  retry    {} attempt {attempt}: {error}", key.date)
            }
            KeyOutcome::Failed { attempts, error } => {
                println!("  FAILED   {} after {attempts} attempts: {error}", key.date)
            }
            KeyOutcome::Quarantined => println!("  skipped  {} (quarantined)", key.date),
            KeyOutcome::Skipped => println!("  skipped  {} (pass aborted)", key.date),
        }
    }
    for key in &report.lost {
        println!("  LOST     {} aged out of the window uncommitted", key.date);
    }
    if let Some(reason) = &report.process.aborted {
        println!("  aborted: {reason}");
    }
}

async fn cmd_diff(config: &StrataConfig, domain: &Domain, today: Option<NaiveDate>) -> Result<()> {
    let dc = config
        .domain(domain)
        .with_context(|| format!("Domain '{domain}' is not configured"))?;
    let today = today.unwrap_or_else(|| local_today(config.reconciler_settings(dc).utc_offset));
    let window = RetentionWindow::ending_at(domain.clone(), today, dc.window_days, dc.lag_days);

    let store = FsManifestStore::open(config.state.manifest_dir())?;
    let manifest = store.load(domain).await?;
    let missing = diff(&manifest, &window);

    println!(
        "{domain}: window {}..={}, {} missing",
        window.floor(),
        window.ceiling(),
        missing.len()
    );
    for key in missing {
        let status = manifest
            .entries
            .get(&key.date)
            .map(|e| format!("{:?} ({} attempts)", e.status, e.attempt_count).to_lowercase())
            .unwrap_or_else(|| "never attempted".to_string());
        println!("  {}  {status}", key.date);
    }
    Ok(())
}

async fn cmd_manifest(config: &StrataConfig, domain: &Domain) -> Result<()> {
    let store = FsManifestStore::open(config.state.manifest_dir())?;
    let manifest = store.load(domain).await?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn cmd_reset(config: StrataConfig, domain: &Domain, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to reset the manifest for '{domain}' without --yes");
    }
    let rt = runtime(config).await?;
    let r = rt
        .reconciler()
        .domain(domain)
        .with_context(|| format!("Domain '{domain}' is not configured"))?;
    let cleared = r.full_reset().await?;
    println!("Cleared {cleared} manifest entries for {domain}");
    Ok(())
}

async fn cmd_reset_failed(config: StrataConfig, domain: &Domain) -> Result<()> {
    let rt = runtime(config).await?;
    let r = rt
        .reconciler()
        .domain(domain)
        .with_context(|| format!("Domain '{domain}' is not configured"))?;
    let reset = r.reset_failed().await?;
    if reset.is_empty() {
        println!("No failed partitions for {domain}");
    }
    for date in reset {
        println!("Reset {date}");
    }
    Ok(())
}

async fn cmd_trigger(config: StrataConfig, asset: &AssetId, date: NaiveDate, no_wait: bool) -> Result<()> {
    let rt = runtime(config).await?;
    let partition = PartitionKey::new(asset.domain.clone(), date);
    let outcome = rt.scheduler().trigger(asset, &partition).await?;
    match &outcome {
        TriggerOutcome::Started(run) => println!("Started run {} for {asset} {date}", run.run_id),
        TriggerOutcome::AlreadyActive(run) => {
            println!("Run {} is already active for {asset} {date}", run.run_id)
        }
        TriggerOutcome::Waiting { upstream } => {
            println!("Waiting: {upstream} has not succeeded for {date}")
        }
    }
    if !no_wait {
        rt.scheduler().drain().await;
        print_runs(&rt, None, usize::MAX, Some(date)).await?;
    }
    Ok(())
}

async fn cmd_tick(config: StrataConfig) -> Result<()> {
    let rt = runtime(config).await?;
    let fired = rt.scheduler().tick(Utc::now()).await;
    if fired.is_empty() {
        println!("Nothing due");
        return Ok(());
    }
    for t in &fired {
        match &t.outcome {
            Ok(o) => println!("{} @ {} -> {}: {o:?}", t.asset, t.scheduled_for, t.partition),
            Err(e) => println!("{} @ {} -> {}: error: {e}", t.asset, t.scheduled_for, t.partition),
        }
    }
    rt.scheduler().drain().await;
    Ok(())
}

#[derive(Serialize)]
struct MaintainRow {
    table: String,
    files_before: usize,
    files_after: usize,
    versions_removed: usize,
}

async fn cmd_maintain(
    config: StrataConfig,
    table: Option<AssetId>,
    retention_hours: Option<u32>,
) -> Result<()> {
    let rt = runtime(config).await?;
    let job = rt.maintenance();
    let hours = retention_hours.unwrap_or(job.settings().retention_hours);

    let (maintained, failed) = match table {
        Some(t) => (vec![job.maintain_table(&t, hours, Utc::now()).await?], Vec::new()),
        None if retention_hours.is_some() => {
            let mut done = Vec::new();
            let mut failed = Vec::new();
            for t in job.targets().await? {
                match job.maintain_table(&t, hours, Utc::now()).await {
                    Ok(m) => done.push(m),
                    Err(e) => failed.push((t, e.to_string())),
                }
            }
            (done, failed)
        }
        None => {
            let report = job.run_once(Utc::now()).await?;
            (report.maintained, report.failed)
        }
    };

    let rows: Vec<MaintainRow> = maintained
        .iter()
        .map(|m| MaintainRow {
            table: m.compact.table.to_string(),
            files_before: m.compact.files_before,
            files_after: m.compact.files_after,
            versions_removed: m.expire.versions_removed,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    for (t, e) in &failed {
        eprintln!("{t}: {e}");
    }
    if !failed.is_empty() {
        bail!("{} table(s) failed maintenance", failed.len());
    }
    Ok(())
}

fn cmd_graph(config: &StrataConfig) -> Result<()> {
    let graph = config.asset_graph()?;
    for (i, level) in graph.levels()?.iter().enumerate() {
        println!("level {i}:");
        for id in level {
            let Ok(node) = graph.get(id) else { continue };
            if node.upstream.is_empty() {
                println!("  {id}");
            } else {
                let ups: Vec<String> = node.upstream.iter().map(ToString::to_string).collect();
                println!("  {id} <- {}", ups.join(", "));
            }
        }
    }
    Ok(())
}

async fn cmd_runs(config: StrataConfig, asset: Option<AssetId>, limit: usize) -> Result<()> {
    let rt = runtime(config).await?;
    print_runs(&rt, asset.as_ref(), limit, None).await
}

async fn print_runs(
    rt: &Runtime,
    asset: Option<&AssetId>,
    limit: usize,
    date: Option<NaiveDate>,
) -> Result<()> {
    let runs = rt.scheduler().registry().list(asset).await?;
    let runs: Vec<_> = runs
        .into_iter()
        .filter(|r| date.map_or(true, |d| r.partition.date == d))
        .take(limit)
        .collect();
    if runs.is_empty() {
        println!("No runs recorded");
    }
    for r in runs {
        println!(
            "{:<9} {}  {}  attempt {}  {}{}",
            r.state.as_str(),
            r.asset,
            r.partition.date,
            r.attempt,
            r.run_id,
            r.error.map(|e| format!("  ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_trigger() {
        let cli = Cli::try_parse_from([
            "strata",
            "--config",
            "x.toml",
            "trigger",
            "bronze/screen_time/raw",
            "2024-05-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Trigger { asset, date, no_wait } => {
                assert_eq!(asset.to_string(), "bronze/screen_time/raw");
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
                assert!(!no_wait);
            }
            _ => panic!("expected trigger"),
        }
    }

    #[test]
    fn cli_rejects_bad_domain() {
        assert!(Cli::try_parse_from(["strata", "diff", "--domain", "Screen Time"]).is_err());
    }

    #[test]
    fn reset_requires_confirmation() {
        let cli = Cli::try_parse_from(["strata", "reset", "--domain", "location"]).unwrap();
        assert!(matches!(cli.command, Commands::Reset { yes: false, .. }));
    }
}
