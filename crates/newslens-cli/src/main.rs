use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newslens_analysis::load_keyword_groups;
use newslens_notify::{BarkSender, PushGate};
use newslens_pipeline::{AppConfig, Pipeline, RunOutput};
use newslens_report::HtmlReporter;
use newslens_storage::PartitionStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "newslens")]
#[command(about = "Ranked-news aggregation, keyword alerting and push notifications")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, analyze, store and (maybe) push once.
    Run,
    /// Keep running on the configured cron schedule.
    Schedule,
    /// Print storage statistics.
    Stats,
    /// Run the retention purge and exit.
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_once(cli.config).await,
        Commands::Schedule => run_scheduled(cli.config).await,
        Commands::Stats => print_stats(cli.config).await,
        Commands::Purge => purge(cli.config).await,
    }
}

async fn run_once(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    let tz = config.timezone()?;

    let keywords_path = config.keywords_path();
    let groups = if keywords_path.exists() {
        load_keyword_groups(&keywords_path)?
    } else {
        warn!(path = %keywords_path.display(), "keyword file missing, no groups loaded");
        Vec::new()
    };
    info!(groups = groups.len(), "keyword groups loaded");

    let reporter = HtmlReporter::new(config.report_dir(), tz);
    let gate = PushGate::new(config.storage.push_window.clone(), tz);
    let sender = BarkSender::new(config.notification.bark.clone())?;

    let pipeline = Pipeline::new(config, groups)?;
    let output = pipeline.run_once().await?;

    let report_path = reporter.generate(&output.results, &output.platform_counts, &output.stats)?;
    info!(report = %report_path.display(), "report written");

    dispatch(&gate, &sender, &output).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&output.summary).context("encoding run summary")?
    );
    Ok(())
}

/// Both consumers above saw the same results slice; the gate decides whether
/// this run also leaves the machine.
async fn dispatch(gate: &PushGate, sender: &BarkSender, output: &RunOutput) {
    let Some(payload) = gate.prepare_dispatch(
        &output.results,
        output.stats.today_items,
        chrono::Utc::now(),
    ) else {
        return;
    };
    if !sender.is_configured() {
        info!("push payload ready but bark is not configured, skipping");
        return;
    }
    // Best-effort: a failed push never fails the run.
    if let Err(err) = sender.send(&payload).await {
        warn!(error = %err, "bark push failed");
    }
}

async fn run_scheduled(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    let crons = config.schedule.crons.clone();
    drop(config);

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &crons {
        let path = config_path.clone();
        let job = Job::new_async(cron.as_str(), move |_id, _lock| {
            let path = path.clone();
            Box::pin(async move {
                if let Err(err) = run_once(path).await {
                    error!(error = %err, "scheduled run failed");
                }
            })
        })
        .with_context(|| format!("creating job for cron {cron:?}"))?;
        scheduler.add(job).await.context("adding scheduled job")?;
    }

    info!(jobs = crons.len(), "scheduler started, press ctrl-c to stop");
    scheduler.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

async fn print_stats(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    let store = PartitionStore::new(config.data_dir(), config.timezone()?);
    let stats = store.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats).context("encoding stats")?);
    Ok(())
}

async fn purge(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    let tz = config.timezone()?;
    if config.storage.retention_days == 0 {
        println!("retention disabled (retention_days = 0), nothing to purge");
        return Ok(());
    }
    let store = PartitionStore::new(config.data_dir(), tz);
    let today = chrono::Utc::now().with_timezone(&tz).date_naive();
    let cutoff = today
        .checked_sub_days(chrono::Days::new(u64::from(config.storage.retention_days)))
        .context("computing retention cutoff")?;
    let removed = store.purge_older_than(cutoff).await?;
    println!("removed {removed} expired partition(s) older than {cutoff}");
    Ok(())
}
