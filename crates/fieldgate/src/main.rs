mod logging;
mod supervisor;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use supervisor::Supervisor;
use telemetry::AgentConfig;

/// fieldgate is an industrial data-acquisition agent: it subscribes to OPC UA
/// servers, records every value change into MongoDB, and falls back to local
/// files whenever the store is unreachable, replaying them once it recovers.
#[derive(Debug, Parser)]
#[clap(author, name = "fieldgate", version)]
struct Fieldgate {
    #[clap(flatten)]
    log_args: logging::LogArgs,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Run the agent until interrupted.
    Run(ConfigArgs),
    /// Validate a configuration snapshot and probe the primary store and
    /// fallback directory, without acquiring anything.
    Check(ConfigArgs),
}

#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// Path to the JSON configuration snapshot.
    #[clap(long = "config", env = "FIELDGATE_CONFIG")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Fieldgate::parse();
    logging::init_logging(&cli.log_args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    let result = match cli.subcommand {
        Subcommand::Run(args) => runtime.block_on(run(args)),
        Subcommand::Check(args) => runtime.block_on(check(args)),
    };
    if let Err(err) = result.as_ref() {
        tracing::error!(error = ?err, "fieldgate failed");
    }
    result
}

async fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let supervisor = Supervisor::start(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the interrupt signal")?;
    tracing::info!("interrupt received");
    supervisor.stop().await;

    let snapshot = supervisor.snapshot().await;
    tracing::info!(
        persisted = snapshot.persisted_total,
        dropped = snapshot.dropped_total,
        lost = snapshot.lost_total,
        "final totals"
    );
    Ok(())
}

async fn check(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let probe = persistence::MongoProbe::connect(
        &config.mongo_uri,
        &config.mongo_database,
        config.health_probe_timeout(),
    )
    .await
    .context("failed to build the health probe client")?;
    let monitor = persistence::HealthMonitor::new(
        probe,
        config.health_interval(),
        config.health_probe_timeout(),
        config.health_failure_threshold,
        config.degraded_latency(),
    );
    let health = monitor.check_now().await;

    let fallback = persistence::FallbackSink::new(config.fallback_dir())
        .context("failed to prepare the fallback directory")?;
    let fallback_ok = fallback.health_check().await.is_ok();
    let pending = fallback.list_pending().await?.len();

    let report = serde_json::json!({
        "config": "ok",
        "servers": config.servers.len(),
        "primaryHealth": health,
        "fallbackWritable": fallback_ok,
        "pendingFiles": pending,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    anyhow::ensure!(
        health == persistence::Health::Healthy && fallback_ok,
        "connectivity check failed"
    );
    Ok(())
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<AgentConfig> {
    AgentConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))
}
