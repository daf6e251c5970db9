//! claw-alertd - Clawbernetes alert evaluation daemon
//!
//! Loads rule definitions from a config file, evaluates them on a schedule
//! against a samples file and drives the alert lifecycle until interrupted.

mod config;
mod evaluator;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use claw_alerting::{
    InFlightRegistry, LifecycleManager, MemoryAlertStore, MemoryRuleStore, Scheduler,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AlertdConfig;
use crate::evaluator::FileEvaluator;

const DEFAULT_CONFIG_PATH: &str = "/etc/claw-alertd/config.json";

#[derive(Parser)]
#[command(name = "claw-alertd")]
#[command(about = "Clawbernetes alert evaluation daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CLAW_ALERTD_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluation loop
    Run {
        /// Path to config file
        #[arg(short, long, env = "CLAW_ALERTD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate a config file and list its rules
    CheckConfig {
        /// Path to config file
        #[arg(short, long, env = "CLAW_ALERTD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Samples file the evaluator should read
        #[arg(long, default_value = "/var/lib/claw-alertd/samples.json")]
        samples: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run { config } => {
            run_daemon(config).await?;
        }

        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }

        Commands::InitConfig { output, samples } => {
            init_config(&output, samples)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("claw_alertd=info,claw_alerting=info"))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting claw-alertd");

    let config = AlertdConfig::from_file(&config_path)?;
    info!(
        rules = config.rules.len(),
        samples = %config.samples_path.display(),
        tick_interval_secs = config.scheduler.tick_interval_secs,
        "loaded config"
    );

    let rules = Arc::new(MemoryRuleStore::new());
    for rule in config.build_rules()? {
        rules.save(rule)?;
    }

    let alerts = Arc::new(MemoryAlertStore::new());
    let lifecycle = Arc::new(
        LifecycleManager::new(alerts).with_conflict_retries(config.scheduler.conflict_retries),
    );
    lifecycle.load()?;

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        rules,
        lifecycle,
        Arc::new(FileEvaluator::new(&config.samples_path)),
        InFlightRegistry::new(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, initiating shutdown");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    scheduler.run(shutdown_rx).await;
    info!("claw-alertd stopped");
    Ok(())
}

fn check_config(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = AlertdConfig::from_file(config_path)?;

    println!("Config {} is valid", config_path.display());
    println!("  samples:  {}", config.samples_path.display());
    println!("  tick:     {}s", config.scheduler.tick_interval_secs);
    println!("  timeout:  {}s", config.scheduler.evaluation_timeout_secs);
    println!("  workers:  {}", config.scheduler.max_concurrent_evaluations);
    println!();
    for rule in config.build_rules()? {
        let recovery = rule
            .recovery_threshold
            .map(|r| format!(" (recovers at {r})"))
            .unwrap_or_default();
        println!(
            "  {:<24} {} {} {}{} every {}s, for {}s [{}]",
            rule.id,
            rule.expression,
            rule.operator,
            rule.threshold,
            recovery,
            rule.interval_secs,
            rule.for_duration_secs,
            if rule.is_schedulable() { "active" } else { "inactive" },
        );
    }
    Ok(())
}

fn init_config(output: &PathBuf, samples: PathBuf) -> anyhow::Result<()> {
    let config = AlertdConfig::sample(samples);
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Point samples_path at your collector's output, then run:");
    println!("  claw-alertd run --config {}", output.display());

    Ok(())
}
