use clap::Parser;
use govwatch::cli::{Cli, Commands};
use govwatch::config::AppConfig;
use govwatch::coordination::{
    install_signal_handlers, GracefulShutdown, Scheduler, SchedulerSettings, ShutdownConfig,
    TriggerStatus,
};
use govwatch::domain::ExecutionStatus;
use govwatch::error::{GovError, Result};
use govwatch::services::{HealthServer, HealthState};
use std::sync::Arc;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{build_engine, build_ledger, init_logging};

/// Exit status for configuration the agent cannot start with
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command();

    let config = match AppConfig::load_from(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if command == Commands::CheckConfig {
        std::process::exit(check_config(&config));
    }

    if let Err(problems) = config.validate() {
        eprintln!("{}", GovError::InvalidConfig(problems));
        std::process::exit(EXIT_CONFIG);
    }

    init_logging(&config.logging);

    let result = match command {
        Commands::Run => run_agent(config).await,
        Commands::Sweep => run_single_sweep(config).await,
        Commands::Status => show_status(config).await,
        Commands::CheckConfig => Ok(()),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(if e.is_fatal_config() { EXIT_CONFIG } else { 1 });
    }
}

fn check_config(config: &AppConfig) -> i32 {
    for line in config.redacted_summary() {
        println!("{}", line);
    }
    match config.validate() {
        Ok(()) => {
            println!("\nConfiguration OK");
            0
        }
        Err(problems) => {
            println!("\nConfiguration invalid:");
            for problem in problems {
                println!("  - {}", problem);
            }
            EXIT_CONFIG
        }
    }
}

async fn run_agent(config: AppConfig) -> Result<()> {
    info!("Starting govwatch agent");

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
        drain_timeout: config.drain_timeout(),
        ..ShutdownConfig::default()
    }));
    install_signal_handlers(shutdown.clone());

    let engine = build_engine(&config).await?;
    let triggers = Arc::new(TriggerStatus::new());

    if let Some(port) = config.health_port {
        let server = HealthServer::new(
            Arc::new(HealthState::new(
                engine.clone(),
                triggers.clone(),
                config.sweep_interval(),
            )),
            port,
        );
        let token = shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("Health server stopped: {}", e);
            }
        });
    }

    let scheduler = Scheduler::new(
        engine.clone(),
        SchedulerSettings::from_config(&config),
        triggers,
    );
    let handle = scheduler.run(shutdown.token());

    let signal = shutdown.token().wait_for_shutdown().await;
    info!("Stopping agent ({} shutdown)", signal);

    let stopping = engine.clone();
    let flushing = engine.clone();
    match shutdown
        .execute(
            move || {
                Box::pin(async move {
                    stopping.stop_accepting();
                })
            },
            move || Box::pin(handle.join()),
            move || {
                Box::pin(async move {
                    flushing.ledger().flush().await.map_err(|e| e.to_string())
                })
            },
        )
        .await
    {
        Ok(report) if report.drained => info!("Agent stopped cleanly"),
        Ok(_) => warn!("Agent stopped before every in-flight execution finished"),
        Err(e) => error!("Shutdown incomplete: {}", e),
    }

    Ok(())
}

async fn run_single_sweep(config: AppConfig) -> Result<()> {
    let engine = build_engine(&config).await?;
    let report = engine.sweep().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    engine.ledger().flush().await
}

async fn show_status(config: AppConfig) -> Result<()> {
    if config.store.database_url.is_none() {
        println!("store.database_url is not set: the execution ledger is in-memory and only exists while the agent runs.");
        return Ok(());
    }

    let ledger = build_ledger(&config).await?;
    let stats = ledger.stats().await?;
    let entries = ledger.snapshot().await?;

    println!(
        "Execution ledger ({}): {} executed, {} failed, {} in flight",
        ledger.backend(),
        stats.executed,
        stats.failed,
        stats.in_flight
    );
    println!();
    println!("{:<24} {:<10} {:<26} DETAIL", "PROPOSAL", "STATUS", "UPDATED");
    for (id, entry) in entries {
        let detail = match &entry.status {
            ExecutionStatus::Attempted => "-".to_string(),
            ExecutionStatus::Executed { receipt } => match receipt.block_number {
                Some(block) => format!("{} (block {})", receipt.tx_hash, block),
                None => receipt.tx_hash.clone(),
            },
            ExecutionStatus::Failed { reason, sweep } => format!("sweep {}: {}", sweep, reason),
        };
        println!(
            "{:<24} {:<10} {:<26} {}",
            id.as_str(),
            entry.status.as_str(),
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            detail
        );
    }

    ledger.flush().await
}
