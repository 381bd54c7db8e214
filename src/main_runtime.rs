use govwatch::adapters::{GovernorRpcClient, PostgresStore};
use govwatch::config::{AppConfig, LoggingConfig};
use govwatch::error::Result;
use govwatch::execution::{
    EngineConfig, ExecutionEngine, ExecutionLedger, InMemoryLedger, PostgresLedger,
};
use govwatch::signing::Wallet;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer};

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn,hyper=warn", logging.level))
    });

    let log_dir = std::env::var("GOVWATCH_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/govwatch".to_string());

    // `rolling::daily` panics if it cannot create the first file, so check
    // that the directory is writable first.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".govwatch_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "govwatch.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Long-running process; keep the writer alive for its lifetime
                Box::leak(Box::new(guard));

                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true);
                Some(if logging.json {
                    layer.json().boxed()
                } else {
                    layer.boxed()
                })
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let console_layer = if logging.json {
        console_layer.json().boxed()
    } else {
        console_layer.boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/govwatch.log", log_dir);
    }
}

/// Persistent ledger when a database is configured, in-memory otherwise
pub async fn build_ledger(config: &AppConfig) -> Result<Arc<dyn ExecutionLedger>> {
    match config.store.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::new(url, config.store.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(PostgresLedger::new(store)))
        }
        None => {
            warn!("store.database_url not set; execution ledger is in-memory and lost on restart");
            Ok(Arc::new(InMemoryLedger::new()))
        }
    }
}

/// Connect the ledger client, open the execution ledger and recover state
/// left by a previous run.
pub async fn build_engine(config: &AppConfig) -> Result<Arc<ExecutionEngine>> {
    let wallet = Wallet::from_signer_key(&config.ledger.signer_key)?;
    let client = GovernorRpcClient::connect(
        &config.ledger.rpc_url,
        &config.ledger.governor_address,
        &wallet,
    )?;

    let ledger = build_ledger(config).await?;
    let recovery = ledger.recover().await?;
    if !recovery.released_in_flight.is_empty() || recovery.reset_failed > 0 {
        info!(
            "Recovered execution ledger: {} indeterminate claim(s) released, {} failure(s) eligible for retry",
            recovery.released_in_flight.len(),
            recovery.reset_failed
        );
    }

    info!(
        "Execution engine ready (quorum={}, ledger={}, signer={})",
        config.governance.quorum,
        ledger.backend(),
        wallet.address()
    );

    Ok(Arc::new(ExecutionEngine::new(
        Arc::new(client),
        ledger,
        EngineConfig {
            quorum: config.governance.quorum,
            call_timeout: config.call_timeout(),
            max_concurrent: config.scheduler.max_concurrent_executions,
        },
    )))
}
