//! Graceful Shutdown Handler
//!
//! Coordinates an ordered stop: triggers first, then in-flight executions are
//! awaited (never aborted), then the execution ledger is flushed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub type PhaseFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown (SIGQUIT) - shortened drain
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight executions (default: 120s)
    pub drain_timeout: Duration,
    /// Drain budget after an urgent signal (default: 10s)
    pub urgent_drain_timeout: Duration,
    /// Time to wait for the ledger flush (default: 30s)
    pub flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(120),
            urgent_drain_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(30),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Sweep timer and subscription stopping, no new claims
    StoppingTriggers,
    /// Waiting for claimed executions to finish
    DrainingExecutions,
    /// Making the execution ledger durable
    FlushingLedger,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingTriggers => write!(f, "stopping_triggers"),
            ShutdownPhase::DrainingExecutions => write!(f, "draining_executions"),
            ShutdownPhase::FlushingLedger => write!(f, "flushing_ledger"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Result of a completed shutdown sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight execution finished within the drain budget
    pub drained: bool,
    pub elapsed: Duration,
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    phase: watch::Sender<ShutdownPhase>,
    signal: watch::Sender<Option<ShutdownSignal>>,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal, _) = watch::channel(None);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            phase,
            signal,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Get current shutdown phase
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal.send_replace(Some(signal));
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence:
    /// 1. Stop the triggers and new claims
    /// 2. Await in-flight executions (bounded by the drain timeout)
    /// 3. Flush the execution ledger
    ///
    /// `drain` resolves to `true` when everything finished cleanly.
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_triggers: F1,
        drain: F2,
        flush_ledger: F3,
    ) -> Result<ShutdownReport, ShutdownError>
    where
        F1: FnOnce() -> PhaseFuture<()>,
        F2: FnOnce() -> PhaseFuture<bool>,
        F3: FnOnce() -> PhaseFuture<Result<(), String>>,
    {
        let start = Instant::now();
        let signal = (*self.signal.borrow()).unwrap_or(ShutdownSignal::Graceful);
        let drain_timeout = match signal {
            ShutdownSignal::Graceful => self.config.drain_timeout,
            ShutdownSignal::Urgent => self.config.urgent_drain_timeout,
        };

        info!("Starting {} shutdown (drain timeout: {:?})", signal, drain_timeout);

        // Phase 1: Stop triggers
        self.set_phase(ShutdownPhase::StoppingTriggers);
        stop_triggers().await;
        debug!("Triggers stopped");

        // Phase 2: Drain in-flight executions
        self.set_phase(ShutdownPhase::DrainingExecutions);
        let drained = match tokio::time::timeout(drain_timeout, drain()).await {
            Ok(true) => {
                info!("All in-flight executions drained");
                true
            }
            Ok(false) => {
                warn!("Some executions did not complete cleanly during drain");
                false
            }
            Err(_) => {
                warn!(
                    "Execution drain timeout after {:?}, proceeding anyway",
                    drain_timeout
                );
                false
            }
        };

        // Phase 3: Flush ledger
        self.set_phase(ShutdownPhase::FlushingLedger);
        let flushed = match tokio::time::timeout(self.config.flush_timeout, flush_ledger()).await {
            Ok(Ok(())) => {
                debug!("Execution ledger flushed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Execution ledger flush failed: {}", e);
                Err(ShutdownError::LedgerFlush(e))
            }
            Err(_) => {
                error!(
                    "Execution ledger flush timeout after {:?}",
                    self.config.flush_timeout
                );
                Err(ShutdownError::Timeout)
            }
        };

        self.set_phase(ShutdownPhase::Complete);

        let elapsed = start.elapsed();
        info!("Graceful shutdown completed in {:?}", elapsed);

        flushed.map(|()| ShutdownReport { drained, elapsed })
    }

    /// Create a token that can be used to observe shutdown in async tasks
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal.subscribe(),
        }
    }
}

/// Token for observing shutdown in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Wait for shutdown signal. Resolves immediately if already requested.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator dropped
                return ShutdownSignal::Urgent;
            }
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Ledger flush timed out
    Timeout,
    /// Ledger flush failed
    LedgerFlush(String),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::LedgerFlush(e) => write!(f, "ledger flush failed: {}", e),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, requested) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(requested);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                return;
            }
            info!("Received Ctrl+C");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Urgent.to_string(), "urgent");
    }

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::StoppingTriggers.to_string(), "stopping_triggers");
        assert_eq!(
            ShutdownPhase::DrainingExecutions.to_string(),
            "draining_executions"
        );
        assert_eq!(ShutdownPhase::FlushingLedger.to_string(), "flushing_ledger");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let token = shutdown.token();

        assert!(!shutdown.is_shutdown_requested());
        assert!(!token.is_shutdown_requested());
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Running);

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        assert!(shutdown.is_shutdown_requested());
        assert!(token.is_shutdown_requested());

        // Duplicate request should be ignored
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        let mut late = shutdown.token();
        assert_eq!(late.wait_for_shutdown().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let report = shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        o1.lock().unwrap().push("stop");
                    })
                },
                move || {
                    Box::pin(async move {
                        o2.lock().unwrap().push("drain");
                        true
                    })
                },
                move || {
                    Box::pin(async move {
                        o3.lock().unwrap().push("flush");
                        Ok(())
                    })
                },
            )
            .await
            .unwrap();

        assert!(report.drained);
        assert_eq!(*order.lock().unwrap(), vec!["stop", "drain", "flush"]);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_still_flushes() {
        let shutdown = GracefulShutdown::new(ShutdownConfig {
            drain_timeout: Duration::from_secs(1),
            ..ShutdownConfig::default()
        });

        let report = shutdown
            .execute(
                || Box::pin(async {}),
                || {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        true
                    })
                },
                || Box::pin(async { Ok(()) }),
            )
            .await
            .unwrap();

        assert!(!report.drained);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_flush_failure_reported() {
        let shutdown = GracefulShutdown::with_defaults();
        let result = shutdown
            .execute(
                || Box::pin(async {}),
                || Box::pin(async { true }),
                || Box::pin(async { Err("pool closed".to_string()) }),
            )
            .await;

        assert_eq!(
            result,
            Err(ShutdownError::LedgerFlush("pool closed".to_string()))
        );
    }
}
