//! Trigger scheduler
//!
//! Drives the two callers of [`ExecutionEngine::process`]: a fixed-interval
//! sweep of every pending proposal and a subscription to new-proposal events.
//! A third task logs a periodic heartbeat.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::coordination::shutdown::ShutdownToken;
use crate::domain::Trigger;
use crate::execution::{ExecutionEngine, Outcome};

/// Scheduler timing and concurrency settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Concurrent event-path executions
    pub max_concurrent: usize,
    /// Resubscribe delay grows by this much per failed attempt
    pub resubscribe_base: Duration,
    pub resubscribe_cap: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            max_concurrent: config.scheduler.max_concurrent_executions,
            ..Self::default()
        }
    }

    /// Linear backoff capped at `resubscribe_cap`
    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        self.resubscribe_base
            .saturating_mul(attempt.max(1))
            .min(self.resubscribe_cap)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(3600),
            max_concurrent: 4,
            resubscribe_base: Duration::from_secs(1),
            resubscribe_cap: Duration::from_secs(60),
        }
    }
}

/// Trigger state shared with the health endpoint
#[derive(Debug, Default)]
pub struct TriggerStatus {
    subscription_connected: AtomicBool,
    events_received: AtomicU64,
    resubscribes: AtomicU64,
    last_sweep_at: RwLock<Option<DateTime<Utc>>>,
}

impl TriggerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscription_connected(&self) -> bool {
        self.subscription_connected.load(Ordering::SeqCst)
    }

    pub fn set_subscription_connected(&self, connected: bool) {
        self.subscription_connected.store(connected, Ordering::SeqCst);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn resubscribes(&self) -> u64 {
        self.resubscribes.load(Ordering::Relaxed)
    }

    pub async fn last_sweep_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sweep_at.read().await
    }

    pub async fn record_sweep(&self) {
        *self.last_sweep_at.write().await = Some(Utc::now());
    }
}

/// Running scheduler tasks
pub struct SchedulerHandle {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SchedulerHandle {
    /// Wait for every trigger task, including in-flight event executions.
    /// Returns `false` if any task panicked.
    pub async fn join(self) -> bool {
        let mut clean = true;
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task {} ended abnormally: {}", name, e);
                clean = false;
            }
        }
        clean
    }
}

pub struct Scheduler {
    engine: Arc<ExecutionEngine>,
    settings: SchedulerSettings,
    status: Arc<TriggerStatus>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        settings: SchedulerSettings,
        status: Arc<TriggerStatus>,
    ) -> Self {
        Self {
            engine,
            settings,
            status,
        }
    }

    pub fn status(&self) -> Arc<TriggerStatus> {
        self.status.clone()
    }

    /// Start the subscription, sweep and heartbeat tasks.
    ///
    /// The first sweep waits until the first subscription attempt finished,
    /// so proposals created during startup are seen by at least one trigger.
    pub fn run(&self, shutdown: ShutdownToken) -> SchedulerHandle {
        let first_subscription = Arc::new(Notify::new());

        let events = tokio::spawn(event_loop(
            self.engine.clone(),
            self.settings.clone(),
            self.status.clone(),
            first_subscription.clone(),
            shutdown.clone(),
        ));
        let sweeps = tokio::spawn(sweep_loop(
            self.engine.clone(),
            self.settings.sweep_interval,
            self.status.clone(),
            first_subscription,
            shutdown.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.engine.clone(),
            self.settings.heartbeat_interval,
            self.status.clone(),
            shutdown,
        ));

        info!(
            "Scheduler started (sweep every {:?}, {} concurrent event executions)",
            self.settings.sweep_interval, self.settings.max_concurrent
        );

        SchedulerHandle {
            tasks: vec![("events", events), ("sweeps", sweeps), ("heartbeat", heartbeat)],
        }
    }
}

async fn sweep_loop(
    engine: Arc<ExecutionEngine>,
    sweep_interval: Duration,
    status: Arc<TriggerStatus>,
    first_subscription: Arc<Notify>,
    mut shutdown: ShutdownToken,
) {
    tokio::select! {
        _ = shutdown.wait_for_shutdown() => return,
        _ = first_subscription.notified() => {}
    }

    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => {
                debug!("Sweep timer stopped");
                break;
            }
            _ = ticker.tick() => {
                // Runs to completion even if shutdown arrives meanwhile
                let report = engine.sweep().await;
                if !report.skipped {
                    status.record_sweep().await;
                }
            }
        }
    }
}

async fn event_loop(
    engine: Arc<ExecutionEngine>,
    settings: SchedulerSettings,
    status: Arc<TriggerStatus>,
    first_subscription: Arc<Notify>,
    mut shutdown: ShutdownToken,
) {
    let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
    let mut in_flight: JoinSet<Outcome> = JoinSet::new();
    let mut attempt: u32 = 0;
    let mut released_sweeps = false;

    'subscribe: while !shutdown.is_shutdown_requested() {
        let subscribed = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break 'subscribe,
            result = engine.subscribe() => result,
        };

        if !released_sweeps {
            first_subscription.notify_one();
            released_sweeps = true;
        }

        match subscribed {
            Ok(mut stream) => {
                status.set_subscription_connected(true);
                attempt = 0;
                info!("Subscribed to new-proposal events");

                loop {
                    tokio::select! {
                        _ = shutdown.wait_for_shutdown() => {
                            status.set_subscription_connected(false);
                            break 'subscribe;
                        }
                        Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                            log_event_result(finished);
                        }
                        next = stream.next() => {
                            let Some(id) = next else {
                                warn!("New-proposal stream ended");
                                status.set_subscription_connected(false);
                                break;
                            };

                            status.events_received.fetch_add(1, Ordering::Relaxed);
                            info!(proposal_id = %id, trigger = %Trigger::Event, "New proposal observed");

                            let permit = tokio::select! {
                                _ = shutdown.wait_for_shutdown() => {
                                    status.set_subscription_connected(false);
                                    break 'subscribe;
                                }
                                permit = permits.clone().acquire_owned() => permit,
                            };
                            let Ok(permit) = permit else {
                                break 'subscribe;
                            };

                            let engine = engine.clone();
                            in_flight.spawn(async move {
                                let _permit = permit;
                                engine.process(&id, Trigger::Event).await
                            });
                        }
                    }
                }
            }
            Err(e) => {
                status.set_subscription_connected(false);
                warn!(error = %e, "Subscription to new-proposal events failed");
            }
        }

        attempt = attempt.saturating_add(1);
        status.resubscribes.fetch_add(1, Ordering::Relaxed);
        let delay = settings.resubscribe_delay(attempt);
        info!("Resubscribing in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break 'subscribe,
            _ = sleep(delay) => {}
        }
    }

    if !released_sweeps {
        first_subscription.notify_one();
    }

    if !in_flight.is_empty() {
        info!("Waiting for {} in-flight event execution(s)", in_flight.len());
    }
    while let Some(finished) = in_flight.join_next().await {
        log_event_result(finished);
    }
    debug!("Event subscription stopped");
}

fn log_event_result(finished: Result<Outcome, tokio::task::JoinError>) {
    match finished {
        Ok(outcome) => debug!(outcome = outcome.as_str(), "Event execution finished"),
        Err(e) => error!("Event execution task failed: {}", e),
    }
}

async fn heartbeat_loop(
    engine: Arc<ExecutionEngine>,
    every: Duration,
    status: Arc<TriggerStatus>,
    mut shutdown: ShutdownToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick is immediate; the first heartbeat comes one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = ticker.tick() => {
                match engine.ledger().stats().await {
                    Ok(stats) => info!(
                        executed = stats.executed,
                        failed = stats.failed,
                        in_flight = stats.in_flight,
                        sweep = engine.current_generation(),
                        subscription_connected = status.is_subscription_connected(),
                        events_received = status.events_received(),
                        "Agent heartbeat"
                    ),
                    Err(e) => warn!(error = %e, "Agent heartbeat (ledger stats unavailable)"),
                }
            }
        }
    }
}
