//! Health check HTTP server
//!
//! Liveness and status probes for process supervision.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::coordination::{ShutdownToken, TriggerStatus};
use crate::error::{GovError, Result};
use crate::execution::{ExecutionEngine, LedgerStats, SweepReport};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_sweep: Option<SweepReport>,
    pub subscription_connected: bool,
    pub ledger: Option<LedgerStats>,
    pub ledger_backend: &'static str,
}

/// Shared state for health server
pub struct HealthState {
    /// When the agent started
    pub started_at: DateTime<Utc>,
    /// Configured sweep interval; no sweep within two of these is degraded
    pub sweep_interval: Duration,
    engine: Arc<ExecutionEngine>,
    triggers: Arc<TriggerStatus>,
}

impl HealthState {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        triggers: Arc<TriggerStatus>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            started_at: Utc::now(),
            sweep_interval,
            engine,
            triggers,
        }
    }

    /// Whether the last sweep is older than two sweep intervals
    fn is_sweep_stale(&self, last_sweep_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.sweep_interval.saturating_mul(2))
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let since = last_sweep_at.unwrap_or(self.started_at);
        now - since > window
    }

    pub async fn get_health(&self) -> HealthResponse {
        let now = Utc::now();
        let last_sweep_at = self.triggers.last_sweep_at().await;
        let subscription_connected = self.triggers.is_subscription_connected();

        let ledger = match self.engine.ledger().stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Health check could not read ledger stats");
                None
            }
        };

        let status = if subscription_connected && !self.is_sweep_stale(last_sweep_at, now) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthResponse {
            status,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            last_sweep_at,
            last_sweep: self.engine.last_sweep().await,
            subscription_connected,
            ledger,
            ledger_backend: self.engine.ledger().backend(),
        }
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Serve until shutdown is requested
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.wait_for_shutdown().await;
            })
            .await
            .map_err(|e| GovError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .with_state(state)
}

/// Full health check; degraded still answers 200
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.get_health().await))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}
