use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the ledger handed back for an accepted execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub tx_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl ExecutionReceipt {
    pub fn new(tx_hash: impl Into<String>, block_number: Option<u64>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            block_number,
        }
    }

    /// Receipt recorded when the ledger reports the proposal was already
    /// executed by someone else.
    pub fn executed_elsewhere(reason: &str) -> Self {
        Self {
            tx_hash: format!("external: {}", reason),
            block_number: None,
        }
    }
}

/// Local execution status of a proposal id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed by a trigger; submission in flight (or interrupted by a crash)
    Attempted,
    /// The ledger confirmed the action happened
    Executed { receipt: ExecutionReceipt },
    /// Genuine rejection; eligible again from the next sweep generation
    Failed { reason: String, sweep: u64 },
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Attempted => "attempted",
            ExecutionStatus::Executed { .. } => "executed",
            ExecutionStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_executed(&self) -> bool {
        matches!(self, ExecutionStatus::Executed { .. })
    }

    /// Whether a trigger running in sweep generation `sweep` may claim an id
    /// currently in this state.
    pub fn claimable_in(&self, sweep: u64) -> bool {
        match self {
            ExecutionStatus::Failed { sweep: failed_in, .. } => *failed_in < sweep,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub status: ExecutionStatus,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
        }
    }
}

/// Which path asked the engine to look at a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Sweep,
    Event,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Sweep => write!(f, "sweep"),
            Trigger::Event => write!(f, "event"),
        }
    }
}
