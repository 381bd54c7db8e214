//! Execution engine
//!
//! One idempotent operation, [`ExecutionEngine::process`], shared by the
//! periodic sweep and the event fast path. Every failure is handled here and
//! reported as an [`Outcome`]; nothing propagates to the caller.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::adapters::{LedgerClient, ProposalStream};
use crate::domain::{Eligibility, ExecutionReceipt, ProposalId, Trigger};
use crate::error::LedgerError;
use crate::execution::eligibility;
use crate::execution::ledger::ExecutionLedger;

/// Rejection reasons meaning the proposal was executed by someone else.
/// Matched case-insensitively.
const ALREADY_EXECUTED_MARKERS: &[&str] = &[
    "already executed",
    "proposal executed",
    "state: executed",
    "governorunexpectedproposalstate",
];

/// Whether a ledger rejection says the action already happened
pub fn is_already_executed(reason: &str) -> bool {
    let lowered = reason.to_ascii_lowercase();
    ALREADY_EXECUTED_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum tally for execution
    pub quorum: u128,
    /// Upper bound for each ledger call; expiry counts as unavailable
    pub call_timeout: Duration,
    /// Proposals processed concurrently within one sweep
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quorum: 1,
            call_timeout: Duration::from_secs(30),
            max_concurrent: 4,
        }
    }
}

/// What happened to one proposal id on one trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Ledger already records the id as executed
    AlreadyExecuted,
    /// Below quorum; stays pending
    NotEligible { vote_count: u128, missing: u128 },
    /// The other trigger path holds or finished the claim
    ClaimedElsewhere,
    /// Submitted and confirmed
    Executed(ExecutionReceipt),
    /// Ledger said it was already executed elsewhere; recorded as executed
    AbsorbedAsExecuted(String),
    /// Genuine rejection; recorded as failed for this sweep generation
    Rejected(String),
    /// Transient problem; left unclaimed for the next trigger
    Deferred(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::AlreadyExecuted => "already_executed",
            Outcome::NotEligible { .. } => "not_eligible",
            Outcome::ClaimedElsewhere => "claimed_elsewhere",
            Outcome::Executed(_) => "executed",
            Outcome::AbsorbedAsExecuted(_) => "absorbed_as_executed",
            Outcome::Rejected(_) => "rejected",
            Outcome::Deferred(_) => "deferred",
        }
    }

    /// Whether this trigger caused an execution to be recorded
    pub fn recorded_execution(&self) -> bool {
        matches!(self, Outcome::Executed(_) | Outcome::AbsorbedAsExecuted(_))
    }
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub pending: usize,
    pub executed: usize,
    pub absorbed: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub not_eligible: usize,
    pub already_executed: usize,
    pub claimed_elsewhere: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing_error: Option<String>,
    /// A previous sweep was still running
    pub skipped: bool,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::AlreadyExecuted => self.already_executed += 1,
            Outcome::NotEligible { .. } => self.not_eligible += 1,
            Outcome::ClaimedElsewhere => self.claimed_elsewhere += 1,
            Outcome::Executed(_) => self.executed += 1,
            Outcome::AbsorbedAsExecuted(_) => self.absorbed += 1,
            Outcome::Rejected(_) => self.rejected += 1,
            Outcome::Deferred(_) => self.deferred += 1,
        }
    }
}

/// Evaluates proposals and executes the eligible ones at most once
pub struct ExecutionEngine {
    client: Arc<dyn LedgerClient>,
    ledger: Arc<dyn ExecutionLedger>,
    config: EngineConfig,
    sweep_generation: AtomicU64,
    sweep_guard: Mutex<()>,
    accepting: AtomicBool,
    last_sweep: RwLock<Option<SweepReport>>,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<dyn LedgerClient>,
        ledger: Arc<dyn ExecutionLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            config,
            sweep_generation: AtomicU64::new(0),
            sweep_guard: Mutex::new(()),
            accepting: AtomicBool::new(true),
            last_sweep: RwLock::new(None),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn ExecutionLedger> {
        &self.ledger
    }

    pub fn current_generation(&self) -> u64 {
        self.sweep_generation.load(Ordering::SeqCst)
    }

    pub async fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep.read().await.clone()
    }

    /// Stop claiming new proposals. Executions already past their claim run
    /// to completion.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("Execution engine no longer accepting new claims");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Run a ledger call under the configured timeout
    async fn bounded<T, F>(&self, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Unavailable(format!(
                "ledger call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    /// Open the new-proposal subscription (bounded like every ledger call)
    pub async fn subscribe(&self) -> Result<ProposalStream, LedgerError> {
        self.bounded(self.client.subscribe_new_proposals()).await
    }

    /// Evaluate one proposal and execute it if eligible and unclaimed
    pub async fn process(&self, id: &ProposalId, trigger: Trigger) -> Outcome {
        // 1. Already handled?
        match self.ledger.has_executed(id).await {
            Ok(true) => {
                debug!(proposal_id = %id, %trigger, "Proposal already executed, skipping");
                return Outcome::AlreadyExecuted;
            }
            Ok(false) => {}
            Err(e) => {
                error!(proposal_id = %id, %trigger, error = %e, "Execution ledger lookup failed");
                return Outcome::Deferred(e.to_string());
            }
        }

        // 2. Fresh tally against quorum
        let vote_count = match self.bounded(self.client.get_vote_count(id)).await {
            Ok(votes) => votes,
            Err(e) => {
                warn!(proposal_id = %id, %trigger, error = %e, "Ledger read failed");
                return Outcome::Deferred(e.to_string());
            }
        };

        if let Eligibility::NotYetEligible { missing } =
            eligibility::evaluate(vote_count, self.config.quorum)
        {
            debug!(
                proposal_id = %id,
                %trigger,
                vote_count,
                quorum = self.config.quorum,
                missing,
                "Proposal below quorum"
            );
            return Outcome::NotEligible {
                vote_count,
                missing,
            };
        }

        if !self.is_accepting() {
            debug!(proposal_id = %id, %trigger, "Shutting down, not claiming proposal");
            return Outcome::Deferred("shutting down".to_string());
        }

        // 3. Claim
        let sweep = self.current_generation();
        match self.ledger.mark_attempted(id, sweep).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(proposal_id = %id, %trigger, "Proposal claimed by another trigger");
                return Outcome::ClaimedElsewhere;
            }
            Err(e) => {
                error!(proposal_id = %id, %trigger, error = %e, "Failed to claim proposal");
                return Outcome::Deferred(e.to_string());
            }
        }

        info!(
            proposal_id = %id,
            %trigger,
            vote_count,
            quorum = self.config.quorum,
            "Executing proposal"
        );

        // 4. Submit
        match self.bounded(self.client.execute_proposal(id)).await {
            Ok(receipt) => {
                self.record_executed(id, &receipt).await;
                info!(
                    proposal_id = %id,
                    %trigger,
                    tx_hash = %receipt.tx_hash,
                    block_number = ?receipt.block_number,
                    "Proposal executed"
                );
                Outcome::Executed(receipt)
            }
            Err(LedgerError::ExecutionRejected(reason)) if is_already_executed(&reason) => {
                let receipt = ExecutionReceipt::executed_elsewhere(&reason);
                self.record_executed(id, &receipt).await;
                info!(
                    proposal_id = %id,
                    %trigger,
                    %reason,
                    "Proposal already executed on ledger, recorded as executed"
                );
                Outcome::AbsorbedAsExecuted(reason)
            }
            Err(LedgerError::ExecutionRejected(reason)) => {
                // Sweeps may have started during submission; the failure
                // belongs to the newest one so it waits for the next.
                let sweep = self.current_generation().max(sweep);
                if let Err(e) = self.ledger.mark_failed(id, &reason, sweep).await {
                    error!(proposal_id = %id, error = %e, "Failed to record rejection; claim kept");
                }
                warn!(
                    proposal_id = %id,
                    %trigger,
                    %reason,
                    sweep,
                    "Proposal execution failed"
                );
                Outcome::Rejected(reason)
            }
            Err(e) => {
                if let Err(release_err) = self.ledger.release(id).await {
                    error!(
                        proposal_id = %id,
                        error = %release_err,
                        "Failed to release claim; proposal held until restart"
                    );
                }
                warn!(
                    proposal_id = %id,
                    %trigger,
                    error = %e,
                    "Ledger unavailable during execution, will retry on next trigger"
                );
                Outcome::Deferred(e.to_string())
            }
        }
    }

    async fn record_executed(&self, id: &ProposalId, receipt: &ExecutionReceipt) {
        if let Err(e) = self.ledger.mark_executed(id, receipt).await {
            // Keep the claim so this process never resubmits.
            error!(
                proposal_id = %id,
                tx_hash = %receipt.tx_hash,
                error = %e,
                "Executed on ledger but failed to record locally"
            );
        }
    }

    /// Evaluate every pending proposal once.
    ///
    /// Sweeps are serialized: a call made while another sweep runs returns a
    /// report marked `skipped` without touching the ledger.
    pub async fn sweep(&self) -> SweepReport {
        let Ok(_guard) = self.sweep_guard.try_lock() else {
            warn!("Previous sweep still running, skipping this one");
            return SweepReport::skipped();
        };

        let generation = self.sweep_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let mut report = SweepReport {
            generation,
            started_at: Some(Utc::now()),
            ..SweepReport::default()
        };

        debug!(sweep = generation, "Sweep started");

        match self.bounded(self.client.list_pending_proposals()).await {
            Ok(proposals) => {
                let mut seen = HashSet::new();
                let ids: Vec<ProposalId> = proposals
                    .into_iter()
                    .map(|p| p.id)
                    .filter(|id| seen.insert(id.clone()))
                    .collect();
                report.pending = ids.len();

                for id in &ids {
                    debug!(proposal_id = %id, sweep = generation, "Pending proposal listed");
                }

                let outcomes: Vec<Outcome> = futures::stream::iter(ids)
                    .map(|id| async move { self.process(&id, Trigger::Sweep).await })
                    .buffer_unordered(self.config.max_concurrent.max(1))
                    .collect()
                    .await;

                for outcome in &outcomes {
                    report.record(outcome);
                }
            }
            Err(e) => {
                warn!(sweep = generation, error = %e, "Ledger read failed while listing pending proposals");
                report.listing_error = Some(e.to_string());
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            sweep = generation,
            pending = report.pending,
            executed = report.executed,
            absorbed = report.absorbed,
            rejected = report.rejected,
            deferred = report.deferred,
            not_eligible = report.not_eligible,
            duration_ms = report.duration_ms,
            "Sweep complete"
        );

        *self.last_sweep.write().await = Some(report.clone());
        report
    }
}
