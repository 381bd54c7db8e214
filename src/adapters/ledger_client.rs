use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::domain::{ExecutionReceipt, Proposal, ProposalId};
use crate::error::LedgerError;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// New-proposal notifications. At-least-once: ids may repeat and may race
/// the periodic sweep.
pub type ProposalStream = Pin<Box<dyn Stream<Item = ProposalId> + Send>>;

/// Read/write access to the ledger that owns the proposals.
///
/// Implementations report transport problems as [`LedgerError::Unavailable`]
/// and ledger-side refusals of an execution as
/// [`LedgerError::ExecutionRejected`]. Callers bound every call with their
/// own timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Proposals still awaiting execution
    async fn list_pending_proposals(&self) -> LedgerResult<Vec<Proposal>>;

    /// Current vote tally of a proposal
    async fn get_vote_count(&self, id: &ProposalId) -> LedgerResult<u128>;

    /// Submit the execution transaction and wait for its receipt
    async fn execute_proposal(&self, id: &ProposalId) -> LedgerResult<ExecutionReceipt>;

    /// Start receiving ids of newly created proposals
    async fn subscribe_new_proposals(&self) -> LedgerResult<ProposalStream>;
}
