//! Execution ledger
//!
//! Local record of which proposal ids this agent has claimed, executed or
//! seen rejected. The claim (`mark_attempted`) is the single point of mutual
//! exclusion between the sweep path and the event path.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::domain::{ExecutionReceipt, ExecutionStatus, LedgerEntry, ProposalId};
use crate::error::Result;

/// Entry counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub executed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

/// What startup recovery changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Claims left `attempted` by a previous run, now released. The outcome
    /// of their submission is unknown.
    pub released_in_flight: Vec<ProposalId>,
    /// Failed entries from previous runs made claimable again
    pub reset_failed: u64,
}

#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    /// True once the ledger confirmed the action for `id`
    async fn has_executed(&self, id: &ProposalId) -> Result<bool>;

    /// Atomically claim `id` for submission in sweep generation `sweep`.
    ///
    /// Succeeds when there is no entry, or a `Failed` entry from an earlier
    /// generation. Returns `false` when another trigger holds or finished it.
    async fn mark_attempted(&self, id: &ProposalId, sweep: u64) -> Result<bool>;

    /// Record a confirmed execution. Only called after the client succeeded.
    async fn mark_executed(&self, id: &ProposalId, receipt: &ExecutionReceipt) -> Result<()>;

    /// Record a genuine rejection in generation `sweep`
    async fn mark_failed(&self, id: &ProposalId, reason: &str, sweep: u64) -> Result<()>;

    /// Drop an `Attempted` claim after a transient failure
    async fn release(&self, id: &ProposalId) -> Result<()>;

    async fn entry(&self, id: &ProposalId) -> Result<Option<LedgerEntry>>;

    /// All entries, ordered by proposal id
    async fn snapshot(&self) -> Result<Vec<(ProposalId, LedgerEntry)>>;

    async fn stats(&self) -> Result<LedgerStats>;

    /// Startup recovery of state left by a previous run
    async fn recover(&self) -> Result<RecoveryReport>;

    /// Make pending writes durable before exit
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

/// Process-local ledger. Lost on restart; the remote ledger's duplicate
/// rejection is the backstop.
#[derive(Default)]
pub struct InMemoryLedger {
    entries: DashMap<ProposalId, LedgerEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn has_executed(&self, id: &ProposalId) -> Result<bool> {
        Ok(self
            .entries
            .get(id)
            .map(|entry| entry.status.is_executed())
            .unwrap_or(false))
    }

    async fn mark_attempted(&self, id: &ProposalId, sweep: u64) -> Result<bool> {
        match self.entries.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(LedgerEntry::new(ExecutionStatus::Attempted));
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().status.claimable_in(sweep) {
                    occupied.insert(LedgerEntry::new(ExecutionStatus::Attempted));
                    Ok(true)
                } else {
                    debug!(
                        "Claim refused for proposal {} ({})",
                        id,
                        occupied.get().status
                    );
                    Ok(false)
                }
            }
        }
    }

    async fn mark_executed(&self, id: &ProposalId, receipt: &ExecutionReceipt) -> Result<()> {
        self.entries.insert(
            id.clone(),
            LedgerEntry::new(ExecutionStatus::Executed {
                receipt: receipt.clone(),
            }),
        );
        Ok(())
    }

    async fn mark_failed(&self, id: &ProposalId, reason: &str, sweep: u64) -> Result<()> {
        let failed = LedgerEntry::new(ExecutionStatus::Failed {
            reason: reason.to_string(),
            sweep,
        });
        match self.entries.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(failed);
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().status.is_executed() {
                    debug!("Ignoring failure for already executed proposal {}", id);
                } else {
                    occupied.insert(failed);
                }
            }
        }
        Ok(())
    }

    async fn release(&self, id: &ProposalId) -> Result<()> {
        self.entries
            .remove_if(id, |_, entry| entry.status == ExecutionStatus::Attempted);
        Ok(())
    }

    async fn entry(&self, id: &ProposalId) -> Result<Option<LedgerEntry>> {
        Ok(self.entries.get(id).map(|entry| entry.value().clone()))
    }

    async fn snapshot(&self) -> Result<Vec<(ProposalId, LedgerEntry)>> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats::default();
        for item in self.entries.iter() {
            match item.value().status {
                ExecutionStatus::Attempted => stats.in_flight += 1,
                ExecutionStatus::Executed { .. } => stats.executed += 1,
                ExecutionStatus::Failed { .. } => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        // Nothing survives a restart in memory.
        Ok(RecoveryReport::default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u64) -> ProposalId {
        ProposalId::from(n)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let ledger = InMemoryLedger::new();

        assert!(ledger.mark_attempted(&id(1), 1).await.unwrap());
        assert!(!ledger.mark_attempted(&id(1), 1).await.unwrap());
        assert!(!ledger.mark_attempted(&id(1), 2).await.unwrap());
        assert!(!ledger.has_executed(&id(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.mark_attempted(&id(7), 1).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_executed_is_final() {
        let ledger = InMemoryLedger::new();
        let receipt = ExecutionReceipt::new("0xabc", Some(10));

        assert!(ledger.mark_attempted(&id(2), 1).await.unwrap());
        ledger.mark_executed(&id(2), &receipt).await.unwrap();

        assert!(ledger.has_executed(&id(2)).await.unwrap());
        assert!(!ledger.mark_attempted(&id(2), 99).await.unwrap());

        // Release never drops a finished entry
        ledger.release(&id(2)).await.unwrap();
        assert!(ledger.has_executed(&id(2)).await.unwrap());

        // Nor does a late failure report
        ledger.mark_failed(&id(2), "reverted", 3).await.unwrap();
        assert!(ledger.has_executed(&id(2)).await.unwrap());
        assert_eq!(
            ledger.entry(&id(2)).await.unwrap().unwrap().status,
            ExecutionStatus::Executed { receipt }
        );
    }

    #[tokio::test]
    async fn test_failed_reclaimable_next_generation_only() {
        let ledger = InMemoryLedger::new();

        assert!(ledger.mark_attempted(&id(3), 4).await.unwrap());
        ledger.mark_failed(&id(3), "quorum not reached", 4).await.unwrap();

        assert!(!ledger.mark_attempted(&id(3), 4).await.unwrap());
        assert!(ledger.mark_attempted(&id(3), 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_removes_claim() {
        let ledger = InMemoryLedger::new();

        assert!(ledger.mark_attempted(&id(4), 1).await.unwrap());
        ledger.release(&id(4)).await.unwrap();

        assert!(ledger.entry(&id(4)).await.unwrap().is_none());
        assert!(ledger.mark_attempted(&id(4), 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_and_snapshot() {
        let ledger = InMemoryLedger::new();
        ledger.mark_attempted(&id(1), 1).await.unwrap();
        ledger
            .mark_executed(&id(2), &ExecutionReceipt::new("0x1", None))
            .await
            .unwrap();
        ledger.mark_failed(&id(3), "rejected", 1).await.unwrap();

        let stats = ledger.stats().await.unwrap();
        assert_eq!(
            stats,
            LedgerStats {
                executed: 1,
                failed: 1,
                in_flight: 1
            }
        );

        let snapshot = ledger.snapshot().await.unwrap();
        let ids: Vec<_> = snapshot.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(ledger.backend(), "memory");
    }
}
