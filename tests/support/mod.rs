//! Scripted in-process ledger client for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use govwatch::adapters::{LedgerClient, LedgerResult, ProposalStream};
use govwatch::domain::{ExecutionReceipt, Proposal, ProposalId};
use govwatch::error::LedgerError;
use govwatch::execution::{EngineConfig, ExecutionEngine, InMemoryLedger};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const QUORUM: u128 = 100;

/// Remote ledger double. Votes and pending ids are mutable between triggers;
/// `execute_proposal` answers from a per-id script, then succeeds. A second
/// successful execution of the same id is rejected the way a governor does.
#[derive(Default)]
pub struct ScriptedLedger {
    votes: Mutex<HashMap<ProposalId, u128>>,
    pending: Mutex<Vec<ProposalId>>,
    unreadable: Mutex<HashSet<ProposalId>>,
    listing_failures: Mutex<u32>,
    execute_script: Mutex<HashMap<ProposalId, VecDeque<LedgerResult<ExecutionReceipt>>>>,
    executed_on_chain: Mutex<HashSet<ProposalId>>,
    execute_calls: Mutex<Vec<ProposalId>>,
    execute_delay: Mutex<Duration>,
    subscriptions: Mutex<VecDeque<LedgerResult<mpsc::UnboundedReceiver<ProposalId>>>>,
    subscribe_calls: Mutex<u32>,
}

impl ScriptedLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or update a pending proposal
    pub fn set_votes(&self, id: impl Into<ProposalId>, votes: u128) {
        let id = id.into();
        let mut pending = self.pending.lock().unwrap();
        if !pending.contains(&id) {
            pending.push(id.clone());
        }
        self.votes.lock().unwrap().insert(id, votes);
    }

    /// Repeat an id in the pending listing
    pub fn list_again(&self, id: impl Into<ProposalId>) {
        self.pending.lock().unwrap().push(id.into());
    }

    /// Known to the ledger (readable) but not listed as pending
    pub fn set_unlisted_votes(&self, id: impl Into<ProposalId>, votes: u128) {
        self.votes.lock().unwrap().insert(id.into(), votes);
    }

    pub fn make_unreadable(&self, id: impl Into<ProposalId>) {
        self.unreadable.lock().unwrap().insert(id.into());
    }

    pub fn fail_next_listing(&self) {
        *self.listing_failures.lock().unwrap() += 1;
    }

    pub fn script_execute(&self, id: impl Into<ProposalId>, result: LedgerResult<ExecutionReceipt>) {
        self.execute_script
            .lock()
            .unwrap()
            .entry(id.into())
            .or_default()
            .push_back(result);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = delay;
    }

    /// Queue a subscription that delivers whatever is sent on the returned sender
    pub fn push_subscription(&self) -> mpsc::UnboundedSender<ProposalId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push_back(Ok(rx));
        tx
    }

    pub fn push_subscription_failure(&self, reason: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .push_back(Err(LedgerError::Unavailable(reason.to_string())));
    }

    pub fn execute_calls(&self) -> Vec<ProposalId> {
        self.execute_calls.lock().unwrap().clone()
    }

    pub fn execute_count(&self, id: impl Into<ProposalId>) -> usize {
        let id = id.into();
        self.execute_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| **called == id)
            .count()
    }

    pub fn subscribe_calls(&self) -> u32 {
        *self.subscribe_calls.lock().unwrap()
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn list_pending_proposals(&self) -> LedgerResult<Vec<Proposal>> {
        {
            let mut failures = self.listing_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Unavailable("listing refused".to_string()));
            }
        }

        let votes = self.votes.lock().unwrap();
        Ok(self
            .pending
            .lock()
            .unwrap()
            .iter()
            .map(|id| Proposal::new(id.clone(), votes.get(id).copied().unwrap_or(0)))
            .collect())
    }

    async fn get_vote_count(&self, id: &ProposalId) -> LedgerResult<u128> {
        if self.unreadable.lock().unwrap().contains(id) {
            return Err(LedgerError::Unavailable(format!("tally for {} unreadable", id)));
        }
        self.votes
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .ok_or_else(|| LedgerError::ProposalNotFound(id.clone()))
    }

    async fn execute_proposal(&self, id: &ProposalId) -> LedgerResult<ExecutionReceipt> {
        self.execute_calls.lock().unwrap().push(id.clone());

        let delay = *self.execute_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .execute_script
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|queue| queue.pop_front());

        let result = match scripted {
            Some(result) => result,
            None if self.executed_on_chain.lock().unwrap().contains(id) => Err(
                LedgerError::ExecutionRejected(
                    "execution reverted: Governor: proposal already executed".to_string(),
                ),
            ),
            None => Ok(ExecutionReceipt::new(format!("0x{:0>64}", id.as_str()), Some(100))),
        };

        if result.is_ok() {
            self.executed_on_chain.lock().unwrap().insert(id.clone());
        }
        result
    }

    async fn subscribe_new_proposals(&self) -> LedgerResult<ProposalStream> {
        *self.subscribe_calls.lock().unwrap() += 1;

        let next = self.subscriptions.lock().unwrap().pop_front();
        match next {
            Some(Ok(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|id| (id, rx))
            })
            .boxed()),
            Some(Err(e)) => Err(e),
            // Nothing scripted: a quiet, healthy subscription
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        quorum: QUORUM,
        call_timeout: Duration::from_secs(5),
        max_concurrent: 4,
    }
}

pub fn engine(client: Arc<ScriptedLedger>) -> (Arc<ExecutionEngine>, Arc<InMemoryLedger>) {
    engine_with(client, engine_config())
}

pub fn engine_with(
    client: Arc<ScriptedLedger>,
    config: EngineConfig,
) -> (Arc<ExecutionEngine>, Arc<InMemoryLedger>) {
    let ledger = Arc::new(InMemoryLedger::new());
    let engine = Arc::new(ExecutionEngine::new(client, ledger.clone(), config));
    (engine, ledger)
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}
