//! JSON-RPC ledger client for an on-chain governor contract
//!
//! Reads pending proposals and tallies, submits `execute` transactions signed
//! by the configured wallet, and polls `ProposalCreated` logs for the event
//! fast path.

use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::sol;
use alloy::transports::RpcError;
use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::adapters::ledger_client::{LedgerClient, LedgerResult, ProposalStream};
use crate::domain::{ExecutionReceipt, Proposal, ProposalId};
use crate::error::{GovError, LedgerError, Result};
use crate::signing::Wallet;

// Generate contract bindings for the governor
sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IGovernor {
        /// Ids of proposals that have not been executed yet
        function pendingProposals() external view returns (uint256[] memory);

        /// Current vote tally of a proposal
        function proposalVotes(uint256 proposalId) external view returns (uint256);

        /// Execute an approved proposal
        function execute(uint256 proposalId) external;

        /// Emitted when a proposal is created
        event ProposalCreated(uint256 indexed proposalId, address indexed proposer);
    }
}

/// Revert / error-response fragments meaning the proposal id is unknown
const NOT_FOUND_MARKERS: &[&str] = &[
    "nonexistent proposal",
    "unknown proposal",
    "invalid proposal id",
    "governornonexistentproposal",
];

fn parse_proposal_id(id: &ProposalId) -> Option<U256> {
    id.as_str().trim().parse::<U256>().ok()
}

fn votes_to_u128(votes: U256) -> u128 {
    u128::try_from(votes).unwrap_or(u128::MAX)
}

/// Error response from the node (revert, validation) vs. anything else
fn rpc_error_message(err: &alloy::contract::Error) -> Option<String> {
    match err {
        alloy::contract::Error::TransportError(RpcError::ErrorResp(payload)) => {
            Some(payload.message.to_string())
        }
        _ => None,
    }
}

fn classify_execute_error(err: alloy::contract::Error) -> LedgerError {
    match rpc_error_message(&err) {
        Some(message) => LedgerError::ExecutionRejected(message),
        None => LedgerError::Unavailable(format!("execute submission failed: {}", err)),
    }
}

fn classify_read_error(id: &ProposalId, err: alloy::contract::Error) -> LedgerError {
    if let Some(message) = rpc_error_message(&err) {
        let lowered = message.to_ascii_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
            return LedgerError::ProposalNotFound(id.clone());
        }
    }
    LedgerError::Unavailable(format!("proposalVotes({}) failed: {}", id, err))
}

/// Pair each pending id with its tally. An id whose tally cannot be read is
/// left out of this listing so the rest of the sweep still runs.
async fn collect_tallies<F, Fut>(ids: Vec<U256>, read_votes: F) -> Vec<Proposal>
where
    F: Fn(U256) -> Fut,
    Fut: Future<Output = LedgerResult<U256>>,
{
    let mut proposals = Vec::with_capacity(ids.len());
    for raw in ids {
        let id = ProposalId::new(raw.to_string());
        match read_votes(raw).await {
            Ok(votes) => proposals.push(Proposal::new(id, votes_to_u128(votes))),
            Err(e) => warn!(
                proposal_id = %id,
                error = %e,
                "Skipping proposal with unreadable tally"
            ),
        }
    }
    proposals
}

/// Governor contract client over HTTP JSON-RPC
pub struct GovernorRpcClient {
    contract: IGovernor::IGovernorInstance<DynProvider>,
    governor: Address,
}

impl GovernorRpcClient {
    /// Connect to the governor at `governor_address` through `rpc_url`,
    /// signing executions with `wallet`.
    pub fn connect(rpc_url: &str, governor_address: &str, wallet: &Wallet) -> Result<Self> {
        let rpc_url: url::Url = rpc_url
            .trim()
            .parse()
            .map_err(|e| GovError::AddressParsing(format!("Invalid RPC URL: {}", e)))?;
        let governor: Address = governor_address.trim().parse().map_err(|e| {
            GovError::AddressParsing(format!("Invalid governor address: {}", e))
        })?;

        let provider = ProviderBuilder::new()
            .wallet(wallet.ethereum_wallet())
            .connect_http(rpc_url)
            .erased();

        info!(
            "Governor client ready (governor={}, signer={})",
            governor,
            wallet.address()
        );

        Ok(Self {
            contract: IGovernor::new(governor, provider),
            governor,
        })
    }

    pub fn governor(&self) -> Address {
        self.governor
    }
}

#[async_trait]
impl LedgerClient for GovernorRpcClient {
    async fn list_pending_proposals(&self) -> LedgerResult<Vec<Proposal>> {
        let ids = self
            .contract
            .pendingProposals()
            .call()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("pendingProposals failed: {}", e)))?;

        let proposals = collect_tallies(ids, |raw| async move {
            let id = ProposalId::new(raw.to_string());
            self.contract
                .proposalVotes(raw)
                .call()
                .await
                .map_err(|e| classify_read_error(&id, e))
        })
        .await;

        debug!("Listed {} pending proposal(s)", proposals.len());
        Ok(proposals)
    }

    async fn get_vote_count(&self, id: &ProposalId) -> LedgerResult<u128> {
        let raw = parse_proposal_id(id).ok_or_else(|| LedgerError::ProposalNotFound(id.clone()))?;

        let votes = self
            .contract
            .proposalVotes(raw)
            .call()
            .await
            .map_err(|e| classify_read_error(id, e))?;

        Ok(votes_to_u128(votes))
    }

    async fn execute_proposal(&self, id: &ProposalId) -> LedgerResult<ExecutionReceipt> {
        let raw = parse_proposal_id(id).ok_or_else(|| {
            LedgerError::ExecutionRejected(format!("invalid proposal id '{}'", id))
        })?;

        info!("Calling Governor.execute for proposal {}...", id);

        let pending = self
            .contract
            .execute(raw)
            .send()
            .await
            .map_err(classify_execute_error)?;

        let receipt = pending.get_receipt().await.map_err(|e| {
            LedgerError::Unavailable(format!("execute confirmation failed: {}", e))
        })?;

        let tx_hash = format!("{:?}", receipt.transaction_hash);
        if !receipt.status() {
            warn!("Execute tx {} for proposal {} reverted", tx_hash, id);
            return Err(LedgerError::ExecutionRejected(format!(
                "transaction reverted ({})",
                tx_hash
            )));
        }

        Ok(ExecutionReceipt::new(tx_hash, receipt.block_number))
    }

    async fn subscribe_new_proposals(&self) -> LedgerResult<ProposalStream> {
        let poller = self
            .contract
            .ProposalCreated_filter()
            .watch()
            .await
            .map_err(|e| {
                LedgerError::Unavailable(format!("ProposalCreated filter install failed: {}", e))
            })?;

        let stream = poller.into_stream().filter_map(|item| async move {
            match item {
                Ok((event, _log)) => Some(ProposalId::new(event.proposalId.to_string())),
                Err(e) => {
                    warn!("Dropping undecodable ProposalCreated log: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
