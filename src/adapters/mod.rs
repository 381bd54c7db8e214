pub mod governor_rpc;
pub mod ledger_client;
pub mod postgres;

pub use governor_rpc::{GovernorRpcClient, IGovernor};
pub use ledger_client::{LedgerClient, LedgerResult, ProposalStream};
pub use postgres::PostgresStore;

#[cfg(test)]
pub use ledger_client::MockLedgerClient;
