pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod execution;
pub mod services;
pub mod signing;

pub use adapters::{GovernorRpcClient, LedgerClient};
pub use config::AppConfig;
pub use coordination::{GracefulShutdown, Scheduler, ShutdownSignal, TriggerStatus};
pub use domain::{ExecutionReceipt, Proposal, ProposalId, Trigger};
pub use error::{GovError, LedgerError, Result};
pub use execution::{
    EngineConfig, ExecutionEngine, ExecutionLedger, InMemoryLedger, Outcome, PostgresLedger,
    SweepReport,
};
pub use signing::Wallet;
