//! Proposal execution core
//!
//! - Eligibility evaluation against the quorum
//! - Execution ledger (in-memory or Postgres) guaranteeing at-most-once claims
//! - Execution engine shared by the sweep and event trigger paths

pub mod eligibility;
pub mod engine;
pub mod ledger;
pub mod postgres_ledger;

pub use eligibility::evaluate;
pub use engine::{EngineConfig, ExecutionEngine, Outcome, SweepReport};
pub use ledger::{ExecutionLedger, InMemoryLedger, LedgerStats, RecoveryReport};
pub use postgres_ledger::PostgresLedger;
