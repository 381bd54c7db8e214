use thiserror::Error;

use crate::domain::ProposalId;

/// Main error type for the governance agent
#[derive(Error, Debug)]
pub enum GovError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Ledger client errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Address parsing error: {0}")]
    AddressParsing(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GovError {
    /// Startup errors the process must not continue past.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            GovError::Config(_)
                | GovError::InvalidConfig(_)
                | GovError::Wallet(_)
                | GovError::AddressParsing(_)
        )
    }
}

/// Result type alias for GovError
pub type Result<T> = std::result::Result<T, GovError>;

/// Failures reported at the ledger client boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transport failure, timeout or malformed response. Always retryable.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    /// The ledger refused the execution submission.
    #[error("Execution rejected: {0}")]
    ExecutionRejected(String),
}
