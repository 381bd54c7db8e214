use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable proposal identifier used as the dedupe key.
///
/// Holds the canonical decimal rendering of the on-chain `uint256` id so it
/// survives a round trip through logs, Postgres and JSON unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ProposalId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ProposalId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A governance proposal as listed by the ledger.
///
/// `vote_count` is whatever the ledger reported at listing time; eligibility
/// is always decided on a freshly fetched tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub vote_count: u128,
}

impl Proposal {
    pub fn new(id: impl Into<ProposalId>, vote_count: u128) -> Self {
        Self {
            id: id.into(),
            vote_count,
        }
    }
}

/// Result of comparing a tally against the quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    NotYetEligible { missing: u128 },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::Eligible => write!(f, "eligible"),
            Eligibility::NotYetEligible { missing } => {
                write!(f, "not yet eligible ({} votes short)", missing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_id_serializes_as_plain_string() {
        let id = ProposalId::from(42u64);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn eligibility_display() {
        assert_eq!(Eligibility::Eligible.to_string(), "eligible");
        assert_eq!(
            Eligibility::NotYetEligible { missing: 20 }.to_string(),
            "not yet eligible (20 votes short)"
        );
    }
}
