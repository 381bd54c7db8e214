use crate::domain::Eligibility;

/// Decide whether a tally clears the quorum.
///
/// Callers pass a freshly fetched tally; votes move between discovery and
/// evaluation.
pub fn evaluate(vote_count: u128, quorum: u128) -> Eligibility {
    if vote_count >= quorum {
        Eligibility::Eligible
    } else {
        Eligibility::NotYetEligible {
            missing: quorum - vote_count,
        }
    }
}
