//! Outcome of a confirmation

use geniesafe_common::SubjectStatus;
use serde::Serialize;

/// What a `confirm` call achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QuorumOutcome {
    /// The attestor had confirmed before; nothing changed
    AlreadyConfirmed,
    /// Recorded; more attestors still have to confirm
    PartialQuorum {
        confirmed_count: usize,
        total_count: usize,
    },
    /// Recorded, and it was the last one: the subject moved to `status`
    QuorumComplete {
        status: SubjectStatus,
        total_count: usize,
    },
}

impl QuorumOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, QuorumOutcome::QuorumComplete { .. })
    }

    /// Confirmations still missing
    pub fn remaining(&self) -> usize {
        match self {
            QuorumOutcome::PartialQuorum {
                confirmed_count,
                total_count,
            } => total_count.saturating_sub(*confirmed_count),
            _ => 0,
        }
    }
}

impl std::fmt::Display for QuorumOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumOutcome::AlreadyConfirmed => write!(f, "You have already confirmed"),
            QuorumOutcome::PartialQuorum {
                confirmed_count,
                total_count,
            } => write!(
                f,
                "Confirmed ({} of {}), waiting for {} more",
                confirmed_count,
                total_count,
                self.remaining()
            ),
            QuorumOutcome::QuorumComplete { status, .. } => {
                write!(f, "All attestors confirmed, now {}; owner notified", status)
            }
        }
    }
}
