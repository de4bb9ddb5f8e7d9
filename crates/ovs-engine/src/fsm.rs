//! Execution status state machine.
//!
//! Every status write goes through [`ExecutionFsm::check`] before the
//! compare-and-set hits the database; an illegal edge is a CONFLICT and
//! callers MUST treat it as an invariant breach, not retry it blindly.
//!
//! ```text
//!   PENDING ──► QUEUED ──► RUNNING ──► SUCCEEDED (term.)
//!      │           │          │   ├──► FAILED    (term.)
//!      │           │          │   ├──► TIMED_OUT (term.)
//!      │           ▼          ▼   └──► CANCELLED (term.)
//!      ├──► APPROVAL_PENDING ─┬──► QUEUED
//!      │                      └──► CANCELLED
//!      └──► RUNNING | CANCELLED
//! ```

use ovs_schemas::{ExecutionStatus, OvsError};

/// Returned when a transition is not on the legal graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal execution transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

impl From<TransitionError> for OvsError {
    fn from(e: TransitionError) -> Self {
        OvsError::conflict(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionFsm;

impl ExecutionFsm {
    /// Is `from -> to` on the legal-transition graph?
    pub fn is_legal(from: ExecutionStatus, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, ApprovalPending)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (ApprovalPending, Queued)
                | (ApprovalPending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }

    /// Check one edge.
    pub fn check(from: ExecutionStatus, to: ExecutionStatus) -> Result<(), TransitionError> {
        if Self::is_legal(from, to) {
            Ok(())
        } else {
            Err(TransitionError { from, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    const ALL: [ExecutionStatus; 8] = [
        Pending,
        Queued,
        Running,
        Succeeded,
        Failed,
        Cancelled,
        ApprovalPending,
        TimedOut,
    ];

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [Succeeded, Failed, Cancelled, TimedOut] {
            for to in ALL {
                assert!(
                    !ExecutionFsm::is_legal(from, to),
                    "terminal {from} must not move to {to}"
                );
            }
        }
    }

    #[test]
    fn running_is_reachable_only_from_pending_and_queued() {
        for from in ALL {
            let legal = ExecutionFsm::is_legal(from, Running);
            assert_eq!(legal, matches!(from, Pending | Queued), "{from} -> RUNNING");
        }
    }

    #[test]
    fn approval_pending_cannot_reach_running_directly() {
        assert!(!ExecutionFsm::is_legal(ApprovalPending, Running));
        assert!(ExecutionFsm::is_legal(ApprovalPending, Queued));
        assert!(ExecutionFsm::is_legal(ApprovalPending, Cancelled));
    }

    #[test]
    fn every_walk_on_the_graph_ends_terminal_or_live() {
        // spot-check the canonical walks
        let walks: &[&[ExecutionStatus]] = &[
            &[Pending, Running, Succeeded],
            &[Pending, Queued, Running, Failed],
            &[Pending, ApprovalPending, Queued, Running, TimedOut],
            &[Pending, ApprovalPending, Cancelled],
            &[Pending, Queued, Cancelled],
        ];
        for walk in walks {
            for pair in walk.windows(2) {
                ExecutionFsm::check(pair[0], pair[1]).unwrap();
            }
        }
    }

    #[test]
    fn illegal_edge_maps_to_conflict() {
        let err: OvsError = ExecutionFsm::check(Succeeded, Running).unwrap_err().into();
        assert_eq!(err.kind, ovs_schemas::ErrorKind::Conflict);
    }
}
