//! Timeout enforcement.
//!
//! Budgets come from the nine-row `(sla_class, action_class)` matrix,
//! immutable per release; the per-SLA step/total values can be overridden by
//! environment at startup. Budgets tick against wall time regardless of
//! retries — the remaining budget is passed into every handler.

use std::time::{Duration, Instant};

use ovs_schemas::{ActionClass, SlaClass};

// ---------------------------------------------------------------------------
// TimeoutPolicy matrix
// ---------------------------------------------------------------------------

/// One row of the timeout matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub step_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub max_output_bytes: usize,
}

/// The release-pinned matrix. Writes get tighter ceilings than reads within
/// an SLA class; destructive actions never exceed the MEDIUM wall budgets.
pub const fn timeout_policy(sla: SlaClass, action: ActionClass) -> TimeoutPolicy {
    match (sla, action) {
        (SlaClass::Fast, ActionClass::Read) => TimeoutPolicy {
            step_timeout_ms: 15_000,
            total_timeout_ms: 30_000,
            heartbeat_ms: 5_000,
            max_output_bytes: 256 * 1024,
        },
        (SlaClass::Fast, ActionClass::Mutate) => TimeoutPolicy {
            step_timeout_ms: 15_000,
            total_timeout_ms: 30_000,
            heartbeat_ms: 5_000,
            max_output_bytes: 128 * 1024,
        },
        (SlaClass::Fast, ActionClass::Destructive) => TimeoutPolicy {
            step_timeout_ms: 10_000,
            total_timeout_ms: 20_000,
            heartbeat_ms: 5_000,
            max_output_bytes: 128 * 1024,
        },
        (SlaClass::Medium, ActionClass::Read) => TimeoutPolicy {
            step_timeout_ms: 60_000,
            total_timeout_ms: 300_000,
            heartbeat_ms: 10_000,
            max_output_bytes: 1024 * 1024,
        },
        (SlaClass::Medium, ActionClass::Mutate) => TimeoutPolicy {
            step_timeout_ms: 60_000,
            total_timeout_ms: 300_000,
            heartbeat_ms: 10_000,
            max_output_bytes: 512 * 1024,
        },
        (SlaClass::Medium, ActionClass::Destructive) => TimeoutPolicy {
            step_timeout_ms: 45_000,
            total_timeout_ms: 240_000,
            heartbeat_ms: 10_000,
            max_output_bytes: 512 * 1024,
        },
        (SlaClass::Long, ActionClass::Read) => TimeoutPolicy {
            step_timeout_ms: 300_000,
            total_timeout_ms: 1_800_000,
            heartbeat_ms: 15_000,
            max_output_bytes: 4 * 1024 * 1024,
        },
        (SlaClass::Long, ActionClass::Mutate) => TimeoutPolicy {
            step_timeout_ms: 300_000,
            total_timeout_ms: 1_800_000,
            heartbeat_ms: 15_000,
            max_output_bytes: 2 * 1024 * 1024,
        },
        (SlaClass::Long, ActionClass::Destructive) => TimeoutPolicy {
            step_timeout_ms: 120_000,
            total_timeout_ms: 300_000,
            heartbeat_ms: 10_000,
            max_output_bytes: 1024 * 1024,
        },
    }
}

// ---------------------------------------------------------------------------
// TimeoutTable — matrix + env overrides
// ---------------------------------------------------------------------------

/// The matrix with per-SLA step/total overrides applied. Built once at
/// startup from `RuntimeConfig`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutTable {
    overrides: [(Option<u64>, Option<u64>); 3],
}

impl TimeoutTable {
    /// `(step_ms, total_ms)` overrides per SLA class; `None` keeps the
    /// matrix value.
    pub fn with_overrides(
        fast: (Option<u64>, Option<u64>),
        medium: (Option<u64>, Option<u64>),
        long: (Option<u64>, Option<u64>),
    ) -> Self {
        Self {
            overrides: [fast, medium, long],
        }
    }

    pub fn policy(&self, sla: SlaClass, action: ActionClass) -> TimeoutPolicy {
        let mut p = timeout_policy(sla, action);
        let (step, total) = self.overrides[match sla {
            SlaClass::Fast => 0,
            SlaClass::Medium => 1,
            SlaClass::Long => 2,
        }];
        if let Some(ms) = step {
            p.step_timeout_ms = ms;
        }
        if let Some(ms) = total {
            p.total_timeout_ms = ms;
        }
        p
    }
}

// ---------------------------------------------------------------------------
// ExecutionBudget
// ---------------------------------------------------------------------------

/// Wall-clock budget for one execution attempt.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBudget {
    started: Instant,
    total: Duration,
    step: Duration,
}

impl ExecutionBudget {
    pub fn start(policy: TimeoutPolicy) -> Self {
        Self::start_with_elapsed(policy, Duration::ZERO)
    }

    /// Resume a budget that already consumed `elapsed` wall time — the total
    /// budget ticks across worker attempts, not per attempt.
    pub fn start_with_elapsed(policy: TimeoutPolicy, elapsed: Duration) -> Self {
        Self {
            started: Instant::now()
                .checked_sub(elapsed)
                .unwrap_or_else(Instant::now),
            total: Duration::from_millis(policy.total_timeout_ms),
            step: Duration::from_millis(policy.step_timeout_ms),
        }
    }

    /// Remaining execution budget; zero once the total timeout has elapsed.
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Deadline for the next step: the smaller of the step budget and what
    /// is left of the whole execution.
    pub fn step_deadline(&self) -> Duration {
        self.step.min(self.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_has_nine_distinct_rows() {
        let mut seen = Vec::new();
        for sla in [SlaClass::Fast, SlaClass::Medium, SlaClass::Long] {
            for action in [
                ActionClass::Read,
                ActionClass::Mutate,
                ActionClass::Destructive,
            ] {
                seen.push(timeout_policy(sla, action));
            }
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn destructive_never_exceeds_its_read_sibling() {
        for sla in [SlaClass::Fast, SlaClass::Medium, SlaClass::Long] {
            let read = timeout_policy(sla, ActionClass::Read);
            let destructive = timeout_policy(sla, ActionClass::Destructive);
            assert!(destructive.step_timeout_ms <= read.step_timeout_ms);
            assert!(destructive.total_timeout_ms <= read.total_timeout_ms);
        }
    }

    #[test]
    fn heartbeat_is_well_under_the_step_budget() {
        for sla in [SlaClass::Fast, SlaClass::Medium, SlaClass::Long] {
            for action in [
                ActionClass::Read,
                ActionClass::Mutate,
                ActionClass::Destructive,
            ] {
                let p = timeout_policy(sla, action);
                assert!(p.heartbeat_ms * 2 <= p.step_timeout_ms);
            }
        }
    }

    #[test]
    fn overrides_replace_only_what_they_name() {
        let t = TimeoutTable::with_overrides((Some(5_000), None), (None, None), (None, None));
        let p = t.policy(SlaClass::Fast, ActionClass::Read);
        assert_eq!(p.step_timeout_ms, 5_000);
        assert_eq!(p.total_timeout_ms, 30_000);
        // other classes untouched
        let p = t.policy(SlaClass::Medium, ActionClass::Read);
        assert_eq!(p.step_timeout_ms, 60_000);
    }

    #[test]
    fn step_deadline_shrinks_with_the_total_budget() {
        let budget = ExecutionBudget {
            started: Instant::now(),
            total: Duration::from_millis(100),
            step: Duration::from_millis(500),
        };
        assert!(budget.step_deadline() <= Duration::from_millis(100));
    }
}
