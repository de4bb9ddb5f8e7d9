//! Execution event kinds and cancellation reasons.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Kinds written to the append-only per-execution event stream. Stored as
/// text; payloads are masked before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ExecutionCreated,
    ExecutionQueued,
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionTimedOut,
    StepStarted,
    StepSucceeded,
    StepFailed,
    StepRetried,
    ApprovalRequested,
    ApprovalDecided,
    RbacDecision,
    TieBreakFallback,
    ForcedCancel,
    Progress,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionCreated => "EXECUTION_CREATED",
            Self::ExecutionQueued => "EXECUTION_QUEUED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ExecutionSucceeded => "EXECUTION_SUCCEEDED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::ExecutionTimedOut => "EXECUTION_TIMED_OUT",
            Self::StepStarted => "STEP_STARTED",
            Self::StepSucceeded => "STEP_SUCCEEDED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepRetried => "STEP_RETRIED",
            Self::ApprovalRequested => "APPROVAL_REQUESTED",
            Self::ApprovalDecided => "APPROVAL_DECIDED",
            Self::RbacDecision => "RBAC_DECISION",
            Self::TieBreakFallback => "TIE_BREAK_FALLBACK",
            Self::ForcedCancel => "FORCED_CANCEL",
            Self::Progress => "PROGRESS",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTION_CREATED" => Ok(Self::ExecutionCreated),
            "EXECUTION_QUEUED" => Ok(Self::ExecutionQueued),
            "EXECUTION_STARTED" => Ok(Self::ExecutionStarted),
            "EXECUTION_SUCCEEDED" => Ok(Self::ExecutionSucceeded),
            "EXECUTION_FAILED" => Ok(Self::ExecutionFailed),
            "EXECUTION_CANCELLED" => Ok(Self::ExecutionCancelled),
            "EXECUTION_TIMED_OUT" => Ok(Self::ExecutionTimedOut),
            "STEP_STARTED" => Ok(Self::StepStarted),
            "STEP_SUCCEEDED" => Ok(Self::StepSucceeded),
            "STEP_FAILED" => Ok(Self::StepFailed),
            "STEP_RETRIED" => Ok(Self::StepRetried),
            "APPROVAL_REQUESTED" => Ok(Self::ApprovalRequested),
            "APPROVAL_DECIDED" => Ok(Self::ApprovalDecided),
            "RBAC_DECISION" => Ok(Self::RbacDecision),
            "TIE_BREAK_FALLBACK" => Ok(Self::TieBreakFallback),
            "FORCED_CANCEL" => Ok(Self::ForcedCancel),
            "PROGRESS" => Ok(Self::Progress),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// CancelReason
// ---------------------------------------------------------------------------

/// Why a cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    User,
    StepTimeout,
    ExecutionTimeout,
    ParentCancelled,
    WorkerShutdown,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::ParentCancelled => "PARENT_CANCELLED",
            Self::WorkerShutdown => "WORKER_SHUTDOWN",
        }
    }

    /// Timeout-driven cancellations end the execution in TIMED_OUT rather
    /// than CANCELLED.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StepTimeout | Self::ExecutionTimeout)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "STEP_TIMEOUT" => Ok(Self::StepTimeout),
            "EXECUTION_TIMEOUT" => Ok(Self::ExecutionTimeout),
            "PARENT_CANCELLED" => Ok(Self::ParentCancelled),
            "WORKER_SHUTDOWN" => Ok(Self::WorkerShutdown),
            other => Err(format!("unknown cancel reason '{other}'")),
        }
    }
}
