//! Execution classification and lifecycle enums.
//!
//! Status values are stored as text in Postgres and serialized as
//! SCREAMING_SNAKE_CASE on the wire; `as_str`/`FromStr` round-trip exactly.
//! The legal-transition graph itself is enforced by the engine's FSM — the
//! enums here only know which states are terminal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    ApprovalPending,
    TimedOut,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::ApprovalPending => "APPROVAL_PENDING",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "APPROVAL_PENDING" => Ok(Self::ApprovalPending),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a single plan step. Same enum as the execution status
/// restricted to the non-approval states — a step is never approval-gated on
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Step status may only advance: PENDING < RUNNING < terminal.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            _ => 2,
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SlaClass
// ---------------------------------------------------------------------------

/// Latency tier of an execution; governs timeouts and the worker retry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlaClass {
    Fast,
    Medium,
    Long,
}

impl SlaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Medium => "MEDIUM",
            Self::Long => "LONG",
        }
    }

    /// Worker re-attempt budget before an item is dead-lettered.
    pub fn max_attempts(&self) -> i32 {
        match self {
            Self::Fast => 2,
            Self::Medium => 3,
            Self::Long => 5,
        }
    }
}

impl FromStr for SlaClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAST" => Ok(Self::Fast),
            "MEDIUM" => Ok(Self::Medium),
            "LONG" => Ok(Self::Long),
            other => Err(format!("unknown sla class '{other}'")),
        }
    }
}

impl fmt::Display for SlaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionClass
// ---------------------------------------------------------------------------

/// Side-effect tier of a plan, inferred from the tools its steps invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionClass {
    Read,
    Mutate,
    Destructive,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Mutate => "MUTATE",
            Self::Destructive => "DESTRUCTIVE",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl FromStr for ActionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READ" => Ok(Self::Read),
            "MUTATE" => Ok(Self::Mutate),
            "DESTRUCTIVE" => Ok(Self::Destructive),
            other => Err(format!("unknown action class '{other}'")),
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

/// Routing decision made at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Immediate,
    Background,
    ApprovalRequired,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::Background => "BACKGROUND",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMMEDIATE" => Ok(Self::Immediate),
            "BACKGROUND" => Ok(Self::Background),
            "APPROVAL_REQUIRED" => Ok(Self::ApprovalRequired),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ApprovalState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown approval state '{other}'")),
        }
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SelectionMode
// ---------------------------------------------------------------------------

/// Caller preference driving the Stage B feature weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionMode {
    Fast,
    Accurate,
    Thorough,
    Cheap,
    Simple,
    Balanced,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Accurate => "ACCURATE",
            Self::Thorough => "THOROUGH",
            Self::Cheap => "CHEAP",
            Self::Simple => "SIMPLE",
            Self::Balanced => "BALANCED",
        }
    }
}

impl Default for SelectionMode {
    fn default() -> Self {
        Self::Balanced
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAST" => Ok(Self::Fast),
            "ACCURATE" => Ok(Self::Accurate),
            "THOROUGH" => Ok(Self::Thorough),
            "CHEAP" => Ok(Self::Cheap),
            "SIMPLE" => Ok(Self::Simple),
            "BALANCED" => Ok(Self::Balanced),
            other => Err(format!("unknown selection mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::ApprovalPending,
            ExecutionStatus::TimedOut,
        ] {
            assert_eq!(s.as_str().parse::<ExecutionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn terminal_states_are_exactly_the_leaves() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::ApprovalPending.is_terminal());
    }

    #[test]
    fn retry_caps_follow_sla_class() {
        assert_eq!(SlaClass::Fast.max_attempts(), 2);
        assert_eq!(SlaClass::Medium.max_attempts(), 3);
        assert_eq!(SlaClass::Long.max_attempts(), 5);
    }

    #[test]
    fn action_class_ordering_reflects_severity() {
        assert!(ActionClass::Read < ActionClass::Mutate);
        assert!(ActionClass::Mutate < ActionClass::Destructive);
        assert!(!ActionClass::Read.is_write());
        assert!(ActionClass::Destructive.is_write());
    }

    #[test]
    fn wire_serialization_is_screaming_snake() {
        let v = serde_json::to_string(&ExecutionStatus::ApprovalPending).unwrap();
        assert_eq!(v, "\"APPROVAL_PENDING\"");
        let v = serde_json::to_string(&ExecutionMode::ApprovalRequired).unwrap();
        assert_eq!(v, "\"APPROVAL_REQUIRED\"");
    }
}
