//! Approval gate.
//!
//! Approval is both a routing mode and an FSM state. An execution whose
//! mode is APPROVAL_REQUIRED may not transition to RUNNING without an
//! APPROVED row — the worker consults this gate after claiming and before
//! starting the step loop.

use ovs_schemas::{ExecutionMode, OvsError};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    /// Enforce the approval invariant for an execution about to run.
    ///
    /// # Errors
    /// `POLICY` when the mode requires approval and no APPROVED row exists.
    pub async fn ensure_can_run(
        &self,
        pool: &PgPool,
        execution_id: Uuid,
        mode: ExecutionMode,
    ) -> Result<(), OvsError> {
        if mode != ExecutionMode::ApprovalRequired {
            return Ok(());
        }

        if ovs_db::approvals::has_approved_row(pool, execution_id).await? {
            return Ok(());
        }

        Err(OvsError::policy(format!(
            "execution {execution_id} requires an APPROVED approval before it may run"
        )))
    }
}
