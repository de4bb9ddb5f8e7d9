//! Masked append-only event writer.
//!
//! The writer owns the masking step: callers hand it raw payloads and the
//! masked form is what reaches the `execution_events` table and the tracing
//! log. Nothing else in the system writes event rows.

use ovs_schemas::{EventKind, OvsError};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::masker::LogMasker;

/// Shared handle for appending execution events. Cheap to clone.
#[derive(Clone)]
pub struct EventWriter {
    pool: PgPool,
    masker: LogMasker,
}

impl EventWriter {
    pub fn new(pool: PgPool, masker: LogMasker) -> Self {
        Self { pool, masker }
    }

    pub fn masker(&self) -> &LogMasker {
        &self.masker
    }

    /// Mask `payload` and append it to the execution's event stream.
    /// Returns the assigned sequence number.
    pub async fn append(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        kind: EventKind,
        payload: Value,
    ) -> Result<i64, OvsError> {
        let masked = self.masker.mask_value(&payload);
        let seq =
            ovs_db::events::append_event(&self.pool, execution_id, tenant_id, kind, &masked)
                .await?;

        info!(
            execution_id = %execution_id,
            kind = kind.as_str(),
            seq,
            "execution event"
        );
        Ok(seq)
    }

    /// Coarse progress marker: percent complete plus the current step label.
    pub async fn progress(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        percent: u8,
        current_step: &str,
    ) -> Result<i64, OvsError> {
        self.append(
            execution_id,
            tenant_id,
            EventKind::Progress,
            json!({
                "percent": percent.min(100),
                "current_step": current_step,
            }),
        )
        .await
    }
}
