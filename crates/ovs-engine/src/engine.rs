//! The execution engine: drive a plan to terminal status under the full
//! guard stack, producing a result and an audit trail.
//!
//! Single-writer discipline: only the worker holding the queue lease (or
//! the inline path that never enqueued) calls [`ExecutionEngine::run_claimed`]
//! / the step loop; the cancellation path touches nothing but the token and
//! the non-RUNNING status CAS.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use ovs_schemas::{
    CancelReason, ErrorKind, EventKind, ExecutionMode, ExecutionStatus, OvsError, Plan,
    SelectionMode, StepStatus, Target,
};
use rand::Rng;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{classify, Preferences};
use crate::fsm::ExecutionFsm;
use crate::handlers::{truncate_output, HandlerRegistry, StepRunContext};
use ovs_assets::client::AssetQuery;
use ovs_assets::AssetResolver;
use ovs_audit::EventWriter;
use ovs_catalog::CatalogService;
use ovs_config::RuntimeConfig;
use ovs_db::executions::{ExecutionRow, NewExecution};
use ovs_db::steps::NewStep;
use ovs_metrics::Metrics;
use ovs_safety::cancel::CleanupOutcome;
use ovs_safety::pipeline::StepContext;
use ovs_safety::{
    ApprovalGate, CancellationManager, CleanupRegistry, GuardPipeline, IdempotencyDecision,
    IdempotencyGuard, TimeoutTable,
};
use ovs_selector::features::SelectionContext;
use ovs_selector::{SelectionRequest, SelectionSource, Selector};

/// Per-step transient retry budget.
const STEP_RETRY_BUDGET: u32 = 3;
/// Base/cap for the transient retry backoff.
const RETRY_BASE_MS: u64 = 200;
const RETRY_CAP_MS: u64 = 5_000;
/// Drain window granted to cleanup handlers after a cancellation.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub actor_id: String,
    pub plan: Plan,
    pub target: Target,
    pub preferences: Preferences,
}

#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    /// True when idempotency matched a prior execution — no new row.
    pub replayed: bool,
    pub approval_id: Option<Uuid>,
    /// Backpressure hint, seconds.
    pub retry_after: Option<u64>,
}

/// Step-loop continuation after a failed step.
enum StepFailureDisposition {
    /// `on_failure: continue` — the loop proceeds to the next step.
    ContinueNext,
    /// The execution is done with this attempt: a terminal status, or
    /// RUNNING to signal "retry via the queue".
    Exec(ExecutionStatus),
}

/// What the worker should do with the queue item after a claimed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Execution reached a terminal status — complete the item.
    Completed,
    /// Transient failure; the execution stays RUNNING and the item should be
    /// failed so the queue reschedules or dead-letters it.
    Retry { reason: String },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Dependency bundle for engine construction.
pub struct EngineDeps {
    pub pool: PgPool,
    pub cfg: RuntimeConfig,
    pub catalog: Arc<CatalogService>,
    pub resolver: Arc<AssetResolver>,
    pub handlers: HandlerRegistry,
    pub pipeline: GuardPipeline,
    pub cancellations: Arc<CancellationManager>,
    pub cleanup: CleanupRegistry,
    pub events: EventWriter,
    pub selector: Arc<Selector>,
}

pub struct ExecutionEngine {
    pool: PgPool,
    cfg: RuntimeConfig,
    catalog: Arc<CatalogService>,
    resolver: Arc<AssetResolver>,
    handlers: HandlerRegistry,
    pipeline: GuardPipeline,
    idempotency: IdempotencyGuard,
    approval_gate: ApprovalGate,
    cancellations: Arc<CancellationManager>,
    cleanup: CleanupRegistry,
    timeouts: TimeoutTable,
    events: EventWriter,
    selector: Arc<Selector>,
    metrics: &'static Metrics,
}

impl ExecutionEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let timeouts = TimeoutTable::with_overrides(
            (
                Some(deps.cfg.sla_fast_step_timeout_ms),
                Some(deps.cfg.sla_fast_total_timeout_ms),
            ),
            (
                Some(deps.cfg.sla_medium_step_timeout_ms),
                Some(deps.cfg.sla_medium_total_timeout_ms),
            ),
            (
                Some(deps.cfg.sla_long_step_timeout_ms),
                Some(deps.cfg.sla_long_total_timeout_ms),
            ),
        );
        let idempotency = IdempotencyGuard::new(deps.cfg.dedup_window());

        Self {
            pool: deps.pool,
            cfg: deps.cfg,
            catalog: deps.catalog,
            resolver: deps.resolver,
            handlers: deps.handlers,
            pipeline: deps.pipeline,
            idempotency,
            approval_gate: ApprovalGate,
            cancellations: deps.cancellations,
            cleanup: deps.cleanup,
            timeouts,
            events: deps.events,
            selector: deps.selector,
            metrics: Metrics::global(),
        }
    }

    // -----------------------------------------------------------------------
    // Submit
    // -----------------------------------------------------------------------

    pub async fn submit(&self, req: SubmitRequest) -> Result<ExecutionResponse, OvsError> {
        req.plan.validate()?;
        req.target.validate()?;

        // Resolve every step's tool up front; unknown tools are bad input.
        let mut specs = Vec::with_capacity(req.plan.steps.len());
        for step in &req.plan.steps {
            let spec = self
                .catalog
                .get_tool_by_name(&step.tool_name)
                .await
                .map_err(|e| match e.kind {
                    ErrorKind::NotFound => {
                        OvsError::validation(format!("unknown tool '{}'", step.tool_name))
                    }
                    _ => e,
                })?;
            specs.push(spec);
        }

        let environment = self.target_environment(&req.tenant_id, &req.target).await;
        let estimated_cost = self.estimate_cost(&specs);
        let classification = classify(&specs, &environment, &req.preferences, estimated_cost);

        // Stage B: fill unset step patterns; remember tie-break fallbacks so
        // they land in the event log once the row exists.
        let (plan, tie_break_fallbacks) = self
            .select_patterns(&req, &specs, classification.sla_class)
            .await;

        let plan_json = serde_json::to_value(&plan)
            .map_err(|e| OvsError::internal(format!("plan does not serialize: {e}")))?;
        let target_json = serde_json::to_value(&req.target)
            .map_err(|e| OvsError::internal(format!("target does not serialize: {e}")))?;

        // Idempotency: collapse duplicates inside the dedup window.
        let key =
            self.idempotency
                .fingerprint(&req.tenant_id, &req.actor_id, &plan_json, &target_json);
        match self
            .idempotency
            .check(&self.pool, &req.tenant_id, &key)
            .await?
        {
            IdempotencyDecision::Replay(prior) => {
                info!(execution_id = %prior.execution_id, "idempotent replay");
                return Ok(ExecutionResponse {
                    execution_id: prior.execution_id,
                    status: prior.status,
                    mode: prior.mode,
                    replayed: true,
                    approval_id: None,
                    retry_after: None,
                });
            }
            IdempotencyDecision::RetryAllowed(prior) => {
                info!(prior = %prior.execution_id, "prior attempt failed; accepting retry");
            }
            IdempotencyDecision::New => {}
        }

        // Backpressure: shed immediate work, deprioritize background work.
        let mut priority = classification.priority;
        let mut retry_after = None;
        let depth = ovs_db::queue::total_depth(&self.pool).await?;
        if depth >= self.cfg.backpressure_queue_depth {
            if classification.mode == ExecutionMode::Immediate {
                return Err(OvsError::rate_limited("queue is saturated; retry later")
                    .with_details(json!({"retry_after_secs": 30})));
            }
            priority += 100;
            retry_after = Some(30);
        }

        let execution_id = Uuid::new_v4();
        let new = NewExecution {
            execution_id,
            tenant_id: req.tenant_id.clone(),
            actor_id: req.actor_id.clone(),
            idempotency_key: key,
            sla_class: classification.sla_class,
            mode: classification.mode,
            action_class: classification.action_class,
            priority,
            status: ExecutionStatus::Pending,
            plan: plan_json,
            target: target_json,
        };

        if let Err(e) = ovs_db::executions::insert_execution(&self.pool, &new).await {
            // A concurrent duplicate submit hit the live-row unique index;
            // surface the winner instead of an error.
            if e.kind == ErrorKind::Conflict {
                if let IdempotencyDecision::Replay(prior) = self
                    .idempotency
                    .check(&self.pool, &req.tenant_id, &new.idempotency_key)
                    .await?
                {
                    return Ok(ExecutionResponse {
                        execution_id: prior.execution_id,
                        status: prior.status,
                        mode: prior.mode,
                        replayed: true,
                        approval_id: None,
                        retry_after: None,
                    });
                }
            }
            return Err(e);
        }

        self.events
            .append(
                execution_id,
                &req.tenant_id,
                EventKind::ExecutionCreated,
                json!({
                    "actor": req.actor_id,
                    "sla_class": classification.sla_class,
                    "action_class": classification.action_class,
                    "mode": classification.mode,
                    "steps": plan.steps.len(),
                }),
            )
            .await?;

        for (step_name, rationale) in &tie_break_fallbacks {
            self.events
                .append(
                    execution_id,
                    &req.tenant_id,
                    EventKind::TieBreakFallback,
                    json!({"step": step_name, "detail": rationale}),
                )
                .await?;
        }

        match classification.mode {
            ExecutionMode::ApprovalRequired => {
                let approval_id = self
                    .open_approval(&req, execution_id, &specs, &environment)
                    .await?;
                self.transition(execution_id, ExecutionStatus::Pending, ExecutionStatus::ApprovalPending)
                    .await?;
                Ok(ExecutionResponse {
                    execution_id,
                    status: ExecutionStatus::ApprovalPending,
                    mode: ExecutionMode::ApprovalRequired,
                    replayed: false,
                    approval_id: Some(approval_id),
                    retry_after: None,
                })
            }
            ExecutionMode::Immediate => {
                self.transition(execution_id, ExecutionStatus::Pending, ExecutionStatus::Running)
                    .await?;
                let row = self.must_fetch(&req.tenant_id, execution_id).await?;
                let worker_id = format!("inline-{}", Uuid::new_v4().simple());
                let mut status = self.run_steps(&row, &worker_id).await?;
                if status == ExecutionStatus::Running {
                    // Inline runs have no queue item to retry through; a
                    // transient failure is terminal here.
                    self.transition(execution_id, ExecutionStatus::Running, ExecutionStatus::Failed)
                        .await?;
                    self.events
                        .append(
                            execution_id,
                            &req.tenant_id,
                            EventKind::ExecutionFailed,
                            json!({"reason": "transient failure on the immediate path"}),
                        )
                        .await?;
                    status = ExecutionStatus::Failed;
                }
                Ok(ExecutionResponse {
                    execution_id,
                    status,
                    mode: ExecutionMode::Immediate,
                    replayed: false,
                    approval_id: None,
                    retry_after: None,
                })
            }
            ExecutionMode::Background => {
                self.transition(execution_id, ExecutionStatus::Pending, ExecutionStatus::Queued)
                    .await?;
                ovs_db::queue::enqueue(
                    &self.pool,
                    execution_id,
                    &req.tenant_id,
                    priority,
                    classification.sla_class.max_attempts(),
                    None,
                )
                .await?;
                self.events
                    .append(
                        execution_id,
                        &req.tenant_id,
                        EventKind::ExecutionQueued,
                        json!({"priority": priority}),
                    )
                    .await?;
                Ok(ExecutionResponse {
                    execution_id,
                    status: ExecutionStatus::Queued,
                    mode: ExecutionMode::Background,
                    replayed: false,
                    approval_id: None,
                    retry_after,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cooperative cancellation. RUNNING executions drain via their token;
    /// anything earlier in the lifecycle is closed out directly.
    pub async fn cancel(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<ExecutionStatus, OvsError> {
        let row = self.must_fetch(tenant_id, execution_id).await?;
        if row.status.is_terminal() {
            return Ok(row.status);
        }

        self.cancellations.register(execution_id).await;
        self.cancellations
            .cancel(execution_id, CancelReason::User)
            .await;

        let status = match row.status {
            ExecutionStatus::Running => ExecutionStatus::Running, // token drains it
            from => {
                self.transition(execution_id, from, ExecutionStatus::Cancelled)
                    .await?;
                ExecutionStatus::Cancelled
            }
        };

        self.events
            .append(
                execution_id,
                tenant_id,
                EventKind::ExecutionCancelled,
                json!({"reason": reason, "source": CancelReason::User}),
            )
            .await?;

        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Decide
    // -----------------------------------------------------------------------

    /// Apply an approval decision and move the execution forward (or out).
    pub async fn decide(
        &self,
        tenant_id: &str,
        approval_id: Uuid,
        approve: bool,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ExecutionResponse, OvsError> {
        let approval = ovs_db::approvals::fetch_approval(&self.pool, tenant_id, approval_id)
            .await?
            .ok_or_else(|| OvsError::not_found(format!("no approval {approval_id}")))?;

        let decision = if approve {
            ovs_schemas::ApprovalState::Approved
        } else {
            ovs_schemas::ApprovalState::Rejected
        };

        let moved =
            ovs_db::approvals::decide_approval(&self.pool, approval_id, decision, actor, reason)
                .await?;
        if !moved {
            return Err(OvsError::conflict(format!(
                "approval {approval_id} is already decided"
            )));
        }

        self.metrics
            .approvals_total
            .with_label_values(&[decision.as_str()])
            .inc();

        let execution_id = approval.execution_id;
        let row = self.must_fetch(tenant_id, execution_id).await?;

        self.events
            .append(
                execution_id,
                tenant_id,
                EventKind::ApprovalDecided,
                json!({"approval_id": approval_id, "decision": decision, "decided_by": actor}),
            )
            .await?;

        let status = if approve {
            self.transition(
                execution_id,
                ExecutionStatus::ApprovalPending,
                ExecutionStatus::Queued,
            )
            .await?;
            ovs_db::queue::enqueue(
                &self.pool,
                execution_id,
                tenant_id,
                row.priority,
                row.sla_class.max_attempts(),
                None,
            )
            .await?;
            self.events
                .append(
                    execution_id,
                    tenant_id,
                    EventKind::ExecutionQueued,
                    json!({"priority": row.priority}),
                )
                .await?;
            ExecutionStatus::Queued
        } else {
            self.cancellations.register(execution_id).await;
            self.cancellations
                .cancel(execution_id, CancelReason::User)
                .await;
            self.transition(
                execution_id,
                ExecutionStatus::ApprovalPending,
                ExecutionStatus::Cancelled,
            )
            .await?;
            self.events
                .append(
                    execution_id,
                    tenant_id,
                    EventKind::ExecutionCancelled,
                    json!({"reason": "approval rejected"}),
                )
                .await?;
            ExecutionStatus::Cancelled
        };

        Ok(ExecutionResponse {
            execution_id,
            status,
            mode: row.mode,
            replayed: false,
            approval_id: Some(approval_id),
            retry_after: None,
        })
    }

    // -----------------------------------------------------------------------
    // Claimed runs (worker entry point)
    // -----------------------------------------------------------------------

    pub async fn run_claimed(
        &self,
        execution_id: Uuid,
        worker_id: &str,
    ) -> Result<RunOutcome, OvsError> {
        let Some(row) = ovs_db::executions::fetch_execution_any_tenant(&self.pool, execution_id)
            .await?
        else {
            warn!(%execution_id, "queue item references a missing execution");
            return Ok(RunOutcome::Completed);
        };

        if row.status.is_terminal() {
            return Ok(RunOutcome::Completed);
        }

        // The approval invariant holds even for queued work: a rejected or
        // expired approval after enqueue must not run.
        if let Err(e) = self
            .approval_gate
            .ensure_can_run(&self.pool, execution_id, row.mode)
            .await
        {
            warn!(%execution_id, error = %e, "approval gate refused a queued execution");
            self.transition(execution_id, row.status, ExecutionStatus::Cancelled)
                .await?;
            self.events
                .append(
                    execution_id,
                    &row.tenant_id,
                    EventKind::ExecutionCancelled,
                    json!({"reason": "approval missing at claim time"}),
                )
                .await?;
            return Ok(RunOutcome::Completed);
        }

        match row.status {
            ExecutionStatus::Queued => {
                if !ovs_db::executions::cas_status(
                    &self.pool,
                    execution_id,
                    ExecutionStatus::Queued,
                    ExecutionStatus::Running,
                )
                .await?
                {
                    // Raced with cancellation; whatever won, leave it alone.
                    return Ok(RunOutcome::Completed);
                }
            }
            ExecutionStatus::Running => {
                // Lease-expiry reclaim after a worker death: resume in place.
                info!(%execution_id, "resuming execution after lease expiry");
            }
            other => {
                warn!(%execution_id, status = %other, "claimed execution in unexpected status");
                return Ok(RunOutcome::Completed);
            }
        }

        let attempt = ovs_db::executions::increment_attempt(&self.pool, execution_id).await?;
        self.events
            .append(
                execution_id,
                &row.tenant_id,
                EventKind::ExecutionStarted,
                json!({"attempt": attempt, "worker": worker_id}),
            )
            .await?;

        let row = self.must_fetch(&row.tenant_id, execution_id).await?;
        let status = self.run_steps(&row, worker_id).await?;

        match status {
            ExecutionStatus::Running => Ok(RunOutcome::Retry {
                reason: "transient step failure".to_string(),
            }),
            _ => Ok(RunOutcome::Completed),
        }
    }

    /// Close out an execution whose queue item exhausted its retry budget.
    pub async fn finalize_dead_lettered(
        &self,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<(), OvsError> {
        let Some(row) = ovs_db::executions::fetch_execution_any_tenant(&self.pool, execution_id)
            .await?
        else {
            return Ok(());
        };
        if row.status.is_terminal() {
            return Ok(());
        }

        ovs_db::steps::fail_open_steps(&self.pool, execution_id).await?;

        // Stay on the legal graph: RUNNING fails; anything that never ran
        // is closed as CANCELLED.
        let terminal = match row.status {
            ExecutionStatus::Running => ExecutionStatus::Failed,
            _ => ExecutionStatus::Cancelled,
        };
        self.transition(execution_id, row.status, terminal).await?;
        self.events
            .append(
                execution_id,
                &row.tenant_id,
                EventKind::ExecutionFailed,
                json!({"reason": reason, "dead_lettered": true, "terminal": terminal}),
            )
            .await?;
        self.metrics.dlq_items_total.inc();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    /// Drive every step of `row` in order. Returns the resulting execution
    /// status; RUNNING means "transient failure, retry via the queue".
    async fn run_steps(
        &self,
        row: &ExecutionRow,
        worker_id: &str,
    ) -> Result<ExecutionStatus, OvsError> {
        let started = Instant::now();
        let plan: Plan = serde_json::from_value(row.plan.clone())
            .map_err(|e| OvsError::internal(format!("stored plan does not decode: {e}")))?;
        let target: Target = serde_json::from_value(row.target.clone())
            .map_err(|e| OvsError::internal(format!("stored target does not decode: {e}")))?;

        let token = self.cancellations.register(row.execution_id).await;
        let policy = self.timeouts.policy(row.sla_class, row.action_class);
        // The total budget ticks across attempts: resume from started_at.
        let consumed = row
            .started_at
            .and_then(|t| (chrono::Utc::now() - t).to_std().ok())
            .unwrap_or_default();
        let budget = ovs_safety::timeout::ExecutionBudget::start_with_elapsed(policy, consumed);

        // Idempotent: ordinals already present are left alone.
        let new_steps: Vec<NewStep> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| NewStep {
                step_id: Uuid::new_v4(),
                ordinal: i as i32,
                tool_name: s.tool_name.clone(),
                inputs: s.inputs.clone(),
            })
            .collect();
        ovs_db::steps::insert_steps_if_absent(&self.pool, row.execution_id, &new_steps).await?;

        let environment = self.target_environment(&row.tenant_id, &target).await;
        let approval_id =
            ovs_db::approvals::approved_approval_id(&self.pool, row.execution_id).await?;

        let steps = ovs_db::steps::fetch_steps(&self.pool, row.execution_id).await?;
        let total = steps.len().max(1);
        let mut results: Vec<Value> = Vec::with_capacity(steps.len());
        let primary_tool = plan
            .steps
            .first()
            .map(|s| s.tool_name.clone())
            .unwrap_or_default();

        for (i, step) in steps.iter().enumerate() {
            if step.status == StepStatus::Succeeded {
                // Resume path after a worker crash: completed work stands.
                results.push(step.result.clone().unwrap_or(Value::Null));
                continue;
            }

            if token.is_cancelled() {
                return self
                    .finalize_cancelled(row, step.ordinal, &mut results, started)
                    .await;
            }

            let spec = self.catalog.get_tool_by_name(&step.tool_name).await?;
            let plan_step = &plan.steps[i];

            let mut cx = StepContext {
                execution_id: row.execution_id,
                tenant_id: row.tenant_id.clone(),
                actor_id: row.actor_id.clone(),
                worker_id: worker_id.to_string(),
                step_ordinal: step.ordinal,
                tool_name: step.tool_name.clone(),
                category: spec.category,
                action_class: spec.action_class(),
                environment: environment.clone(),
                required_permissions: spec.policy.required_permissions.clone(),
                approval_id,
                inputs: step.inputs.clone(),
                lock_keys: if spec.action_class().is_write() {
                    vec![target.lock_key()]
                } else {
                    vec![]
                },
                budget,
                step_deadline: Duration::ZERO,
                token: token.clone(),
                held_locks: None,
                issued_handles: vec![],
            };

            ovs_db::steps::mark_step_running(&self.pool, step.step_id).await?;
            self.events
                .append(
                    row.execution_id,
                    &row.tenant_id,
                    EventKind::StepStarted,
                    json!({"ordinal": step.ordinal, "tool": step.tool_name}),
                )
                .await?;
            self.events
                .progress(
                    row.execution_id,
                    &row.tenant_id,
                    ((i * 100) / total) as u8,
                    &plan_step.name,
                )
                .await?;

            // Guards, handler, teardown.
            let outcome = match self.pipeline.enter(&mut cx).await {
                Ok(()) => {
                    let out = self.dispatch_with_retries(row, &spec.category, &cx, &target).await;
                    self.pipeline.exit(&mut cx).await;
                    out
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => {
                    let result = truncate_output(result, policy.max_output_bytes);
                    let masked = self.events.masker().mask_value(&result);
                    ovs_db::steps::finish_step(
                        &self.pool,
                        step.step_id,
                        StepStatus::Succeeded,
                        Some(&masked),
                        None,
                    )
                    .await?;
                    self.events
                        .append(
                            row.execution_id,
                            &row.tenant_id,
                            EventKind::StepSucceeded,
                            json!({"ordinal": step.ordinal, "tool": step.tool_name}),
                        )
                        .await?;
                    results.push(masked);
                }
                Err(e) => {
                    match self
                        .handle_step_failure(row, step, plan_step, e, &mut results, started)
                        .await?
                    {
                        StepFailureDisposition::ContinueNext => continue,
                        StepFailureDisposition::Exec(status) => return Ok(status),
                    }
                }
            }
        }

        // Every step terminal-succeeded (or was allowed to continue).
        ovs_db::executions::set_results(&self.pool, row.execution_id, &json!({"steps": results}))
            .await?;
        self.transition(row.execution_id, ExecutionStatus::Running, ExecutionStatus::Succeeded)
            .await?;
        self.events
            .append(
                row.execution_id,
                &row.tenant_id,
                EventKind::ExecutionSucceeded,
                json!({"steps": results.len()}),
            )
            .await?;
        self.events
            .progress(row.execution_id, &row.tenant_id, 100, "done")
            .await?;

        self.metrics
            .requests_total
            .with_label_values(&["SUCCEEDED", &primary_tool])
            .inc();
        self.metrics
            .request_duration_seconds
            .with_label_values(&[&primary_tool])
            .observe(started.elapsed().as_secs_f64());
        self.cancellations.deregister(row.execution_id).await;

        Ok(ExecutionStatus::Succeeded)
    }

    /// Handler dispatch with the per-step transient retry budget. Timeouts
    /// trigger cancellation + cleanup inside the drain window.
    async fn dispatch_with_retries(
        &self,
        row: &ExecutionRow,
        category: &ovs_schemas::ToolCategory,
        cx: &StepContext,
        target: &Target,
    ) -> Result<Value, OvsError> {
        let handler = self.handlers.get(*category)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let run_cx = StepRunContext {
                tenant_id: &cx.tenant_id,
                inputs: &cx.inputs,
                target,
                deadline: cx.step_deadline,
                token: cx.token.clone(),
            };

            let result = tokio::time::timeout(cx.step_deadline, handler.run(&run_cx)).await;

            match result {
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e))
                    if e.is_retryable()
                        && attempt < STEP_RETRY_BUDGET
                        && !cx.token.is_cancelled() =>
                {
                    self.events
                        .append(
                            row.execution_id,
                            &row.tenant_id,
                            EventKind::StepRetried,
                            json!({"ordinal": cx.step_ordinal, "attempt": attempt, "error": e.message}),
                        )
                        .await?;
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // Step budget elapsed: cancel cooperatively, clean up
                    // within the drain window, then report the timeout.
                    self.cancellations
                        .cancel(row.execution_id, CancelReason::StepTimeout)
                        .await;
                    let cleanup = self
                        .cleanup
                        .run(*category, row.execution_id, &cx.inputs, DRAIN_WINDOW)
                        .await;
                    if cleanup == CleanupOutcome::ForcedClose {
                        self.events
                            .append(
                                row.execution_id,
                                &row.tenant_id,
                                EventKind::ForcedCancel,
                                json!({"ordinal": cx.step_ordinal, "reason": CancelReason::StepTimeout}),
                            )
                            .await?;
                    }
                    return Err(OvsError::timeout(format!(
                        "step {} exceeded its {}ms budget",
                        cx.step_ordinal,
                        cx.step_deadline.as_millis()
                    )));
                }
            }
        }
    }

    /// Map a step failure onto step + execution status per the propagation
    /// policy.
    async fn handle_step_failure(
        &self,
        row: &ExecutionRow,
        step: &ovs_db::steps::StepRow,
        plan_step: &ovs_schemas::PlanStep,
        error: OvsError,
        results: &mut Vec<Value>,
        started: Instant,
    ) -> Result<StepFailureDisposition, OvsError> {
        let masked_error = self
            .events
            .masker()
            .mask_value(&json!({"kind": error.kind, "message": error.message}));

        self.metrics
            .errors_total
            .with_label_values(&[error.kind.as_str(), &step.tool_name])
            .inc();

        // Cancellation (CONFLICT with a fired token) takes precedence.
        if self.cancellations.reason(row.execution_id).await.is_some()
            || error.kind == ErrorKind::Timeout
        {
            let reason = self
                .cancellations
                .reason(row.execution_id)
                .await
                .unwrap_or(CancelReason::StepTimeout);

            let (step_status, exec_status, event) = if reason.is_timeout() {
                (
                    StepStatus::TimedOut,
                    ExecutionStatus::TimedOut,
                    EventKind::ExecutionTimedOut,
                )
            } else {
                (
                    StepStatus::Cancelled,
                    ExecutionStatus::Cancelled,
                    EventKind::ExecutionCancelled,
                )
            };

            ovs_db::steps::finish_step(&self.pool, step.step_id, step_status, None, Some(&masked_error))
                .await?;
            self.finish_execution(row, exec_status, event, json!({"reason": reason}), results, started)
                .await?;
            return Ok(StepFailureDisposition::Exec(exec_status));
        }

        match error.kind {
            // Hard constraint: terminal, never retried.
            ErrorKind::Policy | ErrorKind::Validation => {
                ovs_db::steps::finish_step(
                    &self.pool,
                    step.step_id,
                    StepStatus::Failed,
                    None,
                    Some(&masked_error),
                )
                .await?;
                self.events
                    .append(
                        row.execution_id,
                        &row.tenant_id,
                        EventKind::StepFailed,
                        json!({"ordinal": step.ordinal, "error": masked_error}),
                    )
                    .await?;
                self.finish_execution(
                    row,
                    ExecutionStatus::Failed,
                    EventKind::ExecutionFailed,
                    json!({"step": step.ordinal, "kind": error.kind}),
                    results,
                    started,
                )
                .await?;
                Ok(StepFailureDisposition::Exec(ExecutionStatus::Failed))
            }

            // Everything else is a this-attempt failure; whether the
            // execution retries depends on the step's failure policy and
            // the queue-level attempt budget.
            _ => {
                self.events
                    .append(
                        row.execution_id,
                        &row.tenant_id,
                        EventKind::StepFailed,
                        json!({"ordinal": step.ordinal, "error": masked_error}),
                    )
                    .await?;

                if plan_step.on_failure == ovs_schemas::FailurePolicy::Continue {
                    // The plan tolerates this step's failure: close it out
                    // terminally and move on.
                    ovs_db::steps::finish_step(
                        &self.pool,
                        step.step_id,
                        StepStatus::Failed,
                        None,
                        Some(&masked_error),
                    )
                    .await?;
                    results.push(json!({"failed": true, "error": masked_error}));
                    return Ok(StepFailureDisposition::ContinueNext);
                }

                // Leave the step RUNNING (non-terminal) and the execution
                // RUNNING; the worker fails the queue item and the attempt
                // budget decides retry vs DLQ. A later claim re-runs this
                // step — the last non-terminal one.
                ovs_db::steps::record_step_error(&self.pool, step.step_id, &masked_error).await?;
                Ok(StepFailureDisposition::Exec(ExecutionStatus::Running))
            }
        }
    }

    async fn finish_execution(
        &self,
        row: &ExecutionRow,
        status: ExecutionStatus,
        event: EventKind,
        payload: Value,
        results: &mut Vec<Value>,
        started: Instant,
    ) -> Result<(), OvsError> {
        ovs_db::executions::set_results(&self.pool, row.execution_id, &json!({"steps": results}))
            .await?;
        self.transition(row.execution_id, ExecutionStatus::Running, status)
            .await?;
        self.events
            .append(row.execution_id, &row.tenant_id, event, payload)
            .await?;

        let primary_tool = row
            .plan
            .pointer("/steps/0/tool_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.metrics
            .requests_total
            .with_label_values(&[status.as_str(), &primary_tool])
            .inc();
        self.metrics
            .request_duration_seconds
            .with_label_values(&[&primary_tool])
            .observe(started.elapsed().as_secs_f64());

        self.cancellations.deregister(row.execution_id).await;
        Ok(())
    }

    async fn finalize_cancelled(
        &self,
        row: &ExecutionRow,
        next_ordinal: i32,
        results: &mut Vec<Value>,
        started: Instant,
    ) -> Result<ExecutionStatus, OvsError> {
        let reason = self
            .cancellations
            .reason(row.execution_id)
            .await
            .unwrap_or(CancelReason::User);

        let (status, event) = if reason.is_timeout() {
            (ExecutionStatus::TimedOut, EventKind::ExecutionTimedOut)
        } else {
            (ExecutionStatus::Cancelled, EventKind::ExecutionCancelled)
        };

        self.finish_execution(
            row,
            status,
            event,
            json!({"reason": reason, "before_step": next_ordinal}),
            results,
            started,
        )
        .await?;
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// FSM-checked status CAS. A lost CAS is a CONFLICT.
    async fn transition(
        &self,
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), OvsError> {
        ExecutionFsm::check(from, to)?;
        let moved = ovs_db::executions::cas_status(&self.pool, execution_id, from, to).await?;
        if !moved {
            return Err(OvsError::conflict(format!(
                "execution {execution_id} left {from} before the transition to {to}"
            )));
        }
        Ok(())
    }

    async fn must_fetch(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<ExecutionRow, OvsError> {
        ovs_db::executions::fetch_execution(&self.pool, tenant_id, execution_id)
            .await?
            .ok_or_else(|| OvsError::not_found(format!("no execution {execution_id}")))
    }

    /// Best-effort environment resolution: prefer the inventory record,
    /// fall back to the caller-provided target environment.
    async fn target_environment(&self, tenant_id: &str, target: &Target) -> String {
        let query = AssetQuery {
            asset_id: target.asset_id.clone(),
            search: target.hostname.clone(),
            ..Default::default()
        };
        if target.asset_id.is_some() || target.hostname.is_some() {
            if let Ok(asset) = self.resolver.resolve_target(tenant_id, &query).await {
                return asset.environment;
            }
        }
        target
            .environment
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Sum of each tool's cheapest pattern cost under a default context.
    /// Used only for the immediate-vs-background gate.
    fn estimate_cost(&self, specs: &[ovs_schemas::ToolSpec]) -> f64 {
        let ctx = SelectionContext::default();
        let vars = ctx.variables();
        specs
            .iter()
            .map(|spec| {
                spec.performance_profile
                    .values()
                    .filter_map(|perf| ovs_selector::eval::evaluate(&perf.cost_formula, &vars).ok())
                    .fold(f64::INFINITY, f64::min)
            })
            .filter(|c| c.is_finite())
            .sum()
    }

    /// Fill unset step patterns via Stage B. Failures fall back to leaving
    /// the pattern unset; tie-break fallbacks are reported for the event log.
    async fn select_patterns(
        &self,
        req: &SubmitRequest,
        specs: &[ovs_schemas::ToolSpec],
        _sla: ovs_schemas::SlaClass,
    ) -> (Plan, Vec<(String, String)>) {
        let mut plan = req.plan.clone();
        let mut fallbacks = Vec::new();
        let environment = req
            .target
            .environment
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        for (step, spec) in plan.steps.iter_mut().zip(specs) {
            if step.pattern.is_some() || spec.performance_profile.len() <= 1 {
                if step.pattern.is_none() {
                    step.pattern = spec.performance_profile.keys().next().cloned();
                }
                continue;
            }

            let selection = self
                .selector
                .select(&SelectionRequest {
                    intent: step.name.clone(),
                    mode: req.preferences.selection_mode.unwrap_or(SelectionMode::Balanced),
                    environment: environment.clone(),
                    actor_permissions: Default::default(),
                    context: SelectionContext::default(),
                    candidates: vec![spec.clone()],
                })
                .await;

            match selection {
                Ok(outcome) => {
                    if outcome.source == SelectionSource::TieBreakFallback {
                        fallbacks.push((
                            step.name.clone(),
                            "LLM tie-break unavailable; deterministic top kept".to_string(),
                        ));
                    }
                    step.pattern = Some(outcome.pattern);
                }
                Err(e) => {
                    warn!(step = %step.name, error = %e, "pattern selection failed; leaving unset");
                }
            }
        }

        (plan, fallbacks)
    }

    /// Open the approval row for an APPROVAL_REQUIRED execution.
    async fn open_approval(
        &self,
        req: &SubmitRequest,
        execution_id: Uuid,
        specs: &[ovs_schemas::ToolSpec],
        environment: &str,
    ) -> Result<Uuid, OvsError> {
        let required_permission = specs
            .iter()
            .find(|s| s.policy.requires_approval)
            .and_then(|s| s.policy.required_permissions.first().cloned())
            .unwrap_or_else(|| ovs_safety::rbac::PROD_WRITE_CAPABILITY.to_string());

        let approval_id = Uuid::new_v4();
        ovs_db::approvals::insert_approval(
            &self.pool,
            &ovs_db::approvals::NewApproval {
                approval_id,
                execution_id,
                tenant_id: req.tenant_id.clone(),
                requested_by: req.actor_id.clone(),
                required_permission: required_permission.clone(),
                runbook_url: None,
            },
        )
        .await?;

        self.events
            .append(
                execution_id,
                &req.tenant_id,
                EventKind::ApprovalRequested,
                json!({
                    "approval_id": approval_id,
                    "required_permission": required_permission,
                    "environment": environment,
                }),
            )
            .await?;

        Ok(approval_id)
    }
}

/// `min(2^attempt × base, cap)` plus jitter, for transient step retries.
fn retry_backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(RETRY_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

/// Queue-level backoff for failed attempts, exposed for the worker pool.
pub fn queue_backoff(attempt: i32) -> ChronoDuration {
    let shift = attempt.clamp(0, 10) as u32;
    let exp = 1_000u64.saturating_mul(1u64 << shift);
    let capped = exp.min(300_000);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    ChronoDuration::milliseconds((capped + jitter) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_is_bounded() {
        for attempt in 1..12 {
            let d = retry_backoff(attempt);
            assert!(d.as_millis() as u64 <= RETRY_CAP_MS + RETRY_CAP_MS / 4);
        }
    }

    #[test]
    fn queue_backoff_grows_then_caps() {
        let early = queue_backoff(1);
        let later = queue_backoff(6);
        assert!(later >= early);
        for attempt in 0..20 {
            assert!(queue_backoff(attempt).num_milliseconds() <= 375_000);
        }
    }
}
