//! Stage B — deterministic tool selection with bounded LLM tie-breaking.
//!
//! The pipeline is deterministic first: enumerate `(tool, pattern)`
//! candidates, bind runtime variables, evaluate the performance formulas
//! through the safe math evaluator, normalize, apply the hard policy filter,
//! and rank by mode-weighted score. Only when the top-2 gap falls inside the
//! ambiguity epsilon does the LLM tie-breaker run — and its failure or
//! timeout falls back to the deterministic top-1.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use ovs_schemas::{OvsError, SelectionMode, ToolSpec};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod eval;
pub mod features;
pub mod policy;
pub mod scoring;
pub mod tiebreak;

use features::{evaluate_features, normalize, NormalizedFeatures, RawFeatures, SelectionContext};
use ovs_metrics::Metrics;
use policy::{check_policy, soft_constraints, PolicyViolation, SoftConstraints};
use scoring::{score, top_contributors, weights_for};
use tiebreak::TieBreaker;

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// One selection request. Candidates arrive pre-filtered by capability via
/// the catalog; everything else is decided here.
pub struct SelectionRequest {
    pub intent: String,
    pub mode: SelectionMode,
    pub environment: String,
    pub actor_permissions: HashSet<String>,
    pub context: SelectionContext,
    pub candidates: Vec<ToolSpec>,
}

/// A scored surviving candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub tool_name: String,
    pub pattern: String,
    pub score: f64,
    pub raw: RawFeatures,
    pub features: NormalizedFeatures,
    pub flags: SoftConstraints,
}

/// A candidate removed before ranking, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovedCandidate {
    pub tool_name: String,
    pub pattern: String,
    pub violation: Option<PolicyViolation>,
    /// Set when the formulas themselves failed to evaluate.
    pub evaluation_error: Option<String>,
}

/// How the final choice was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionSource {
    Deterministic,
    LlmTieBreak,
    TieBreakFallback,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::LlmTieBreak => "llm_tie_break",
            Self::TieBreakFallback => "tie_break_fallback",
        }
    }
}

/// The full selection outcome, also serialized by `/selector/explain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub tool_name: String,
    pub pattern: String,
    pub score: f64,
    pub source: SelectionSource,
    pub justification: Vec<String>,
    pub flags: SoftConstraints,
    /// Execution hints, e.g. batch size derived from the pattern config.
    pub hints: serde_json::Value,
    pub ranked: Vec<CandidateScore>,
    pub removed: Vec<RemovedCandidate>,
    pub tie_break_fired: bool,
    pub tie_break_rationale: Option<String>,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

pub struct Selector {
    epsilon: f64,
    llm_timeout: Duration,
    tie_breaker: Option<Box<dyn TieBreaker>>,
    metrics: &'static Metrics,
}

impl Selector {
    pub fn new(
        epsilon: f64,
        llm_timeout: Duration,
        tie_breaker: Option<Box<dyn TieBreaker>>,
    ) -> Self {
        Self {
            epsilon,
            llm_timeout,
            tie_breaker,
            metrics: Metrics::global(),
        }
    }

    /// Run the full pipeline.
    ///
    /// # Errors
    /// `NOT_FOUND` when no candidate survives enumeration + policy.
    pub async fn select(&self, req: &SelectionRequest) -> Result<SelectionOutcome, OvsError> {
        let started = Instant::now();
        let result = self.select_inner(req).await;

        let (status, source) = match &result {
            Ok(outcome) => ("ok", outcome.source.as_str()),
            Err(_) => ("error", "none"),
        };
        self.metrics
            .selector_requests_total
            .with_label_values(&[status, source])
            .inc();
        self.metrics
            .selector_request_duration_seconds
            .with_label_values(&[source])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn select_inner(&self, req: &SelectionRequest) -> Result<SelectionOutcome, OvsError> {
        let weights = weights_for(req.mode);
        let mut ranked: Vec<CandidateScore> = Vec::new();
        let mut removed: Vec<RemovedCandidate> = Vec::new();

        // 1–5: enumerate, evaluate, normalize, policy-filter.
        for tool in &req.candidates {
            if !tool.enabled {
                continue;
            }
            for (pattern, perf) in &tool.performance_profile {
                let raw = match evaluate_features(perf, &req.context) {
                    Ok(raw) => raw,
                    Err(e) => {
                        removed.push(RemovedCandidate {
                            tool_name: tool.tool_name.clone(),
                            pattern: pattern.clone(),
                            violation: None,
                            evaluation_error: Some(e.message.clone()),
                        });
                        continue;
                    }
                };

                if let Some(violation) = check_policy(
                    &tool.policy,
                    raw.cost,
                    &req.environment,
                    &req.actor_permissions,
                ) {
                    removed.push(RemovedCandidate {
                        tool_name: tool.tool_name.clone(),
                        pattern: pattern.clone(),
                        violation: Some(violation),
                        evaluation_error: None,
                    });
                    continue;
                }

                let norm = normalize(&raw);
                ranked.push(CandidateScore {
                    tool_name: tool.tool_name.clone(),
                    pattern: pattern.clone(),
                    score: score(&norm, &weights),
                    raw,
                    features: norm,
                    flags: soft_constraints(&tool.policy, raw.time_ms),
                });
            }
        }

        if ranked.is_empty() {
            return Err(OvsError::not_found(
                "no tool candidate survived enumeration and policy",
            ));
        }

        // 6: rank descending; deterministic tie order by name then pattern.
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.tool_name.cmp(&b.tool_name))
                .then_with(|| a.pattern.cmp(&b.pattern))
        });

        // 7: ambiguity detection and bounded tie-break.
        let mut winner = 0usize;
        let mut source = SelectionSource::Deterministic;
        let mut tie_break_fired = false;
        let mut rationale = None;

        if ranked.len() >= 2 && (ranked[0].score - ranked[1].score) < self.epsilon {
            if let Some(breaker) = &self.tie_breaker {
                tie_break_fired = true;
                let pair = [&ranked[0], &ranked[1]];
                match tokio::time::timeout(self.llm_timeout, breaker.break_tie(&req.intent, pair))
                    .await
                {
                    Ok(Ok(choice)) => {
                        winner = choice.winner;
                        rationale = Some(choice.rationale);
                        source = SelectionSource::LlmTieBreak;
                        debug!(winner, "tie-break resolved by LLM");
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "tie-break failed; keeping deterministic top");
                        source = SelectionSource::TieBreakFallback;
                    }
                    Err(_) => {
                        warn!("tie-break timed out; keeping deterministic top");
                        source = SelectionSource::TieBreakFallback;
                    }
                }
            }
        }

        let chosen = ranked[winner].clone();
        let hints = self.hints_for(req, &chosen);
        let justification = top_contributors(&chosen.features, &weights);

        Ok(SelectionOutcome {
            tool_name: chosen.tool_name,
            pattern: chosen.pattern,
            score: chosen.score,
            source,
            justification,
            flags: chosen.flags,
            hints,
            ranked,
            removed,
            tie_break_fired,
            tie_break_rationale: rationale,
        })
    }

    /// Execution hints from the winning pattern's config.
    fn hints_for(&self, req: &SelectionRequest, chosen: &CandidateScore) -> serde_json::Value {
        let pattern_cfg = req
            .candidates
            .iter()
            .find(|t| t.tool_name == chosen.tool_name)
            .and_then(|t| t.patterns.get(&chosen.pattern))
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let batch_size = pattern_cfg
            .get("page_size")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(req.context.page_size as u64);

        serde_json::json!({
            "batch_size": batch_size,
            "estimated_pages": (req.context.n / req.context.page_size).ceil().max(1.0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::tiebreak::TieBreakChoice;
    use ovs_schemas::{ParamSpec, PatternPerf, Platform, ToolCategory, ToolPolicy};
    use std::collections::BTreeMap;

    fn tool(name: &str, time_formula: &str, accuracy: f64, production_safe: bool) -> ToolSpec {
        ToolSpec {
            tool_name: name.to_string(),
            version: 1,
            platform: Platform::Cross,
            category: ToolCategory::AssetQuery,
            capabilities: vec!["asset.lookup".into()],
            patterns: BTreeMap::from([(
                "default".to_string(),
                serde_json::json!({"page_size": 25}),
            )]),
            inputs: vec![ParamSpec {
                name: "search".into(),
                param_type: "string".into(),
                required: true,
                description: None,
            }],
            expected_outputs: vec![],
            policy: ToolPolicy {
                production_safe,
                ..Default::default()
            },
            performance_profile: BTreeMap::from([(
                "default".to_string(),
                PatternPerf {
                    time_ms_formula: time_formula.to_string(),
                    cost_formula: "0".to_string(),
                    complexity: "0.2".to_string(),
                    accuracy,
                    completeness: 0.9,
                },
            )]),
            enabled: true,
        }
    }

    fn request(candidates: Vec<ToolSpec>, mode: SelectionMode, env: &str) -> SelectionRequest {
        SelectionRequest {
            intent: "find the asset".into(),
            mode,
            environment: env.into(),
            actor_permissions: HashSet::new(),
            context: SelectionContext::default(),
            candidates,
        }
    }

    #[tokio::test]
    async fn deterministic_ranking_picks_the_clear_winner() {
        let sel = Selector::new(0.08, Duration::from_millis(800), None);
        let req = request(
            vec![
                tool("slowpoke", "30000", 0.9, true),
                tool("zippy", "100", 0.9, true),
            ],
            SelectionMode::Fast,
            "staging",
        );
        let out = sel.select(&req).await.unwrap();
        assert_eq!(out.tool_name, "zippy");
        assert_eq!(out.source, SelectionSource::Deterministic);
        assert!(!out.tie_break_fired);
    }

    #[tokio::test]
    async fn production_unsafe_candidates_never_rank() {
        let sel = Selector::new(0.08, Duration::from_millis(800), None);
        let req = request(
            vec![
                tool("unsafe_fast", "50", 0.99, false),
                tool("safe_slow", "5000", 0.8, true),
            ],
            SelectionMode::Fast,
            "production",
        );
        let out = sel.select(&req).await.unwrap();
        assert_eq!(out.tool_name, "safe_slow");
        assert!(out
            .removed
            .iter()
            .any(|r| r.tool_name == "unsafe_fast"
                && r.violation == Some(PolicyViolation::NotProductionSafe)));
        assert!(out.ranked.iter().all(|c| c.tool_name != "unsafe_fast"));
    }

    struct PickSecond;

    #[async_trait]
    impl TieBreaker for PickSecond {
        async fn break_tie(
            &self,
            _intent: &str,
            _pair: [&CandidateScore; 2],
        ) -> Result<TieBreakChoice, OvsError> {
            Ok(TieBreakChoice {
                winner: 1,
                rationale: "second reads better".into(),
            })
        }
    }

    struct HangingBreaker;

    #[async_trait]
    impl TieBreaker for HangingBreaker {
        async fn break_tie(
            &self,
            _intent: &str,
            _pair: [&CandidateScore; 2],
        ) -> Result<TieBreakChoice, OvsError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn ambiguous_gap_consults_the_tie_breaker() {
        let sel = Selector::new(0.08, Duration::from_millis(800), Some(Box::new(PickSecond)));
        // identical formulas → zero gap; names break the deterministic tie
        let req = request(
            vec![
                tool("alpha", "100", 0.9, true),
                tool("beta", "100", 0.9, true),
            ],
            SelectionMode::Balanced,
            "staging",
        );
        let out = sel.select(&req).await.unwrap();
        assert!(out.tie_break_fired);
        assert_eq!(out.source, SelectionSource::LlmTieBreak);
        assert_eq!(out.tool_name, "beta", "tie-breaker picked index 1");
        assert_eq!(out.tie_break_rationale.as_deref(), Some("second reads better"));
    }

    #[tokio::test(start_paused = true)]
    async fn tie_break_timeout_falls_back_to_deterministic_top() {
        let sel = Selector::new(
            0.08,
            Duration::from_millis(800),
            Some(Box::new(HangingBreaker)),
        );
        let req = request(
            vec![
                tool("alpha", "100", 0.9, true),
                tool("beta", "100", 0.9, true),
            ],
            SelectionMode::Balanced,
            "staging",
        );
        let out = sel.select(&req).await.unwrap();
        assert!(out.tie_break_fired);
        assert_eq!(out.source, SelectionSource::TieBreakFallback);
        assert_eq!(out.tool_name, "alpha", "deterministic top stands");
    }

    #[tokio::test]
    async fn empty_survivor_set_is_not_found() {
        let sel = Selector::new(0.08, Duration::from_millis(800), None);
        let req = request(
            vec![tool("unsafe_only", "50", 0.9, false)],
            SelectionMode::Fast,
            "production",
        );
        let err = sel.select(&req).await.unwrap_err();
        assert_eq!(err.kind, ovs_schemas::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn broken_formula_removes_only_that_candidate() {
        let sel = Selector::new(0.08, Duration::from_millis(800), None);
        let req = request(
            vec![
                tool("broken", "1 / 0", 0.9, true),
                tool("fine", "100", 0.9, true),
            ],
            SelectionMode::Fast,
            "staging",
        );
        let out = sel.select(&req).await.unwrap();
        assert_eq!(out.tool_name, "fine");
        assert!(out
            .removed
            .iter()
            .any(|r| r.tool_name == "broken" && r.evaluation_error.is_some()));
    }

    #[tokio::test]
    async fn hints_carry_the_pattern_batch_size() {
        let sel = Selector::new(0.08, Duration::from_millis(800), None);
        let req = request(vec![tool("t", "100", 0.9, true)], SelectionMode::Fast, "dev");
        let out = sel.select(&req).await.unwrap();
        assert_eq!(out.hints["batch_size"], 25);
    }
}
