//! Context binding, feature evaluation, and normalization.
//!
//! Every candidate `(tool, pattern)` has its formulas evaluated against the
//! bound runtime variables, then each feature is mapped into [0,1] where
//! higher is always better.

use std::collections::HashMap;

use ovs_schemas::{OvsError, PatternPerf};
use serde::{Deserialize, Serialize};

use crate::eval::evaluate;

pub const TIME_MIN_MS: f64 = 50.0;
pub const TIME_MAX_MS: f64 = 60_000.0;
pub const COST_MAX: f64 = 10.0;

// ---------------------------------------------------------------------------
// SelectionContext
// ---------------------------------------------------------------------------

/// Runtime variable bindings for formula evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionContext {
    /// Entity count (or estimate) the decision operates over.
    pub n: f64,
    /// Page size used to derive `pages`; defaults to 50.
    pub page_size: f64,
    /// Observed p95 latency statistic for the tool, milliseconds.
    pub p95_latency_ms: f64,
}

impl Default for SelectionContext {
    fn default() -> Self {
        Self {
            n: 1.0,
            page_size: 50.0,
            p95_latency_ms: 100.0,
        }
    }
}

impl SelectionContext {
    pub fn variables(&self) -> HashMap<&'static str, f64> {
        HashMap::from([
            ("N", self.n),
            ("pages", (self.n / self.page_size).ceil().max(1.0)),
            ("p95_latency", self.p95_latency_ms),
        ])
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Raw evaluated features, before normalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RawFeatures {
    pub time_ms: f64,
    pub cost: f64,
    pub complexity: f64,
    pub accuracy: f64,
    pub completeness: f64,
}

/// Features mapped into [0,1], higher is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NormalizedFeatures {
    pub time: f64,
    pub cost: f64,
    pub complexity: f64,
    pub accuracy: f64,
    pub completeness: f64,
}

/// Evaluate a pattern's formulas against the context.
pub fn evaluate_features(
    perf: &PatternPerf,
    ctx: &SelectionContext,
) -> Result<RawFeatures, OvsError> {
    let vars = ctx.variables();
    Ok(RawFeatures {
        time_ms: evaluate(&perf.time_ms_formula, &vars)?,
        cost: evaluate(&perf.cost_formula, &vars)?,
        complexity: evaluate(&perf.complexity, &vars)?,
        accuracy: perf.accuracy,
        completeness: perf.completeness,
    })
}

/// Normalize raw features into "higher is better" scores.
///
/// Time uses a log scale between 50ms and 60s; cost is linear up to 10;
/// complexity inverts its [0,1] input; accuracy and completeness pass
/// through clamped.
pub fn normalize(raw: &RawFeatures) -> NormalizedFeatures {
    let t = raw.time_ms.clamp(TIME_MIN_MS, TIME_MAX_MS);
    let time = 1.0 - (t.ln() - TIME_MIN_MS.ln()) / (TIME_MAX_MS.ln() - TIME_MIN_MS.ln());

    let cost = 1.0 - raw.cost.clamp(0.0, COST_MAX) / COST_MAX;
    let complexity = 1.0 - raw.complexity.clamp(0.0, 1.0);

    NormalizedFeatures {
        time,
        cost,
        complexity,
        accuracy: raw.accuracy.clamp(0.0, 1.0),
        completeness: raw.completeness.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(time_ms: f64, cost: f64) -> RawFeatures {
        RawFeatures {
            time_ms,
            cost,
            complexity: 0.3,
            accuracy: 0.9,
            completeness: 1.1,
        }
    }

    #[test]
    fn fastest_time_scores_one_slowest_zero() {
        let fast = normalize(&raw(50.0, 0.0));
        assert!((fast.time - 1.0).abs() < 1e-12);
        let slow = normalize(&raw(60_000.0, 0.0));
        assert!(slow.time.abs() < 1e-12);
        // clamped beyond the bounds
        let faster = normalize(&raw(1.0, 0.0));
        assert!((faster.time - 1.0).abs() < 1e-12);
    }

    #[test]
    fn time_scale_is_logarithmic() {
        let a = normalize(&raw(100.0, 0.0)).time;
        let b = normalize(&raw(1_000.0, 0.0)).time;
        let c = normalize(&raw(10_000.0, 0.0)).time;
        // equal ratios → equal decrements on a log scale
        assert!(((a - b) - (b - c)).abs() < 1e-9);
    }

    #[test]
    fn cost_is_linear_and_clamped() {
        assert!((normalize(&raw(50.0, 0.0)).cost - 1.0).abs() < 1e-12);
        assert!((normalize(&raw(50.0, 5.0)).cost - 0.5).abs() < 1e-12);
        assert!(normalize(&raw(50.0, 25.0)).cost.abs() < 1e-12);
    }

    #[test]
    fn passthrough_features_are_clamped() {
        let n = normalize(&raw(50.0, 0.0));
        assert!((n.completeness - 1.0).abs() < 1e-12, "1.1 clamps to 1.0");
        assert!((n.complexity - 0.7).abs() < 1e-12);
    }

    #[test]
    fn pages_derivation_rounds_up_and_floors_at_one() {
        let ctx = SelectionContext {
            n: 101.0,
            page_size: 50.0,
            p95_latency_ms: 100.0,
        };
        assert_eq!(ctx.variables()["pages"], 3.0);

        let ctx = SelectionContext {
            n: 0.0,
            ..Default::default()
        };
        assert_eq!(ctx.variables()["pages"], 1.0);
    }
}
