//! Mode-weighted scoring over normalized features.

use ovs_schemas::SelectionMode;
use serde::{Deserialize, Serialize};

use crate::features::NormalizedFeatures;

/// Per-feature weights. Sum to 1.0 for every mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub time: f64,
    pub cost: f64,
    pub complexity: f64,
    pub accuracy: f64,
    pub completeness: f64,
}

const PRIMARY: f64 = 0.40;
const SECONDARY: f64 = 0.15;
const UNIFORM: f64 = 0.20;

/// The weight profile for a preference mode: the mode's primary feature
/// gets 0.40, the rest 0.15 each; BALANCED is uniform 0.20.
pub fn weights_for(mode: SelectionMode) -> Weights {
    let base = Weights {
        time: SECONDARY,
        cost: SECONDARY,
        complexity: SECONDARY,
        accuracy: SECONDARY,
        completeness: SECONDARY,
    };
    match mode {
        SelectionMode::Fast => Weights {
            time: PRIMARY,
            ..base
        },
        SelectionMode::Cheap => Weights {
            cost: PRIMARY,
            ..base
        },
        SelectionMode::Simple => Weights {
            complexity: PRIMARY,
            ..base
        },
        SelectionMode::Accurate => Weights {
            accuracy: PRIMARY,
            ..base
        },
        SelectionMode::Thorough => Weights {
            completeness: PRIMARY,
            ..base
        },
        SelectionMode::Balanced => Weights {
            time: UNIFORM,
            cost: UNIFORM,
            complexity: UNIFORM,
            accuracy: UNIFORM,
            completeness: UNIFORM,
        },
    }
}

/// Weighted sum in [0,1].
pub fn score(features: &NormalizedFeatures, weights: &Weights) -> f64 {
    features.time * weights.time
        + features.cost * weights.cost
        + features.complexity * weights.complexity
        + features.accuracy * weights.accuracy
        + features.completeness * weights.completeness
}

/// Human-readable justification: features by contribution, largest first.
pub fn top_contributors(features: &NormalizedFeatures, weights: &Weights) -> Vec<String> {
    let mut parts = [
        ("time", features.time * weights.time),
        ("cost", features.cost * weights.cost),
        ("complexity", features.complexity * weights.complexity),
        ("accuracy", features.accuracy * weights.accuracy),
        ("completeness", features.completeness * weights.completeness),
    ];
    parts.sort_by(|a, b| b.1.total_cmp(&a.1));
    parts
        .iter()
        .take(3)
        .map(|(name, contribution)| format!("{name} contributed {contribution:.3}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(time: f64, accuracy: f64) -> NormalizedFeatures {
        NormalizedFeatures {
            time,
            cost: 0.5,
            complexity: 0.5,
            accuracy,
            completeness: 0.5,
        }
    }

    #[test]
    fn every_mode_sums_to_one() {
        for mode in [
            SelectionMode::Fast,
            SelectionMode::Accurate,
            SelectionMode::Thorough,
            SelectionMode::Cheap,
            SelectionMode::Simple,
            SelectionMode::Balanced,
        ] {
            let w = weights_for(mode);
            let sum = w.time + w.cost + w.complexity + w.accuracy + w.completeness;
            assert!((sum - 1.0).abs() < 1e-12, "{mode:?} sums to {sum}");
        }
    }

    #[test]
    fn fast_mode_prefers_the_faster_candidate() {
        let w = weights_for(SelectionMode::Fast);
        let quick_sloppy = features(0.9, 0.5);
        let slow_precise = features(0.3, 1.0);
        assert!(score(&quick_sloppy, &w) > score(&slow_precise, &w));

        // same candidates, ACCURATE flips the ranking
        let w = weights_for(SelectionMode::Accurate);
        assert!(score(&slow_precise, &w) > score(&quick_sloppy, &w));
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let w = weights_for(SelectionMode::Balanced);
        let all_one = NormalizedFeatures {
            time: 1.0,
            cost: 1.0,
            complexity: 1.0,
            accuracy: 1.0,
            completeness: 1.0,
        };
        assert!((score(&all_one, &w) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn justification_orders_by_contribution() {
        let w = weights_for(SelectionMode::Fast);
        let f = features(1.0, 0.1);
        let just = top_contributors(&f, &w);
        assert!(just[0].starts_with("time "));
        assert_eq!(just.len(), 3);
    }
}
