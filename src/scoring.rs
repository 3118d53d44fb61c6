//! Interestingness scoring modes (`SPEC_FULL.md` §4.3). The Evaluator picks
//! the hot method vector, scores it with the configured mode, and may
//! additionally apply a runtime weight.

use std::str::FromStr;

use crate::error::ConfigError;
use crate::optvec::{OptimizationVector, NUM_FEATURES};
use crate::stats::GlobalStats;

const LIFT_CAP: f64 = 8.0;
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    PfIdf,
    AbsoluteCount,
    PairCoverage,
    InteractionDiversity,
    NovelFeatureBonus,
    InteractionPairWeighted,
    Uniform,
}

impl FromStr for ScoringMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pf-idf" => Ok(Self::PfIdf),
            "absolute-count" => Ok(Self::AbsoluteCount),
            "pair-coverage" => Ok(Self::PairCoverage),
            "interaction-diversity" => Ok(Self::InteractionDiversity),
            "novel-feature-bonus" => Ok(Self::NovelFeatureBonus),
            "interaction-pair-weighted" => Ok(Self::InteractionPairWeighted),
            "uniform" => Ok(Self::Uniform),
            other => Err(ConfigError::InvalidFlag { flag: "scoring", value: other.to_string() }),
        }
    }
}

fn active_features(vector: &OptimizationVector) -> Vec<usize> {
    (0..NUM_FEATURES).filter(|&i| vector.0[i] > 0).collect()
}

fn pairs(active: &[usize]) -> impl Iterator<Item = (usize, usize)> + '_ {
    (0..active.len()).flat_map(move |a| ((a + 1)..active.len()).map(move |b| (active[a], active[b])))
}

fn pair_weight(n: u64, n_ij: u64) -> f64 {
    if n == 0 {
        // Nothing has ever been seen: treat every pair as maximally novel.
        return 1.0;
    }
    ((n as f64 + 1.0) / (n_ij as f64 + 1.0)).ln() / (n as f64 + 1.0).ln()
}

fn lift(count: u64, avg_freq: f64) -> f64 {
    (count as f64 / (avg_freq + EPS)).min(LIFT_CAP)
}

/// Raw, un-normalized `max(0, s_ij * w_ij)` terms for every unordered pair
/// of active features. Shared by PF-IDF and its pair-weighted variant.
fn pf_idf_terms(vector: &OptimizationVector, stats: &GlobalStats) -> Vec<f64> {
    let active = active_features(vector);
    if active.len() < 2 {
        return Vec::new();
    }
    let n = stats.run_count();
    pairs(&active)
        .map(|(i, j)| {
            let lift_i = lift(vector.0[i], stats.feature_avg_freq(i));
            let lift_j = lift(vector.0[j], stats.feature_avg_freq(j));
            let s_ij = (lift_i * lift_j).sqrt() - 1.0;
            let w_ij = pair_weight(n, stats.pair_count(i, j));
            (s_ij * w_ij).max(0.0)
        })
        .collect()
}

fn pf_idf(vector: &OptimizationVector, stats: &GlobalStats) -> f64 {
    let terms = pf_idf_terms(vector, stats);
    if terms.is_empty() {
        return 0.0;
    }
    terms.iter().sum::<f64>() / terms.len() as f64
}

fn interaction_pair_weighted(vector: &OptimizationVector, stats: &GlobalStats) -> f64 {
    let terms = pf_idf_terms(vector, stats);
    if terms.is_empty() {
        return 0.0;
    }
    terms.iter().sum::<f64>() / (terms.len() as f64).sqrt()
}

fn pair_coverage(vector: &OptimizationVector, stats: &GlobalStats) -> f64 {
    let active = active_features(vector);
    if active.len() < 2 {
        return 0.0;
    }
    let unseen_singletons = active.iter().filter(|&&i| stats.feature_count(i) == 0).count();
    let unseen_pairs = pairs(&active).filter(|&(i, j)| stats.pair_count(i, j) == 0).count();
    let raw = unseen_pairs as f64 + 0.5 * unseen_singletons as f64;
    // Floor ensures any vector with >= 2 active features retains a
    // non-zero score even once every pair/singleton has been seen before.
    if raw <= 0.0 {
        0.01
    } else {
        raw
    }
}

fn interaction_diversity(vector: &OptimizationVector) -> f64 {
    (vector.total().saturating_sub(vector.max_single_feature())) as f64
}

fn novel_feature_bonus(vector: &OptimizationVector, stats: &GlobalStats) -> f64 {
    let active = active_features(vector);
    let unseen = active.iter().filter(|&&i| stats.feature_count(i) == 0).count();
    unseen as f64 + 0.1 * vector.total() as f64
}

impl ScoringMode {
    pub fn compute(&self, vector: &OptimizationVector, stats: &GlobalStats) -> f64 {
        let raw = match self {
            ScoringMode::PfIdf => pf_idf(vector, stats),
            ScoringMode::AbsoluteCount => vector.total() as f64,
            ScoringMode::PairCoverage => pair_coverage(vector, stats),
            ScoringMode::InteractionDiversity => interaction_diversity(vector),
            ScoringMode::NovelFeatureBonus => novel_feature_bonus(vector, stats),
            ScoringMode::InteractionPairWeighted => interaction_pair_weighted(vector, stats),
            ScoringMode::Uniform => 1.0,
        };
        // A scorer producing a non-positive score is treated as 0 per
        // SPEC_FULL.md §7; callers must not update coverage counters for it.
        if raw.is_finite() && raw > 0.0 {
            raw
        } else {
            0.0
        }
    }
}

/// `w_time = 1 / (1 + tc_avg_ms / global_avg_ms)`, floored at 0.1, to
/// prefer fast-running candidates when the Evaluator opts in.
pub fn runtime_weight(tc_avg_ms: f64, global_avg_ms: f64) -> f64 {
    let denom = global_avg_ms.max(EPS);
    let raw = 1.0 / (1.0 + tc_avg_ms / denom);
    raw.max(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(counts: &[u64]) -> OptimizationVector {
        let mut v = OptimizationVector::zero();
        for (i, &c) in counts.iter().enumerate() {
            v.set(i, c);
        }
        v
    }

    #[test]
    fn pf_idf_is_nonnegative_for_two_active_features() {
        let stats = GlobalStats::new();
        let v = vector(&[3, 2]);
        let score = ScoringMode::PfIdf.compute(&v, &stats);
        assert!(score >= 0.0);
    }

    #[test]
    fn pf_idf_is_zero_when_all_lifts_are_at_most_one() {
        let stats = GlobalStats::new();
        // Seed stats so avg_freq for features 0 and 1 is exactly 1.0 (seen
        // on every one of 10 runs), matching counts of 1 each -> lift == 1.
        for _ in 0..10 {
            stats.record_acceptance_coverage(&vector(&[1, 1]));
        }
        let v = vector(&[1, 1]);
        let score = ScoringMode::PfIdf.compute(&v, &stats);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn pf_idf_requires_two_active_features() {
        let stats = GlobalStats::new();
        let v = vector(&[5]);
        assert_eq!(ScoringMode::PfIdf.compute(&v, &stats), 0.0);
    }

    #[test]
    fn uniform_is_always_one() {
        let stats = GlobalStats::new();
        assert_eq!(ScoringMode::Uniform.compute(&vector(&[0]), &stats), 1.0);
    }

    #[test]
    fn interaction_diversity_subtracts_dominant_feature() {
        let stats = GlobalStats::new();
        let v = vector(&[5, 3, 1]);
        assert_eq!(ScoringMode::InteractionDiversity.compute(&v, &stats), 4.0);
    }

    #[test]
    fn pair_coverage_has_a_floor_for_fully_seen_vectors() {
        let stats = GlobalStats::new();
        let v = vector(&[1, 1]);
        for _ in 0..5 {
            stats.record_acceptance_coverage(&v);
        }
        let score = ScoringMode::PairCoverage.compute(&v, &stats);
        assert!(score > 0.0);
    }

    #[test]
    fn runtime_weight_is_floored() {
        assert!((runtime_weight(1_000_000.0, 1.0) - 0.1).abs() < 1e-9);
        assert_eq!(runtime_weight(0.0, 1.0), 1.0);
    }

    #[test]
    fn invalid_scoring_mode_string_is_config_error() {
        assert!("nonsense".parse::<ScoringMode>().is_err());
    }
}
