//! Global, process-wide fuzzing statistics (`SPEC_FULL.md` §3, §5).
//!
//! `GlobalStats` is initialized once before workers start and torn down
//! only at shutdown after workers join. Every field is monotonically
//! non-decreasing except the derived averages; readers (the dashboard and
//! the scorer) may observe slightly stale counts from concurrent writers —
//! that's fine, scores are advisory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::optvec::{OptimizationVector, NUM_FEATURES};

#[derive(Debug, Clone, Default)]
pub struct MutatorOutcomeCounts {
    pub attempts_success: u64,
    pub attempts_skip: u64,
    pub attempts_failure: u64,
    pub eval_improved: u64,
    pub eval_no_improvement: u64,
    pub eval_bug: u64,
    pub eval_timeout: u64,
    pub eval_failure: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum MutationAttemptStatus {
    Success,
    Skip,
    Failure,
}

#[derive(Debug, Clone, Copy)]
pub enum EvaluationOutcome {
    Improved,
    NoImprovement,
    Bug,
    Timeout,
    Failure,
}

pub struct GlobalStats {
    run_count: AtomicU64,
    feature_counts: [AtomicU64; NUM_FEATURES],
    pair_counts: RwLock<HashMap<(usize, usize), u64>>,
    score_sum_bits: AtomicU64,
    score_max_bits: AtomicU64,
    runtime_sum_ms_bits: AtomicU64,
    runtime_count: AtomicU64,
    mutator_outcomes: RwLock<HashMap<String, MutatorOutcomeCounts>>,
    bucket_counts: RwLock<HashMap<String, u64>>,
    int_timeouts: AtomicU64,
    jit_timeouts: AtomicU64,
    unique_bug_buckets: AtomicU64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStats {
    pub fn new() -> Self {
        GlobalStats {
            run_count: AtomicU64::new(0),
            feature_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            pair_counts: RwLock::new(HashMap::new()),
            score_sum_bits: AtomicU64::new(0f64.to_bits()),
            score_max_bits: AtomicU64::new(0f64.to_bits()),
            runtime_sum_ms_bits: AtomicU64::new(0f64.to_bits()),
            runtime_count: AtomicU64::new(0),
            mutator_outcomes: RwLock::new(HashMap::new()),
            bucket_counts: RwLock::new(HashMap::new()),
            int_timeouts: AtomicU64::new(0),
            jit_timeouts: AtomicU64::new(0),
            unique_bug_buckets: AtomicU64::new(0),
        }
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub fn feature_count(&self, idx: usize) -> u64 {
        self.feature_counts[idx].load(Ordering::Relaxed)
    }

    pub fn feature_avg_freq(&self, idx: usize) -> f64 {
        let n = self.run_count().max(1) as f64;
        self.feature_count(idx) as f64 / n
    }

    fn pair_key(i: usize, j: usize) -> (usize, usize) {
        if i <= j {
            (i, j)
        } else {
            (j, i)
        }
    }

    pub fn pair_count(&self, i: usize, j: usize) -> u64 {
        *self.pair_counts.read().get(&Self::pair_key(i, j)).unwrap_or(&0)
    }

    /// Coverage counters (feature presence, pair presence, N) are
    /// incremented only for the hot vector actually chosen, only once per
    /// accepted case. Never call this from a score preview.
    pub fn record_acceptance_coverage(&self, vector: &OptimizationVector) {
        self.run_count.fetch_add(1, Ordering::Relaxed);
        let active: Vec<usize> = (0..NUM_FEATURES).filter(|&i| vector.0[i] > 0).collect();
        for &i in &active {
            self.feature_counts[i].fetch_add(1, Ordering::Relaxed);
        }
        if active.len() >= 2 {
            let mut pairs = self.pair_counts.write();
            for a in 0..active.len() {
                for b in (a + 1)..active.len() {
                    *pairs.entry(Self::pair_key(active[a], active[b])).or_insert(0) += 1;
                }
            }
        }
    }

    pub fn record_score(&self, score: f64) {
        add_f64_atomic(&self.score_sum_bits, score);
        max_f64_atomic(&self.score_max_bits, score);
    }

    pub fn score_sum(&self) -> f64 {
        f64::from_bits(self.score_sum_bits.load(Ordering::Relaxed))
    }

    pub fn score_max(&self) -> f64 {
        f64::from_bits(self.score_max_bits.load(Ordering::Relaxed))
    }

    pub fn record_runtime_ms(&self, ms: f64) {
        add_f64_atomic(&self.runtime_sum_ms_bits, ms);
        self.runtime_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn global_avg_runtime_ms(&self) -> f64 {
        let count = self.runtime_count.load(Ordering::Relaxed).max(1) as f64;
        f64::from_bits(self.runtime_sum_ms_bits.load(Ordering::Relaxed)) / count
    }

    pub fn record_mutation_attempt(&self, mutator: &str, status: MutationAttemptStatus) {
        let mut map = self.mutator_outcomes.write();
        let entry = map.entry(mutator.to_string()).or_default();
        match status {
            MutationAttemptStatus::Success => entry.attempts_success += 1,
            MutationAttemptStatus::Skip => entry.attempts_skip += 1,
            MutationAttemptStatus::Failure => entry.attempts_failure += 1,
        }
    }

    pub fn record_evaluation(&self, mutator: &str, outcome: EvaluationOutcome) {
        let mut map = self.mutator_outcomes.write();
        let entry = map.entry(mutator.to_string()).or_default();
        match outcome {
            EvaluationOutcome::Improved => entry.eval_improved += 1,
            EvaluationOutcome::NoImprovement => entry.eval_no_improvement += 1,
            EvaluationOutcome::Bug => entry.eval_bug += 1,
            EvaluationOutcome::Timeout => entry.eval_timeout += 1,
            EvaluationOutcome::Failure => entry.eval_failure += 1,
        }
    }

    pub fn mutator_outcomes(&self, mutator: &str) -> MutatorOutcomeCounts {
        self.mutator_outcomes.read().get(mutator).cloned().unwrap_or_default()
    }

    pub fn bump_int_timeout(&self) {
        self.int_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn int_timeouts(&self) -> u64 {
        self.int_timeouts.load(Ordering::Relaxed)
    }

    pub fn bump_jit_timeout(&self) {
        self.jit_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jit_timeouts(&self) -> u64 {
        self.jit_timeouts.load(Ordering::Relaxed)
    }

    /// Returns `true` the first time this bucket id is observed, updating
    /// `unique_bug_buckets` accordingly.
    pub fn bump_bucket_count(&self, bucket_id: &str) -> bool {
        let mut map = self.bucket_counts.write();
        let is_new = !map.contains_key(bucket_id);
        *map.entry(bucket_id.to_string()).or_insert(0) += 1;
        if is_new {
            self.unique_bug_buckets.fetch_add(1, Ordering::Relaxed);
        }
        is_new
    }

    pub fn unique_bug_buckets(&self) -> u64 {
        self.unique_bug_buckets.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self, bucket_id: &str) -> u64 {
        *self.bucket_counts.read().get(bucket_id).unwrap_or(&0)
    }
}

fn add_f64_atomic(bits: &AtomicU64, delta: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        let new = f64::from_bits(current) + delta;
        match bits.compare_exchange_weak(
            current,
            new.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn max_f64_atomic(bits: &AtomicU64, candidate: f64) {
    let mut current = bits.load(Ordering::Relaxed);
    loop {
        if f64::from_bits(current) >= candidate {
            break;
        }
        match bits.compare_exchange_weak(
            current,
            candidate.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_counters_are_monotone() {
        let stats = GlobalStats::new();
        let mut v = OptimizationVector::zero();
        v.set(0, 1);
        v.set(1, 1);
        stats.record_acceptance_coverage(&v);
        let n0 = stats.run_count();
        let f0 = stats.feature_count(0);
        let p0 = stats.pair_count(0, 1);
        stats.record_acceptance_coverage(&v);
        assert!(stats.run_count() >= n0);
        assert!(stats.feature_count(0) >= f0);
        assert!(stats.pair_count(0, 1) >= p0);
    }

    #[test]
    fn single_active_feature_does_not_bump_pairs() {
        let stats = GlobalStats::new();
        let mut v = OptimizationVector::zero();
        v.set(0, 5);
        stats.record_acceptance_coverage(&v);
        assert_eq!(stats.pair_count(0, 1), 0);
    }

    #[test]
    fn bucket_count_first_observation_is_new() {
        let stats = GlobalStats::new();
        assert!(stats.bump_bucket_count("b_abc"));
        assert!(!stats.bump_bucket_count("b_abc"));
        assert_eq!(stats.unique_bug_buckets(), 1);
        assert_eq!(stats.bucket_count("b_abc"), 2);
    }

    #[test]
    fn score_max_tracks_highest_seen() {
        let stats = GlobalStats::new();
        stats.record_score(0.3);
        stats.record_score(0.9);
        stats.record_score(0.1);
        assert!((stats.score_max() - 0.9).abs() < 1e-12);
        assert!((stats.score_sum() - 1.3).abs() < 1e-12);
    }
}
