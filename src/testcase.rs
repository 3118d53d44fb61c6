//! Core data-model entities from `SPEC_FULL.md` §3.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::optvec::{Fingerprint, OptimizationVectors};

/// How a `TestCase` came to exist. `Seed` is the only tag with
/// `mutation_depth == 0`; every other case was produced by applying the
/// named external mutator to a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutator {
    Seed,
    Named(String),
}

/// Monotonically increasing counter backing globally-unique test case
/// names within one process. Combined with a session-scoped prefix so
/// names stay unique even if two sessions share a filesystem.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_case_ordinal() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A synthesized (or seed) source program and everything the pipeline has
/// learned about it so far. Parent/seed-ancestor references are by name
/// only, never by pointer, so a parent can be destroyed while children
/// referencing it by name are still in flight (`SPEC_FULL.md` §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Globally unique within the session.
    pub name: String,
    pub seed_ancestor: String,
    pub parent: Option<String>,
    pub mutator: Mutator,
    pub mutation_depth: u32,

    pub priority: f64,
    pub score: f64,
    pub times_selected: u64,
    pub active_champion: bool,

    /// The hot class/method this case's fingerprint and score were derived
    /// from, if it has been evaluated.
    pub hot_class: Option<String>,
    pub hot_method: Option<String>,

    pub vectors: Option<OptimizationVectors>,
    pub parent_vectors: Option<OptimizationVectors>,
    pub fingerprint: Option<Fingerprint>,

    pub interpreter_runtime_ns: Option<u64>,
    pub jit_runtime_ns: Option<u64>,
}

impl TestCase {
    pub fn new_seed(name: String) -> Self {
        TestCase {
            seed_ancestor: name.clone(),
            parent: None,
            mutator: Mutator::Seed,
            mutation_depth: 0,
            priority: 0.0,
            score: 0.0,
            times_selected: 0,
            active_champion: false,
            hot_class: None,
            hot_method: None,
            vectors: None,
            parent_vectors: None,
            fingerprint: None,
            interpreter_runtime_ns: None,
            jit_runtime_ns: None,
            name,
        }
    }

    pub fn new_child(name: String, parent: &TestCase, mutator: String) -> Self {
        TestCase {
            name,
            seed_ancestor: parent.seed_ancestor.clone(),
            parent: Some(parent.name.clone()),
            mutator: Mutator::Named(mutator),
            mutation_depth: parent.mutation_depth + 1,
            priority: 0.0,
            score: 0.0,
            times_selected: 0,
            active_champion: false,
            hot_class: None,
            hot_method: None,
            vectors: None,
            parent_vectors: parent.vectors.clone(),
            fingerprint: None,
            interpreter_runtime_ns: None,
            jit_runtime_ns: None,
        }
    }

    /// Invariant (`SPEC_FULL.md` §8): `mutation_depth == 0 <=> mutator == Seed`.
    pub fn is_seed(&self) -> bool {
        matches!(self.mutator, Mutator::Seed)
    }

    /// `priority = score / (1 + times_selected)`. Selection decays priority
    /// so frequently-selected champions naturally yield to fresher peers.
    pub fn recompute_priority(&mut self) {
        self.priority = self.score / (1.0 + self.times_selected as f64);
    }

    /// Mark this case as popped by the Mutation Worker: increments
    /// `times_selected` and recomputes `priority`.
    pub fn mark_selected(&mut self) {
        self.times_selected += 1;
        self.recompute_priority();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub wall_time_ns: u64,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Timed-out implies the exit code is unreliable.
    pub fn exit_code_reliable(&self) -> Option<i32> {
        if self.timed_out {
            None
        } else {
            self.exit_code
        }
    }
}

/// A full `ExecutionResult` plus captured stdout/stderr, kept out of the
/// `Copy`-able `ExecutionResult` so large buffers aren't cloned casually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub result: ExecutionResult,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub case_name: String,
    pub interpreter: ExecutionOutput,
    pub jit: ExecutionOutput,
    pub compilable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_has_depth_zero_and_seed_tag() {
        let seed = TestCase::new_seed("s1".into());
        assert_eq!(seed.mutation_depth, 0);
        assert!(seed.is_seed());
    }

    #[test]
    fn child_depth_is_parent_plus_one() {
        let mut parent = TestCase::new_seed("s1".into());
        parent.mutation_depth = 3;
        let child = TestCase::new_child("c1".into(), &parent, "swap-operands".into());
        assert_eq!(child.mutation_depth, 4);
        assert_eq!(child.seed_ancestor, "s1");
        assert_eq!(child.parent.as_deref(), Some("s1"));
        assert!(!child.is_seed());
    }

    #[test]
    fn priority_decays_with_selection() {
        let mut tc = TestCase::new_seed("s1".into());
        tc.score = 1.0;
        tc.recompute_priority();
        assert_eq!(tc.priority, 1.0);
        tc.mark_selected();
        assert_eq!(tc.priority, 0.5);
        tc.mark_selected();
        assert!((tc.priority - (1.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn timed_out_execution_has_unreliable_exit_code() {
        let res = ExecutionResult { exit_code: Some(0), wall_time_ns: 1, timed_out: true };
        assert_eq!(res.exit_code_reliable(), None);
    }
}
