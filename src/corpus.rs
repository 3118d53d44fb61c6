//! Corpus Manager: enforces the fingerprint-championship, capacity, and
//! per-seed share invariants (`SPEC_FULL.md` §4.4). Corpus mutation is
//! serialized behind one coarse lock — the corpus is small and touched once
//! per evaluation, so contention isn't worth a finer-grained scheme.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::optvec::Fingerprint;
use crate::queues::MutationQueue;
use crate::scheduler::MutatorScheduler;
use crate::scoring::ScoringMode;
use crate::stats::{EvaluationOutcome, GlobalStats};
use crate::testcase::{Mutator, TestCase};

const REPLACEMENT_MARGIN: f64 = 0.05;
const SEED_SHARE_CAP: f64 = 0.10;

#[derive(Debug, Clone, Copy)]
pub enum CorpusPolicy {
    Champion,
    Random { accept_probability: f64 },
}

#[derive(Debug, Clone)]
pub enum CorpusOutcome {
    Accepted,
    Replaced { previous: TestCase },
    Rejected { incumbent_name: String, reason: String },
    Discarded { reason: String },
}

struct CorpusState {
    champions: HashMap<Fingerprint, TestCase>,
}

pub struct CorpusManager {
    policy: CorpusPolicy,
    capacity: usize,
    scoring_mode: ScoringMode,
    stats: Arc<GlobalStats>,
    mutation_queue: Arc<MutationQueue>,
    scheduler: Arc<MutatorScheduler>,
    state: Mutex<CorpusState>,
    rng: Mutex<StdRng>,
}

fn mutator_tag(case: &TestCase) -> &str {
    match &case.mutator {
        Mutator::Seed => "SEED",
        Mutator::Named(name) => name.as_str(),
    }
}

impl CorpusManager {
    pub fn new(
        policy: CorpusPolicy,
        capacity: usize,
        scoring_mode: ScoringMode,
        stats: Arc<GlobalStats>,
        mutation_queue: Arc<MutationQueue>,
        scheduler: Arc<MutatorScheduler>,
        rng_seed: u64,
    ) -> Self {
        CorpusManager {
            policy,
            capacity,
            scoring_mode,
            stats,
            mutation_queue,
            scheduler,
            state: Mutex::new(CorpusState { champions: HashMap::new() }),
            rng: Mutex::new(StdRng::seed_from_u64(rng_seed)),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().champions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn champion_names(&self) -> Vec<String> {
        self.state.lock().champions.values().map(|c| c.name.clone()).collect()
    }

    /// Active champions' names paired with score, highest first -- for
    /// callers (the end-of-run snapshot) that need top-K by score rather
    /// than insertion or name order.
    pub fn champion_names_by_score(&self) -> Vec<(String, f64)> {
        let mut named: Vec<(String, f64)> =
            self.state.lock().champions.values().map(|c| (c.name.clone(), c.score)).collect();
        named.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        named
    }

    /// Recompute a champion's score under the current scoring mode and
    /// `GlobalStats` snapshot. History-dependent modes (PF-IDF and its
    /// relatives) see more feature/pair observations over time, so a stale
    /// acceptance-time score can no longer be compared fairly against a
    /// freshly-scored candidate.
    fn rescore(&self, case: &TestCase) -> f64 {
        match case.vectors.as_ref().and_then(|v| v.hot_method()) {
            Some(m) => self.scoring_mode.compute(&m.vector, &self.stats),
            None => case.score,
        }
    }

    /// `preview = true` computes the disposition without mutating corpus
    /// or coverage state at all, for callers that want to know what would
    /// happen (e.g. `test-mutator` mode) without side effects.
    pub fn evaluate(&self, mut candidate: TestCase, preview: bool) -> (CorpusOutcome, Vec<TestCase>) {
        let Some(fingerprint) = candidate.fingerprint.clone() else {
            return (CorpusOutcome::Discarded { reason: "no fingerprint".into() }, Vec::new());
        };

        let mut guard = self.state.lock();
        let incumbent = guard.champions.get(&fingerprint).cloned();

        let (accept, outcome_if_reject) = match (&self.policy, &incumbent) {
            (CorpusPolicy::Champion, Some(inc)) => {
                // Rescore the incumbent on demand: history-dependent modes
                // (PF-IDF and its relatives) have seen more feature/pair
                // observations since the incumbent was accepted, so its
                // cached `score` can no longer be compared fairly.
                let inc_score = self.rescore(inc);
                let replace = if matches!(self.scoring_mode, ScoringMode::Uniform)
                    && (candidate.score - inc_score).abs() < f64::EPSILON
                {
                    self.rng.lock().gen_bool(0.5)
                } else {
                    candidate.score > inc_score * (1.0 + REPLACEMENT_MARGIN)
                };
                (
                    replace,
                    CorpusOutcome::Rejected {
                        incumbent_name: inc.name.clone(),
                        reason: "candidate score did not exceed incumbent by the replacement margin"
                            .into(),
                    },
                )
            }
            (CorpusPolicy::Champion, None) => (true, CorpusOutcome::Accepted),
            (CorpusPolicy::Random { accept_probability }, _) => {
                let roll = candidate.is_seed() || self.rng.lock().gen_bool((*accept_probability).clamp(0.0, 1.0));
                (roll, CorpusOutcome::Discarded { reason: "random rejection".into() })
            }
        };

        if !accept {
            drop(guard);
            if !preview {
                self.stats.record_evaluation(mutator_tag(&candidate), EvaluationOutcome::NoImprovement);
                self.scheduler
                    .record_evaluation(mutator_tag(&candidate), EvaluationOutcome::NoImprovement);
            }
            return (outcome_if_reject, Vec::new());
        }

        if preview {
            return (
                match &incumbent {
                    Some(inc) => CorpusOutcome::Replaced { previous: inc.clone() },
                    None => CorpusOutcome::Accepted,
                },
                Vec::new(),
            );
        }

        candidate.active_champion = true;
        if let Some(vectors) = &candidate.vectors {
            self.stats.record_acceptance_coverage(&vectors.merged);
        }
        self.stats.record_evaluation(mutator_tag(&candidate), EvaluationOutcome::Improved);
        self.scheduler.record_evaluation(mutator_tag(&candidate), EvaluationOutcome::Improved);

        let previous = guard.champions.insert(fingerprint, candidate.clone());
        if let Some(mut prev) = previous.clone() {
            prev.active_champion = false;
            self.mutation_queue.remove(&prev.name);
        }
        self.mutation_queue.push(candidate.clone());

        let evicted = self.enforce_invariants(&mut guard.champions);
        drop(guard);

        let outcome = match previous {
            Some(prev) => CorpusOutcome::Replaced { previous: prev },
            None => CorpusOutcome::Accepted,
        };
        (outcome, evicted)
    }

    /// Capacity and per-seed-share enforcement. Must run while still
    /// holding the corpus lock so a concurrent evaluation can't observe a
    /// transiently over-capacity corpus.
    fn enforce_invariants(&self, champions: &mut HashMap<Fingerprint, TestCase>) -> Vec<TestCase> {
        let mut evicted = Vec::new();

        while champions.len() > self.capacity {
            let Some(victim_fp) = self.pick_eviction_victim(champions) else { break };
            if let Some(mut victim) = champions.remove(&victim_fp) {
                victim.active_champion = false;
                self.mutation_queue.remove(&victim.name);
                evicted.push(victim);
            }
        }

        loop {
            let Some(violator_fp) = self.find_share_cap_violation(champions) else { break };
            if let Some(mut victim) = champions.remove(&violator_fp) {
                victim.active_champion = false;
                self.mutation_queue.remove(&victim.name);
                evicted.push(victim);
            } else {
                break;
            }
        }

        evicted
    }

    fn pick_eviction_victim(&self, champions: &HashMap<Fingerprint, TestCase>) -> Option<Fingerprint> {
        match self.policy {
            CorpusPolicy::Champion => champions
                .iter()
                .min_by(|(fp_a, a), (fp_b, b)| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.name.cmp(&b.name))
                        .then_with(|| format!("{fp_a:?}").cmp(&format!("{fp_b:?}")))
                })
                .map(|(fp, _)| fp.clone()),
            CorpusPolicy::Random { .. } => {
                let keys: Vec<&Fingerprint> = champions.keys().collect();
                if keys.is_empty() {
                    return None;
                }
                let idx = self.rng.lock().gen_range(0..keys.len());
                Some(keys[idx].clone())
            }
        }
    }

    /// Returns the fingerprint of the lowest-scoring champion belonging to
    /// a seed ancestor whose share of the corpus exceeds the cap, if any.
    fn find_share_cap_violation(&self, champions: &HashMap<Fingerprint, TestCase>) -> Option<Fingerprint> {
        if champions.is_empty() {
            return None;
        }
        let distinct_seeds: std::collections::HashSet<&str> =
            champions.values().map(|c| c.seed_ancestor.as_str()).collect();
        if distinct_seeds.len() < 2 {
            return None;
        }
        let cap = SEED_SHARE_CAP.max(1.0 / distinct_seeds.len() as f64);
        let total = champions.len() as f64;

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for c in champions.values() {
            *counts.entry(c.seed_ancestor.as_str()).or_insert(0) += 1;
        }

        for (seed, count) in counts {
            if count as f64 / total > cap {
                return champions
                    .iter()
                    .filter(|(_, c)| c.seed_ancestor == seed)
                    .min_by(|(_, a), (_, b)| {
                        a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(fp, _)| fp.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optvec::{CompileKind, MethodOptimizationVector, OptimizationVector, OptimizationVectors};
    use crate::scheduler::MutatorPolicyKind;

    fn scored_case(name: &str, seed: &str, fingerprint: Vec<u64>, score: f64) -> TestCase {
        let mut c = TestCase::new_seed(name.to_string());
        c.seed_ancestor = seed.to_string();
        c.score = score;
        c.fingerprint = Some(Fingerprint(fingerprint));
        c.vectors = Some(OptimizationVectors::default());
        c
    }

    /// A case whose `vectors` carry a real hot-method vector, so
    /// `CorpusManager::rescore` has something to recompute against instead
    /// of falling back to the cached `score`.
    fn case_with_hot_vector(
        name: &str,
        seed: &str,
        fingerprint: Vec<u64>,
        vector: OptimizationVector,
        scoring: ScoringMode,
        stats: &GlobalStats,
    ) -> TestCase {
        let mut c = TestCase::new_seed(name.to_string());
        c.seed_ancestor = seed.to_string();
        c.score = scoring.compute(&vector, stats);
        c.fingerprint = Some(Fingerprint(fingerprint));
        c.vectors = Some(OptimizationVectors {
            methods: vec![MethodOptimizationVector {
                class_name: "C".into(),
                method_name: "m".into(),
                signature: "()V".into(),
                kind: CompileKind::Standard,
                bci: 0,
                compile_id: 0,
                vector: vector.clone(),
            }],
            merged: vector,
        });
        c
    }

    fn scheduler() -> Arc<MutatorScheduler> {
        Arc::new(MutatorScheduler::new(MutatorPolicyKind::Uniform, vec![], 1))
    }

    fn manager(capacity: usize) -> CorpusManager {
        CorpusManager::new(
            CorpusPolicy::Champion,
            capacity,
            ScoringMode::Uniform,
            Arc::new(GlobalStats::new()),
            Arc::new(MutationQueue::new()),
            scheduler(),
            42,
        )
    }

    fn manager_with(scoring: ScoringMode, capacity: usize, stats: Arc<GlobalStats>) -> CorpusManager {
        CorpusManager::new(
            CorpusPolicy::Champion,
            capacity,
            scoring,
            stats,
            Arc::new(MutationQueue::new()),
            scheduler(),
            42,
        )
    }

    #[test]
    fn first_case_for_a_fingerprint_is_accepted() {
        let mgr = manager(4);
        let (outcome, evicted) = mgr.evaluate(scored_case("a", "s1", vec![1], 1.0), false);
        assert!(matches!(outcome, CorpusOutcome::Accepted));
        assert!(evicted.is_empty());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn repeat_identical_fingerprint_without_margin_is_rejected() {
        let mgr = manager(4);
        mgr.evaluate(scored_case("a", "s1", vec![1], 0.40), false);
        let (outcome, _) = mgr.evaluate(scored_case("b", "s1", vec![1], 0.41), false);
        assert!(matches!(outcome, CorpusOutcome::Rejected { .. }));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn margin_exceeded_replaces_incumbent() {
        let mgr = manager(4);
        mgr.evaluate(scored_case("a", "s1", vec![1], 0.40), false);
        let (outcome, _) = mgr.evaluate(scored_case("b", "s1", vec![1], 0.45), false);
        match outcome {
            CorpusOutcome::Replaced { previous } => assert_eq!(previous.name, "a"),
            _ => panic!("expected Replaced"),
        }
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.champion_names(), vec!["b".to_string()]);
    }

    #[test]
    fn capacity_overflow_evicts_lowest_scorer() {
        let mgr = manager(1);
        mgr.evaluate(scored_case("a", "s1", vec![1], 0.9), false);
        let (_, evicted) = mgr.evaluate(scored_case("b", "s1", vec![2], 0.1), false);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].name, "a");
    }

    #[test]
    fn seed_share_cap_evicts_overrepresented_seed() {
        let mgr = manager(10);
        // Seed A gets 9 slots, seed B gets 1 -- A is already at the cap
        // violation threshold for capacity=10, two seeds (cap = 50%).
        for i in 0..9 {
            mgr.evaluate(scored_case(&format!("a{i}"), "A", vec![i as u64 + 1], 1.0 + i as f64), false);
        }
        let (_, evicted) = mgr.evaluate(scored_case("b0", "B", vec![100], 0.5), false);
        // Adding B makes 10 champions: A=9 (90%), cap=max(10%,50%)=50% -> violation.
        assert!(!evicted.is_empty());
        assert!(evicted.iter().all(|c| c.seed_ancestor == "A"));
    }

    #[test]
    fn discarded_when_no_fingerprint() {
        let mgr = manager(4);
        let case = TestCase::new_seed("no-fp".into());
        let (outcome, _) = mgr.evaluate(case, false);
        assert!(matches!(outcome, CorpusOutcome::Discarded { .. }));
    }

    #[test]
    fn preview_does_not_mutate_corpus() {
        let mgr = manager(4);
        mgr.evaluate(scored_case("a", "s1", vec![1], 0.5), false);
        let (_, evicted) = mgr.evaluate(scored_case("b", "s1", vec![1], 0.9), true);
        assert!(evicted.is_empty());
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.champion_names(), vec!["a".to_string()]);
    }

    /// Under PF-IDF, the incumbent's cached acceptance-time score goes
    /// stale as the corpus accepts more cases touching the same features:
    /// features 0/1 start out novel (score 7.0) but saturate to zero lift
    /// once every accepted case has seen them. A candidate lighting up a
    /// pair of never-before-seen features (2/3) scores the same 7.0 a
    /// stale comparison would reject outright, but must replace the
    /// incumbent once the incumbent is rescored against current stats.
    #[test]
    fn champion_policy_rescores_incumbent_under_history_dependent_scoring() {
        let stats = Arc::new(GlobalStats::new());
        let mgr = manager_with(ScoringMode::PfIdf, 50, stats.clone());

        let mut two_feature = OptimizationVector::zero();
        two_feature.set(0, 1);
        two_feature.set(1, 1);

        let incumbent = case_with_hot_vector(
            "incumbent",
            "s1",
            vec![1, 1],
            two_feature.clone(),
            ScoringMode::PfIdf,
            &stats,
        );
        assert!((incumbent.score - 7.0).abs() < 1e-6);
        let (outcome, _) = mgr.evaluate(incumbent, false);
        assert!(matches!(outcome, CorpusOutcome::Accepted));

        // Five more acceptances of the same two-feature vector at distinct
        // fingerprint slots drive feature 0/1's average frequency to 1.0,
        // collapsing their lift (and so the incumbent's true score) to 0.
        for i in 0..5 {
            let filler = case_with_hot_vector(
                &format!("filler{i}"),
                "filler-seed",
                vec![2 + i as u64],
                two_feature.clone(),
                ScoringMode::PfIdf,
                &stats,
            );
            mgr.evaluate(filler, false);
        }

        let mut fresh_pair = OptimizationVector::zero();
        fresh_pair.set(2, 2);
        fresh_pair.set(3, 2);
        let candidate = case_with_hot_vector(
            "candidate",
            "s1",
            vec![1, 1],
            fresh_pair,
            ScoringMode::PfIdf,
            &stats,
        );
        assert!((candidate.score - 7.0).abs() < 1e-6);

        let (outcome, _) = mgr.evaluate(candidate, false);
        match outcome {
            CorpusOutcome::Replaced { previous } => assert_eq!(previous.name, "incumbent"),
            other => panic!("expected the rescored incumbent to be replaced, got {other:?}"),
        }
    }
}
