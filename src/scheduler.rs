//! Mutator Scheduler (`SPEC_FULL.md` §4.5): picks which external mutator
//! the Mutation Worker applies next. The bandit variant mirrors a
//! UCB1-with-epsilon-greedy-exploration scheme used elsewhere in this
//! stack for picking among a small fixed set of arms by past reward.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::stats::{EvaluationOutcome, MutationAttemptStatus};

const EPSILON: f64 = 0.05;
const UCB_C: f64 = 1.5;

#[derive(Debug, Clone, Copy, Default)]
struct BanditArmStats {
    pulls: u64,
    total_reward: f64,
}

impl BanditArmStats {
    fn ucb_score(&self, total_pulls: u64) -> f64 {
        if self.pulls == 0 {
            return f64::INFINITY;
        }
        let mean = self.total_reward / self.pulls as f64;
        mean + UCB_C * ((total_pulls as f64).ln() / self.pulls as f64).sqrt()
    }
}

struct Bandit {
    arms: Vec<BanditArmStats>,
}

impl Bandit {
    fn new(n: usize) -> Self {
        Bandit { arms: vec![BanditArmStats::default(); n] }
    }

    fn select_arm(&self, rng: &mut StdRng) -> usize {
        if let Some(idx) = self.arms.iter().position(|a| a.pulls == 0) {
            return idx;
        }
        if rng.gen::<f64>() < EPSILON {
            return rng.gen_range(0..self.arms.len());
        }
        let total: u64 = self.arms.iter().map(|a| a.pulls).sum();
        self.arms
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.ucb_score(total).partial_cmp(&b.ucb_score(total)).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn update(&mut self, idx: usize, reward: f64) {
        if let Some(arm) = self.arms.get_mut(idx) {
            arm.pulls += 1;
            arm.total_reward += reward;
        }
    }
}

fn outcome_reward(outcome: EvaluationOutcome) -> f64 {
    match outcome {
        EvaluationOutcome::Bug => 2.0,
        EvaluationOutcome::Improved => 1.0,
        EvaluationOutcome::NoImprovement => 0.0,
        EvaluationOutcome::Timeout => 0.0,
        EvaluationOutcome::Failure => -0.5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorPolicyKind {
    Uniform,
    Bandit,
    Mop,
}

#[derive(Default, Clone, Copy)]
struct MopTally {
    attempts: u64,
    champions_produced: u64,
}

enum PolicyState {
    Uniform,
    Bandit(Mutex<Bandit>),
    Mop(Mutex<HashMap<String, MopTally>>),
}

/// Picks a mutator name from a fixed, externally-supplied list. The list
/// itself (actual mutator implementations) is the out-of-scope external
/// collaborator; the scheduler only ever handles names.
pub struct MutatorScheduler {
    mutators: Vec<String>,
    state: PolicyState,
    rng: Mutex<StdRng>,
}

impl MutatorScheduler {
    pub fn new(kind: MutatorPolicyKind, mutators: Vec<String>, rng_seed: u64) -> Self {
        let state = match kind {
            MutatorPolicyKind::Uniform => PolicyState::Uniform,
            MutatorPolicyKind::Bandit => PolicyState::Bandit(Mutex::new(Bandit::new(mutators.len()))),
            MutatorPolicyKind::Mop => PolicyState::Mop(Mutex::new(HashMap::new())),
        };
        MutatorScheduler { mutators, state, rng: Mutex::new(StdRng::seed_from_u64(rng_seed)) }
    }

    pub fn pick(&self) -> Option<String> {
        if self.mutators.is_empty() {
            return None;
        }
        match &self.state {
            PolicyState::Uniform => {
                let idx = self.rng.lock().gen_range(0..self.mutators.len());
                Some(self.mutators[idx].clone())
            }
            PolicyState::Bandit(bandit) => {
                let mut rng = self.rng.lock();
                let idx = bandit.lock().select_arm(&mut rng);
                Some(self.mutators[idx].clone())
            }
            PolicyState::Mop(tallies) => {
                let tallies = tallies.lock();
                // Laplace-smoothed success rate so an untried mutator still
                // has a nonzero chance of being picked.
                let weights: Vec<f64> = self
                    .mutators
                    .iter()
                    .map(|m| {
                        let t = tallies.get(m).copied().unwrap_or_default();
                        (t.champions_produced as f64 + 1.0) / (t.attempts as f64 + 2.0)
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    let idx = self.rng.lock().gen_range(0..self.mutators.len());
                    return Some(self.mutators[idx].clone());
                }
                let mut roll = self.rng.lock().gen_range(0.0..total);
                for (m, w) in self.mutators.iter().zip(weights.iter()) {
                    if roll < *w {
                        return Some(m.clone());
                    }
                    roll -= w;
                }
                self.mutators.last().cloned()
            }
        }
    }

    pub fn record_mutation_attempt(&self, mutator: &str, status: MutationAttemptStatus) {
        if let PolicyState::Mop(tallies) = &self.state {
            if matches!(status, MutationAttemptStatus::Success) {
                let mut map = tallies.lock();
                map.entry(mutator.to_string()).or_default().attempts += 1;
            }
        }
    }

    pub fn record_evaluation(&self, mutator: &str, outcome: EvaluationOutcome) {
        match &self.state {
            PolicyState::Bandit(bandit) => {
                if let Some(idx) = self.mutators.iter().position(|m| m == mutator) {
                    bandit.lock().update(idx, outcome_reward(outcome));
                }
            }
            PolicyState::Mop(tallies) => {
                if matches!(outcome, EvaluationOutcome::Improved) {
                    let mut map = tallies.lock();
                    map.entry(mutator.to_string()).or_default().champions_produced += 1;
                }
            }
            PolicyState::Uniform => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_picks_from_the_configured_list() {
        let s = MutatorScheduler::new(
            MutatorPolicyKind::Uniform,
            vec!["a".into(), "b".into()],
            1,
        );
        for _ in 0..20 {
            let pick = s.pick().unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[test]
    fn empty_mutator_list_yields_none() {
        let s = MutatorScheduler::new(MutatorPolicyKind::Uniform, vec![], 1);
        assert!(s.pick().is_none());
    }

    #[test]
    fn bandit_eventually_favors_the_rewarding_arm() {
        let s = MutatorScheduler::new(
            MutatorPolicyKind::Bandit,
            vec!["good".into(), "bad".into()],
            7,
        );
        for _ in 0..200 {
            s.record_evaluation("good", EvaluationOutcome::Bug);
            s.record_evaluation("bad", EvaluationOutcome::Failure);
        }
        let mut good_count = 0;
        for _ in 0..100 {
            if s.pick().unwrap() == "good" {
                good_count += 1;
            }
        }
        assert!(good_count > 60);
    }

    #[test]
    fn mop_favors_mutators_that_produced_champions() {
        let s = MutatorScheduler::new(MutatorPolicyKind::Mop, vec!["good".into(), "bad".into()], 3);
        for _ in 0..50 {
            s.record_mutation_attempt("good", MutationAttemptStatus::Success);
            s.record_evaluation("good", EvaluationOutcome::Improved);
            s.record_mutation_attempt("bad", MutationAttemptStatus::Success);
            s.record_evaluation("bad", EvaluationOutcome::NoImprovement);
        }
        let mut good_count = 0;
        for _ in 0..200 {
            if s.pick().unwrap() == "good" {
                good_count += 1;
            }
        }
        assert!(good_count > 100);
    }
}
