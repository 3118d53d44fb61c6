//! Mutation Worker pool (`SPEC_FULL.md` §4.5): pops the highest-priority
//! champion, applies an externally-supplied mutator, and produces a child
//! `TestCase` for the execution queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::MutatorError;
use crate::queues::{ExecutionQueue, MutationQueue};
use crate::scheduler::MutatorScheduler;
use crate::stats::{GlobalStats, MutationAttemptStatus};
use crate::testcase::{next_case_ordinal, TestCase};
use crate::workspace::Workspace;

const SOFT_CAP: usize = 100;
const SOFT_CAP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The outcome of applying one mutator to one parent's source. The mutator
/// implementation itself (AST-to-AST transform) is an external
/// collaborator; the worker only sees this three-way result.
pub enum MutationResult {
    Applied(String),
    NotApplicable,
    Failed(MutatorError),
}

pub trait SourceMutator: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, source: &str) -> MutationResult;
}

pub struct MutationWorker {
    pub id: usize,
    workspace: Arc<Workspace>,
    mutation_queue: Arc<MutationQueue>,
    execution_queue: Arc<ExecutionQueue>,
    scheduler: Arc<MutatorScheduler>,
    stats: Arc<GlobalStats>,
    mutators: HashMap<String, Arc<dyn SourceMutator>>,
    shutdown: Arc<AtomicBool>,
}

impl MutationWorker {
    pub fn new(
        id: usize,
        workspace: Arc<Workspace>,
        mutation_queue: Arc<MutationQueue>,
        execution_queue: Arc<ExecutionQueue>,
        scheduler: Arc<MutatorScheduler>,
        stats: Arc<GlobalStats>,
        mutators: HashMap<String, Arc<dyn SourceMutator>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        MutationWorker {
            id,
            workspace,
            mutation_queue,
            execution_queue,
            scheduler,
            stats,
            mutators,
            shutdown,
        }
    }

    pub fn run_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let Some(mut parent) = self.mutation_queue.pop_highest_priority(Duration::from_millis(200))
            else {
                continue;
            };
            self.process_one(&mut parent);
        }
    }

    fn process_one(&self, parent: &mut TestCase) {
        let Some(mutator_name) = self.scheduler.pick() else {
            self.requeue_if_active(parent.clone());
            return;
        };
        let Some(mutator) = self.mutators.get(&mutator_name) else {
            log::warn!(target: "mutation", "worker {} picked unknown mutator {mutator_name:?}", self.id);
            self.requeue_if_active(parent.clone());
            return;
        };

        let source = match std::fs::read_to_string(self.workspace.case_source_path(&parent.name)) {
            Ok(s) => s,
            Err(e) => {
                log::warn!(target: "mutation", "worker {} could not read parent source: {e}", self.id);
                self.requeue_if_active(parent.clone());
                return;
            }
        };

        match mutator.apply(&source) {
            MutationResult::NotApplicable => {
                self.stats.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Skip);
                self.scheduler.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Skip);
            }
            MutationResult::Failed(err) => {
                log::debug!(target: "mutation", "{err}");
                self.stats.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Failure);
                self.scheduler.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Failure);
            }
            MutationResult::Applied(new_source) => {
                self.stats.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Success);
                self.scheduler.record_mutation_attempt(&mutator_name, MutationAttemptStatus::Success);
                self.spawn_child(parent, &mutator_name, &new_source);
            }
        }

        parent.mark_selected();
        self.requeue_if_active(parent.clone());
    }

    fn spawn_child(&self, parent: &TestCase, mutator_name: &str, new_source: &str) {
        let child_name = format!("tc-{}", next_case_ordinal());
        let renamed = rename_class(new_source, &parent.name, &child_name);
        let child = TestCase::new_child(child_name.clone(), parent, mutator_name.to_string());

        if let Err(e) = self.workspace.write_case(&child_name, &renamed) {
            log::warn!(target: "mutation", "worker {} failed to write child {child_name}: {e}", self.id);
            return;
        }

        let mut wait = Duration::ZERO;
        while self.execution_queue.len() >= SOFT_CAP {
            thread::sleep(SOFT_CAP_RETRY_DELAY);
            wait += SOFT_CAP_RETRY_DELAY;
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
        }
        if wait > Duration::ZERO {
            log::debug!(target: "mutation", "worker {} waited {wait:?} for execution queue backpressure", self.id);
        }

        if self.execution_queue.push(child).is_err() {
            log::warn!(target: "mutation", "worker {} execution queue closed, dropping child", self.id);
        }
    }

    fn requeue_if_active(&self, parent: TestCase) {
        if parent.active_champion {
            let name = parent.name.clone();
            self.mutation_queue.rescore(&name, parent);
        }
    }
}

/// Replace the case's top-level class identifier with its new name. The
/// real source-level rename (scopes, nested classes, references) belongs
/// to the external pretty-printer; this is the minimal textual rename the
/// engine needs so the compiled artifact's class name matches the case.
fn rename_class(source: &str, old_name: &str, new_name: &str) -> String {
    if source.contains(old_name) {
        source.replace(old_name, new_name)
    } else {
        source.to_string()
    }
}
