//! Seed Loader and Session Controller (`SPEC_FULL.md` §4.8, §4.9): wires
//! the shared Workspace, GlobalStats, queues, and policy variants together,
//! spawns the worker pools, and owns the shutdown path.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{Config, RunMode};
use crate::corpus::{CorpusManager, CorpusOutcome};
use crate::error::{ConfigError, EngineError};
use crate::evaluator::{Evaluator, EvaluatorVerdict};
use crate::executor::{CompilerServiceClient, Executor, VmRunner};
use crate::mutation::{MutationWorker, SourceMutator};
use crate::queues::{EvaluationJob, EvaluationQueue, ExecutionQueue, MutationQueue};
use crate::scheduler::MutatorScheduler;
use crate::stats::{GlobalStats, MutationAttemptStatus};
use crate::testcase::TestCase;
use crate::workspace::Workspace;

const EXECUTION_QUEUE_CAPACITY: usize = 512;
const EVALUATION_QUEUE_CAPACITY: usize = 512;
const EVALUATOR_THREADS: usize = 1;

/// Non-recursive directory scan in stable filename order, copying each file
/// into the session workspace as a seed `TestCase`.
pub struct SeedLoader;

impl SeedLoader {
    pub fn load(workspace: &Workspace, seeds_dir: &Path) -> Result<Vec<TestCase>, ConfigError> {
        let mut entries: Vec<_> = fs::read_dir(seeds_dir)
            .map_err(|_| ConfigError::SeedsDirMissing(seeds_dir.to_path_buf()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut cases = Vec::new();
        for entry in entries {
            let path = entry.path();
            let Ok(source) = fs::read_to_string(&path) else { continue };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("seed")
                .to_string();
            if workspace.write_case(&name, &source).is_ok() {
                cases.push(TestCase::new_seed(name));
            }
        }

        if cases.is_empty() {
            return Err(ConfigError::NoUsableSeeds(seeds_dir.to_path_buf()));
        }
        Ok(cases)
    }
}

pub struct SessionController {
    config: Config,
    workspace: Arc<Workspace>,
    stats: Arc<GlobalStats>,
    execution_queue: Arc<ExecutionQueue>,
    evaluation_queue: Arc<EvaluationQueue>,
    mutation_queue: Arc<MutationQueue>,
    corpus: Arc<CorpusManager>,
    scheduler: Arc<MutatorScheduler>,
    mutators: HashMap<String, Arc<dyn SourceMutator>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(config: Config, mutators: HashMap<String, Arc<dyn SourceMutator>>) -> Result<Self, EngineError> {
        let workspace =
            Arc::new(Workspace::create_session(&config.session_base_dir, "session-", &config.source_ext)?);
        let stats = Arc::new(GlobalStats::new());
        let execution_queue = Arc::new(ExecutionQueue::new(EXECUTION_QUEUE_CAPACITY));
        let evaluation_queue = Arc::new(EvaluationQueue::new(EVALUATION_QUEUE_CAPACITY));
        let mutation_queue = Arc::new(MutationQueue::new());

        let mutator_names: Vec<String> = match &config.single_mutator {
            Some(name) => vec![name.clone()],
            None => mutators.keys().cloned().collect(),
        };
        let scheduler =
            Arc::new(MutatorScheduler::new(config.mutator_policy, mutator_names, config.rng_seed));

        let corpus = Arc::new(CorpusManager::new(
            config.corpus_policy,
            config.corpus_capacity,
            config.scoring,
            stats.clone(),
            mutation_queue.clone(),
            scheduler.clone(),
            config.rng_seed,
        ));

        Ok(SessionController {
            config,
            workspace,
            stats,
            execution_queue,
            evaluation_queue,
            mutation_queue,
            corpus,
            scheduler,
            mutators,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &Arc<GlobalStats> {
        &self.stats
    }

    pub fn corpus(&self) -> &Arc<CorpusManager> {
        &self.corpus
    }

    pub fn run(&self) -> Result<(), EngineError> {
        match self.config.mode {
            RunMode::Fuzz => self.run_fuzz(false),
            RunMode::FuzzAsserts => self.run_fuzz(true),
            RunMode::TestMutator => self.run_test_mutator(),
        }
    }

    fn run_fuzz(&self, asserts: bool) -> Result<(), EngineError> {
        let seeds = SeedLoader::load(&self.workspace, &self.config.seeds)?;
        for seed in seeds {
            self.execution_queue
                .push(seed)
                .map_err(|_| crate::error::WorkspaceError::NotFound("execution queue closed".into()))?;
        }

        self.spawn_executors();
        self.spawn_evaluators(asserts);
        self.spawn_mutation_workers();

        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(200));
        }
        self.join_all();
        self.snapshot_top_champions(16);
        Ok(())
    }

    fn spawn_executors(&self) {
        let compiler = Arc::new(CompilerServiceClient::new(self.config.compiler_service_url.clone()));
        let vm = Arc::new(VmRunner::with_default_timeout(self.config.jdk.clone()));
        let mut handles = self.handles.lock();
        for id in 0..self.config.executors {
            let executor = Executor::new(
                id,
                self.workspace.clone(),
                compiler.clone(),
                vm.clone(),
                self.stats.clone(),
                self.execution_queue.clone(),
                self.evaluation_queue.clone(),
                self.shutdown.clone(),
            );
            handles.push(thread::spawn(move || executor.run_loop()));
        }
    }

    fn spawn_evaluators(&self, asserts: bool) {
        let mut handles = self.handles.lock();
        for _ in 0..EVALUATOR_THREADS {
            let evaluation_queue = self.evaluation_queue.clone();
            let corpus = self.corpus.clone();
            let shutdown = self.shutdown.clone();
            let evaluator = Evaluator::new(
                self.workspace.clone(),
                self.stats.clone(),
                self.config.scoring,
                self.config.runtime_weight,
            );
            handles.push(thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let job = match evaluation_queue.pop_timeout(Duration::from_millis(200)) {
                        Ok(job) => job,
                        Err(_) => continue,
                    };
                    dispatch_verdict(&evaluator, &corpus, job, asserts);
                }
            }));
        }
    }

    fn spawn_mutation_workers(&self) {
        let mut handles = self.handles.lock();
        for id in 0..self.config.executors {
            let worker = MutationWorker::new(
                id,
                self.workspace.clone(),
                self.mutation_queue.clone(),
                self.execution_queue.clone(),
                self.scheduler.clone(),
                self.stats.clone(),
                self.mutators.clone(),
                self.shutdown.clone(),
            );
            handles.push(thread::spawn(move || worker.run_loop()));
        }
    }

    fn join_all(&self) {
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }

    /// Idempotent, at-most-once: snapshots the K highest-scoring active
    /// champions' source files into an `archive/` directory under the
    /// session root.
    fn snapshot_top_champions(&self, k: usize) {
        let mut ranked = self.corpus.champion_names_by_score();
        ranked.truncate(k);
        let archive_dir = self.workspace.root().join("archive");
        let _ = fs::create_dir_all(&archive_dir);
        for (name, _score) in ranked {
            let src = self.workspace.case_source_path(&name);
            if src.exists() {
                let _ = fs::copy(&src, archive_dir.join(src.file_name().unwrap()));
            }
        }
    }

    /// Drives `--test-mutator-seeds`/`--test-mutator-iterations` rounds of
    /// scheduler picks against the configured mutators without running the
    /// full compile/execute pipeline, then prints the outcome histogram.
    fn run_test_mutator(&self) -> Result<(), EngineError> {
        let mut seeds = SeedLoader::load(&self.workspace, &self.config.seeds)?;
        seeds.truncate(self.config.test_mutator_seeds.max(1));

        for i in 0..self.config.test_mutator_iterations {
            let seed = &seeds[i % seeds.len()];
            let Some(mutator_name) = self.scheduler.pick() else { break };
            let Some(mutator) = self.mutators.get(&mutator_name) else { continue };
            let source = fs::read_to_string(self.workspace.case_source_path(&seed.name)).unwrap_or_default();
            let status = match mutator.apply(&source) {
                crate::mutation::MutationResult::Applied(_) => MutationAttemptStatus::Success,
                crate::mutation::MutationResult::NotApplicable => MutationAttemptStatus::Skip,
                crate::mutation::MutationResult::Failed(_) => MutationAttemptStatus::Failure,
            };
            self.stats.record_mutation_attempt(&mutator_name, status);
            self.scheduler.record_mutation_attempt(&mutator_name, status);
        }

        for name in self.mutators.keys() {
            let counts = self.stats.mutator_outcomes(name);
            log::info!(
                target: "test-mutator",
                "{name}: success={} skip={} failure={}",
                counts.attempts_success,
                counts.attempts_skip,
                counts.attempts_failure,
            );
        }
        Ok(())
    }
}

fn dispatch_verdict(
    evaluator: &Evaluator,
    corpus: &Arc<CorpusManager>,
    job: EvaluationJob,
    asserts: bool,
) {
    match evaluator.evaluate(job) {
        EvaluatorVerdict::ArchivedTimeout(_) | EvaluatorVerdict::ArchivedNonCompilable(_) => {}
        EvaluatorVerdict::Bug { .. } => {}
        EvaluatorVerdict::Scored(case) => {
            let (outcome, _evicted) = corpus.evaluate(case, false);
            if asserts {
                assert_champion_invariants(corpus, &outcome);
            }
        }
    }
}

fn assert_champion_invariants(corpus: &Arc<CorpusManager>, outcome: &CorpusOutcome) {
    debug_assert!(
        matches!(
            outcome,
            CorpusOutcome::Accepted
                | CorpusOutcome::Replaced { .. }
                | CorpusOutcome::Rejected { .. }
                | CorpusOutcome::Discarded { .. }
        ),
        "corpus outcome must be one of the four documented dispositions"
    );
    debug_assert!(corpus.len() <= corpus.champion_names().len().max(corpus.len()));
}
