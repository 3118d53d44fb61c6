//! The six-rung decision ladder that turns a raw `TestCaseResult` into a
//! disposition (`SPEC_FULL.md` §4.3). First match wins.

use std::sync::Arc;

use crate::bucketizer::{self, BugSignature, BugSignatureInput};
use crate::optvec::parse_jit_stdout;
use crate::queues::EvaluationJob;
use crate::scoring::{runtime_weight, ScoringMode};
use crate::stats::{EvaluationOutcome, GlobalStats};
use crate::testcase::{Mutator, TestCase};
use crate::workspace::{BugIndexEntry, Workspace};

pub enum EvaluatorVerdict {
    /// Interpreter alone was too slow; never a bug.
    ArchivedTimeout(TestCase),
    /// One of the bug rungs fired; the case has been bucketized and
    /// recorded in the workspace already.
    Bug { case: TestCase, signature: BugSignature },
    /// Both runs failed identically; not a bug, just uninteresting.
    ArchivedNonCompilable(TestCase),
    /// Survived the ladder: scored, fingerprinted, ready for the Corpus
    /// Manager to decide retention.
    Scored(TestCase),
}

fn mutator_tag(case: &TestCase) -> &str {
    match &case.mutator {
        Mutator::Seed => "SEED",
        Mutator::Named(name) => name.as_str(),
    }
}

/// Drop every `OPTS_START ... OPTS_END` block from JIT stdout so the
/// remaining program output can be diffed against the interpreter's.
fn strip_instrumentation(stdout: &str) -> String {
    let mut out = String::new();
    let mut in_block = false;
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed == "OPTS_START" {
            in_block = true;
            continue;
        }
        if trimmed == "OPTS_END" {
            in_block = false;
            continue;
        }
        if !in_block {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub struct Evaluator {
    workspace: Arc<Workspace>,
    stats: Arc<GlobalStats>,
    scoring_mode: ScoringMode,
    use_runtime_weight: bool,
}

impl Evaluator {
    pub fn new(
        workspace: Arc<Workspace>,
        stats: Arc<GlobalStats>,
        scoring_mode: ScoringMode,
        use_runtime_weight: bool,
    ) -> Self {
        Evaluator { workspace, stats, scoring_mode, use_runtime_weight }
    }

    pub fn evaluate(&self, job: EvaluationJob) -> EvaluatorVerdict {
        let EvaluationJob { mut case, result } = job;
        let (interpreter, jit) = (&result.interpreter, &result.jit);

        // Rung 1: interpreter too slow, never a bug.
        if interpreter.result.timed_out {
            self.stats.bump_int_timeout();
            self.stats.record_evaluation(mutator_tag(&case), EvaluationOutcome::Timeout);
            let _ = self.workspace.archive_failed(&case.name, "interpreter too slow");
            return EvaluatorVerdict::ArchivedTimeout(case);
        }

        // Rung 2: JIT alone timed out.
        if jit.result.timed_out {
            self.stats.bump_jit_timeout();
            let signature = self.report_bug(&case, "JIT timeout", &jit.stderr, None, jit.result.exit_code_reliable());
            return EvaluatorVerdict::Bug { case, signature };
        }

        let int_exit = interpreter.result.exit_code_reliable();
        let jit_exit = jit.result.exit_code_reliable();

        // Rung 3: differing exit codes.
        if int_exit != jit_exit {
            let signature =
                self.report_bug(&case, "different exit codes", &jit.stderr, int_exit, jit_exit);
            return EvaluatorVerdict::Bug { case, signature };
        }

        // Rung 4: both failed the same way; not a bug.
        if int_exit.map(|c| c != 0).unwrap_or(true) && jit_exit.map(|c| c != 0).unwrap_or(true) {
            self.stats.record_evaluation(mutator_tag(&case), EvaluationOutcome::Failure);
            let _ = self
                .workspace
                .archive_failed(&case.name, "non-compilable or runtime failure on both runs");
            return EvaluatorVerdict::ArchivedNonCompilable(case);
        }

        // Rung 5: divergent stdout with instrumentation noise stripped.
        let int_stdout = strip_instrumentation(&interpreter.stdout);
        let jit_stdout = strip_instrumentation(&jit.stdout);
        if int_stdout != jit_stdout {
            let signature =
                self.report_bug(&case, "divergent output", &jit.stderr, int_exit, jit_exit);
            return EvaluatorVerdict::Bug { case, signature };
        }

        // Rung 6: score and hand to the Corpus Manager.
        let vectors = parse_jit_stdout(&jit.stdout);
        case.interpreter_runtime_ns = Some(interpreter.result.wall_time_ns);
        case.jit_runtime_ns = Some(jit.result.wall_time_ns);

        let hot = vectors.hot_method().cloned();
        let mut score = match &hot {
            Some(m) => self.scoring_mode.compute(&m.vector, &self.stats),
            None => 0.0,
        };
        if self.use_runtime_weight && score > 0.0 {
            let tc_avg_ms = jit.result.wall_time_ns as f64 / 1_000_000.0;
            score *= runtime_weight(tc_avg_ms, self.stats.global_avg_runtime_ms());
        }
        self.stats.record_score(score);

        case.score = score;
        case.recompute_priority();
        case.hot_class = hot.as_ref().map(|m| m.class_name.clone());
        case.hot_method = hot.as_ref().map(|m| m.method_name.clone());
        case.fingerprint = hot.as_ref().map(|m| m.vector.fingerprint());
        case.vectors = Some(vectors);

        EvaluatorVerdict::Scored(case)
    }

    fn report_bug(
        &self,
        case: &TestCase,
        reason: &str,
        diagnostic_text: &str,
        int_exit: Option<i32>,
        jit_exit: Option<i32>,
    ) -> BugSignature {
        self.stats.record_evaluation(mutator_tag(case), EvaluationOutcome::Bug);
        let source = std::fs::read_to_string(self.workspace.case_source_path(&case.name))
            .unwrap_or_default();
        let signature = bucketizer::bucketize(&BugSignatureInput {
            reason,
            diagnostic_text,
            int_exit,
            jit_exit,
            source: &source,
            mutator: mutator_tag(case),
            seed_ancestor: &case.seed_ancestor,
        });

        self.stats.bump_bucket_count(&signature.bucket_id);
        let meta_json = serde_json::json!({
            "bucket_id": signature.bucket_id,
            "reason": signature.reason,
            "signal": signature.signal,
            "problematic_frame": signature.problematic_frame,
            "compile_task": signature.compile_task,
            "top_frames": signature.top_frames,
            "int_exit": signature.int_exit,
            "jit_exit": signature.jit_exit,
            "source_hash": signature.source_hash,
            "mutator": signature.mutator,
            "seed_ancestor": signature.seed_ancestor,
        })
        .to_string();
        let _ = self.workspace.record_bug_case(&signature.bucket_id, &case.name, &meta_json, None);
        let _ = self.workspace.upsert_bugs_index(BugIndexEntry {
            bucket_id: signature.bucket_id.clone(),
            reason: signature.reason.clone(),
            first_case: case.name.clone(),
            case_count: 1,
        });
        signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::{ExecutionOutput, ExecutionResult, TestCase, TestCaseResult};

    fn exec(exit_code: Option<i32>, timed_out: bool, stdout: &str, stderr: &str) -> ExecutionOutput {
        ExecutionOutput {
            result: ExecutionResult { exit_code, wall_time_ns: 1_000_000, timed_out },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn evaluator_with_workspace() -> (Evaluator, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Arc::new(Workspace::create_session(tmp.path(), "sess-", "src").unwrap());
        ws.write_case("c1", "class c2fuzz1 {}").unwrap();
        let stats = Arc::new(GlobalStats::new());
        let evaluator = Evaluator::new(ws, stats, ScoringMode::Uniform, false);
        (evaluator, tmp)
    }

    #[test]
    fn interpreter_timeout_archives_never_a_bug() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(None, true, "", ""),
            jit: exec(Some(0), false, "", ""),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::ArchivedTimeout(_) => {}
            _ => panic!("expected ArchivedTimeout"),
        }
        assert_eq!(evaluator.stats.int_timeouts(), 1);
    }

    #[test]
    fn jit_only_timeout_is_a_bug() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(Some(0), false, "", ""),
            jit: exec(None, true, "", ""),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::Bug { signature, .. } => assert_eq!(signature.reason, "JIT timeout"),
            _ => panic!("expected Bug"),
        }
        assert_eq!(evaluator.stats.jit_timeouts(), 1);
        assert_eq!(evaluator.stats.unique_bug_buckets(), 1);
    }

    #[test]
    fn differing_exit_codes_is_a_bug() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(Some(0), false, "ok", ""),
            jit: exec(Some(134), false, "", "Problematic frame:\nC [libjvm.so+0x1]\n"),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::Bug { signature, .. } => {
                assert_eq!(signature.reason, "different exit codes")
            }
            _ => panic!("expected Bug"),
        }
    }

    #[test]
    fn both_nonzero_exits_archive_without_bug() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(Some(1), false, "", ""),
            jit: exec(Some(1), false, "", ""),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::ArchivedNonCompilable(_) => {}
            _ => panic!("expected ArchivedNonCompilable"),
        }
    }

    #[test]
    fn divergent_output_ignoring_instrumentation_is_a_bug() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(Some(0), false, "42\n", ""),
            jit: exec(Some(0), false, "OPTS_START\nOpts|C|m|()V|STANDARD|0|1\nInlining=1\nOPTS_END\n43\n", ""),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::Bug { signature, .. } => assert_eq!(signature.reason, "divergent output"),
            _ => panic!("expected Bug"),
        }
    }

    #[test]
    fn matching_output_after_stripping_instrumentation_scores() {
        let (evaluator, _tmp) = evaluator_with_workspace();
        let case = TestCase::new_seed("c1".into());
        let jit_stdout = "OPTS_START\nOpts|C|m|()V|STANDARD|0|1\nInlining=2\nCCP=1\nOPTS_END\n42\n";
        let result = TestCaseResult {
            case_name: "c1".into(),
            interpreter: exec(Some(0), false, "42\n", ""),
            jit: exec(Some(0), false, jit_stdout, ""),
            compilable: true,
        };
        match evaluator.evaluate(EvaluationJob { case, result }) {
            EvaluatorVerdict::Scored(scored) => {
                assert_eq!(scored.score, 1.0);
                assert!(scored.fingerprint.is_some());
                assert_eq!(scored.hot_method.as_deref(), Some("m"));
            }
            _ => panic!("expected Scored"),
        }
    }
}
