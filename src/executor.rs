//! Compiles and runs a test case twice — once interpreter-only, once with
//! the JIT enabled — and hands the pair off to the Evaluator
//! (`SPEC_FULL.md` §4.1). The subprocess-with-hard-timeout pattern here
//! (reader thread + `mpsc` + `recv_timeout` + force-kill) is the same shape
//! used for spawning a worker VM process elsewhere in the ecosystem this
//! crate's dependency stack comes from.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CompilerServiceError, EngineError};
use crate::optvec::parse_jit_stdout;
use crate::queues::{EvaluationJob, EvaluationQueue, ExecutionQueue};
use crate::stats::GlobalStats;
use crate::testcase::{ExecutionOutput, ExecutionResult, TestCase, TestCaseResult};
use crate::workspace::Workspace;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_COMPILE_RETRIES: u32 = 3;

static CLASS_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bclass\s+(\w+)").unwrap());

/// Scan source text for every top-level/nested class declaration so the
/// JIT run can be restricted to compiling only this test case's own
/// classes. Order-preserving, de-duplicated.
fn extract_class_names(source: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for cap in CLASS_DECL.captures_iter(source) {
        let name = cap[1].to_string();
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

#[derive(Debug, Serialize)]
struct CompileRequest<'a> {
    source: &'a str,
    name_hint: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompileResponse {
    class_name: String,
    classpath: String,
    diagnostics: Option<String>,
}

/// A thin HTTP client for the external compiler service (`SPEC_FULL.md`
/// §6): an out-of-process collaborator that turns mutated source text into
/// a loadable class on a shared classpath directory.
pub struct CompilerServiceClient {
    base_url: String,
    client: reqwest::blocking::Client,
    max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct CompileArtifact {
    pub class_name: String,
    pub classpath: PathBuf,
}

impl CompilerServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        CompilerServiceClient {
            base_url: base_url.into(),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builder never fails with these options"),
            max_retries: DEFAULT_COMPILE_RETRIES,
        }
    }

    /// Blocking request/response with linear backoff. Only a fully
    /// exhausted retry budget is propagated as an error; transient
    /// connection failures are retried in place.
    pub fn compile(&self, name: &str, source: &str) -> Result<CompileArtifact, CompilerServiceError> {
        let body = CompileRequest { source, name_hint: name };
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = self
                .client
                .post(format!("{}/compile", self.base_url))
                .json(&body)
                .send()
                .and_then(|resp| resp.error_for_status())
                .and_then(|resp| resp.json::<CompileResponse>());

            match outcome {
                Ok(parsed) => {
                    if let Some(diag) = parsed.diagnostics {
                        if !diag.trim().is_empty() {
                            log::debug!(target: "executor", "compiler diagnostics for {name}: {diag}");
                        }
                    }
                    return Ok(CompileArtifact {
                        class_name: parsed.class_name,
                        classpath: PathBuf::from(parsed.classpath),
                    });
                }
                Err(source) => {
                    if attempts >= self.max_retries {
                        return Err(CompilerServiceError::Unreachable { attempts, source });
                    }
                    thread::sleep(Duration::from_millis(200 * attempts as u64));
                }
            }
        }
    }
}

/// Runs a compiled artifact under the real JDK twice: once with the JIT
/// disabled, once with it enabled and instrumented to print optimization
/// vectors to stdout.
pub struct VmRunner {
    jdk_bin: PathBuf,
    timeout: Duration,
}

impl VmRunner {
    pub fn new(jdk_bin: PathBuf, timeout: Duration) -> Self {
        VmRunner { jdk_bin, timeout }
    }

    pub fn with_default_timeout(jdk_bin: PathBuf) -> Self {
        Self::new(jdk_bin, DEFAULT_TIMEOUT)
    }

    pub fn jdk_bin(&self) -> &Path {
        &self.jdk_bin
    }

    pub fn run_interpreter(&self, artifact: &CompileArtifact) -> std::io::Result<ExecutionOutput> {
        let mut cmd = self.java_command(artifact);
        cmd.arg("-Xint");
        run_with_timeout(cmd, self.timeout)
    }

    /// `source` is scanned for the test case's own class names so the JIT
    /// run can be restricted to optimizing only those classes, instead of
    /// whatever else happens to be on the shared classpath.
    pub fn run_jit(&self, artifact: &CompileArtifact, source: &str) -> std::io::Result<ExecutionOutput> {
        let mut cmd = self.java_command(artifact);
        let class_names = extract_class_names(source);
        cmd.args([
            "-XX:+PrintCompilation",
            "-XX:-TieredCompilation",
            "-XX:+UnlockDiagnosticVMOptions",
            "-XX:+PrintInlining",
        ]);
        if !class_names.is_empty() {
            cmd.arg(format!("-XX:CompileOnly={}", class_names.join(",")));
        }
        run_with_timeout(cmd, self.timeout)
    }

    fn java_command(&self, artifact: &CompileArtifact) -> Command {
        let mut cmd = Command::new(&self.jdk_bin);
        cmd.arg("-cp").arg(&artifact.classpath).arg(&artifact.class_name);
        cmd
    }
}

/// Spawn `cmd`, capture stdout/stderr on reader threads, and enforce `timeout`
/// with a forced kill. Mirrors the worker-subprocess timeout loop used to
/// drive an external compiler/VM elsewhere in this stack: a reader thread
/// feeds lines into an `mpsc` channel while the main thread polls with
/// `recv_timeout` against a deadline instead of blocking on `wait()`.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<ExecutionOutput> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let (tx, rx) = mpsc::channel();

    spawn_drain_thread(stdout, tx.clone(), true);
    spawn_drain_thread(stderr, tx, false);

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut drains_done = 0;
    let timed_out;

    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            timed_out = true;
            break;
        }
        match rx.recv_timeout(timeout - elapsed) {
            Ok(DrainEvent::Line(true, line)) => {
                stdout_buf.push_str(&line);
                stdout_buf.push('\n');
            }
            Ok(DrainEvent::Line(false, line)) => {
                stderr_buf.push_str(&line);
                stderr_buf.push('\n');
            }
            Ok(DrainEvent::Done) => {
                drains_done += 1;
                if drains_done == 2 {
                    timed_out = false;
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                timed_out = true;
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                timed_out = false;
                break;
            }
        }
    }

    let exit_code = if timed_out {
        force_kill(&mut child);
        None
    } else {
        child.wait()?.code()
    };
    let wall_time_ns = start.elapsed().as_nanos() as u64;

    Ok(ExecutionOutput {
        result: ExecutionResult { exit_code, wall_time_ns, timed_out },
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}

enum DrainEvent {
    Line(bool, String),
    Done,
}

fn spawn_drain_thread<R: Read + Send + 'static>(reader: R, tx: mpsc::Sender<DrainEvent>, is_stdout: bool) {
    thread::spawn(move || {
        let buffered = BufReader::new(reader);
        for line in buffered.lines().map_while(Result::ok) {
            if tx.send(DrainEvent::Line(is_stdout, line)).is_err() {
                return;
            }
        }
        let _ = tx.send(DrainEvent::Done);
    });
}

fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!(target: "executor", "failed to kill timed-out process: {e}");
    }
    let _ = child.wait();
}

/// One Executor worker thread. Pops a case off the execution queue, runs
/// both VM passes, and forwards the result to the Evaluator. A compiler
/// failure archives the case as failed (never a bug) and moves on.
pub struct Executor {
    pub id: usize,
    workspace: Arc<Workspace>,
    compiler: Arc<CompilerServiceClient>,
    vm: Arc<VmRunner>,
    stats: Arc<GlobalStats>,
    execution_queue: Arc<ExecutionQueue>,
    evaluation_queue: Arc<EvaluationQueue>,
    shutdown: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        id: usize,
        workspace: Arc<Workspace>,
        compiler: Arc<CompilerServiceClient>,
        vm: Arc<VmRunner>,
        stats: Arc<GlobalStats>,
        execution_queue: Arc<ExecutionQueue>,
        evaluation_queue: Arc<EvaluationQueue>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Executor { id, workspace, compiler, vm, stats, execution_queue, evaluation_queue, shutdown }
    }

    pub fn run_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let case = match self.execution_queue.pop_timeout(Duration::from_millis(200)) {
                Ok(case) => case,
                Err(_) => continue,
            };
            if let Err(e) = self.process_case(case) {
                log::warn!(target: "executor", "executor {} dropped case: {e}", self.id);
            }
        }
    }

    fn process_case(&self, case: TestCase) -> Result<(), EngineError> {
        let source_path = self.workspace.case_source_path(&case.name);
        let source = std::fs::read_to_string(&source_path)
            .map_err(|e| crate::error::WorkspaceError::Io { path: source_path.clone(), source: e })?;

        let artifact = match self.compiler.compile(&case.name, &source) {
            Ok(a) => a,
            Err(e) => {
                self.workspace
                    .archive_failed(&case.name, &format!("compile failed: {e}"))
                    .ok();
                return Err(EngineError::CompilerService(e));
            }
        };

        let interpreter = self.vm.run_interpreter(&artifact).map_err(|e| {
            crate::error::WorkspaceError::Io { path: self.vm.jdk_bin().to_path_buf(), source: e }
        })?;
        let jit = self.vm.run_jit(&artifact, &source).map_err(|e| crate::error::WorkspaceError::Io {
            path: self.vm.jdk_bin().to_path_buf(),
            source: e,
        })?;

        if interpreter.result.timed_out {
            self.stats.bump_int_timeout();
        }
        if jit.result.timed_out {
            self.stats.bump_jit_timeout();
        }
        self.stats.record_runtime_ms(jit.result.wall_time_ns as f64 / 1_000_000.0);

        let result = TestCaseResult { case_name: case.name.clone(), interpreter, jit, compilable: true };
        self.evaluation_queue
            .push(EvaluationJob { case, result })
            .map_err(|_| crate::error::WorkspaceError::NotFound("evaluation queue closed".into()))?;
        Ok(())
    }
}

/// Re-parse a JIT run's stdout into optimization vectors. Exposed at module
/// level so the Evaluator doesn't need to depend on `executor` internals
/// beyond the parsed text it already received in a `TestCaseResult`.
pub fn extract_vectors(jit_stdout: &str) -> crate::optvec::OptimizationVectors {
    parse_jit_stdout(jit_stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_process_reports_real_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(out.result.exit_code, Some(7));
        assert!(!out.result.timed_out);
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out-line; echo err-line 1>&2"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.stdout.contains("out-line"));
        assert!(out.stderr.contains("err-line"));
    }

    #[test]
    fn slow_process_is_force_killed_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_with_timeout(cmd, Duration::from_millis(200)).unwrap();
        assert!(out.result.timed_out);
        assert_eq!(out.result.exit_code_reliable(), None);
    }

    #[test]
    fn extracts_top_level_and_nested_class_names() {
        let source = "class Outer { static class Inner { } }\nclass Sibling {}";
        assert_eq!(extract_class_names(source), vec!["Outer", "Inner", "Sibling"]);
    }

    #[test]
    fn extract_class_names_deduplicates_and_preserves_order() {
        let source = "class A {}\nclass B extends A {}\nclass A {}";
        assert_eq!(extract_class_names(source), vec!["A", "B"]);
    }

    #[test]
    fn extract_class_names_empty_for_no_declarations() {
        assert!(extract_class_names("// just a comment").is_empty());
    }
}
