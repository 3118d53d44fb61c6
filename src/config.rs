//! CLI surface (`SPEC_FULL.md` §6, §6.1), built with `clap`'s derive API
//! and environment-variable fallbacks under a `JITFUZZ_` prefix.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::corpus::CorpusPolicy;
use crate::error::ConfigError;
use crate::scheduler::MutatorPolicyKind;
use crate::scoring::ScoringMode;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum RunMode {
    Fuzz,
    FuzzAsserts,
    TestMutator,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CorpusPolicyArg {
    Champion,
    Random,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MutatorPolicyArg {
    Uniform,
    Bandit,
    Mop,
}

#[derive(Debug, Parser)]
#[command(name = "jit-fuzz", about = "Feedback-driven grey-box fuzzer for an optimizing JIT compiler")]
pub struct Cli {
    /// Directory of seed source files to load at startup.
    #[arg(long, env = "JITFUZZ_SEEDS")]
    pub seeds: PathBuf,

    #[arg(long, value_enum, default_value = "fuzz")]
    pub mode: RunMode,

    #[arg(long, env = "JITFUZZ_EXECUTORS", default_value_t = 4)]
    pub executors: usize,

    #[arg(long, env = "JITFUZZ_RNG_SEED")]
    pub rng: Option<u64>,

    #[arg(long = "scoring", env = "JITFUZZ_SCORING", default_value = "pf-idf")]
    pub scoring: String,

    #[arg(long = "corpus-policy", value_enum, env = "JITFUZZ_CORPUS_POLICY", default_value = "champion")]
    pub corpus_policy: CorpusPolicyArg,

    /// Acceptance probability used only when `--corpus-policy random`.
    #[arg(long, default_value_t = 0.2)]
    pub random_accept_probability: f64,

    #[arg(long, default_value_t = 256)]
    pub corpus_capacity: usize,

    #[arg(long = "mutator-policy", value_enum, env = "JITFUZZ_MUTATOR_POLICY", default_value = "uniform")]
    pub mutator_policy: MutatorPolicyArg,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "JITFUZZ_JDK")]
    pub jdk: PathBuf,

    #[arg(long)]
    pub debug_jdk: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub print_ast: bool,

    /// Restrict mutation to a single named mutator; absent means the
    /// scheduler may pick from the full registry.
    #[arg(long)]
    pub mutator: Option<String>,

    #[arg(long, default_value_t = 8)]
    pub test_mutator_seeds: usize,

    #[arg(long, default_value_t = 100)]
    pub test_mutator_iterations: usize,

    #[arg(long, env = "JITFUZZ_COMPILER_SERVICE_URL", default_value = "http://127.0.0.1:8089")]
    pub compiler_service_url: String,

    #[arg(long, default_value = "fuzz_sessions")]
    pub session_base_dir: PathBuf,

    #[arg(long, default_value = "java")]
    pub source_ext: String,

    #[arg(long, default_value_t = false)]
    pub runtime_weight: bool,
}

pub struct Config {
    pub seeds: PathBuf,
    pub mode: RunMode,
    pub executors: usize,
    pub rng_seed: u64,
    pub scoring: ScoringMode,
    pub corpus_policy: CorpusPolicy,
    pub corpus_capacity: usize,
    pub mutator_policy: MutatorPolicyKind,
    pub jdk: PathBuf,
    pub print_ast: bool,
    pub single_mutator: Option<String>,
    pub test_mutator_seeds: usize,
    pub test_mutator_iterations: usize,
    pub compiler_service_url: String,
    pub session_base_dir: PathBuf,
    pub source_ext: String,
    pub runtime_weight: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if !cli.seeds.is_dir() {
            return Err(ConfigError::SeedsDirMissing(cli.seeds));
        }
        if cli.executors == 0 {
            return Err(ConfigError::ZeroExecutors(cli.executors));
        }

        let scoring = cli
            .scoring
            .parse::<ScoringMode>()
            .map_err(|_| ConfigError::InvalidFlag { flag: "scoring", value: cli.scoring.clone() })?;

        let corpus_policy = match cli.corpus_policy {
            CorpusPolicyArg::Champion => CorpusPolicy::Champion,
            CorpusPolicyArg::Random => {
                CorpusPolicy::Random { accept_probability: cli.random_accept_probability }
            }
        };

        let mutator_policy = match cli.mutator_policy {
            MutatorPolicyArg::Uniform => MutatorPolicyKind::Uniform,
            MutatorPolicyArg::Bandit => MutatorPolicyKind::Bandit,
            MutatorPolicyArg::Mop => MutatorPolicyKind::Mop,
        };

        let jdk = cli.debug_jdk.unwrap_or(cli.jdk);

        Ok(Config {
            seeds: cli.seeds,
            mode: cli.mode,
            executors: cli.executors,
            rng_seed: cli.rng.unwrap_or(0),
            scoring,
            corpus_policy,
            corpus_capacity: cli.corpus_capacity,
            mutator_policy,
            jdk,
            print_ast: cli.print_ast,
            single_mutator: cli.mutator,
            test_mutator_seeds: cli.test_mutator_seeds,
            test_mutator_iterations: cli.test_mutator_iterations,
            compiler_service_url: cli.compiler_service_url,
            session_base_dir: cli.session_base_dir,
            source_ext: cli.source_ext,
            runtime_weight: cli.runtime_weight,
        })
    }
}
