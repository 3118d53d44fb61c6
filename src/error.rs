//! Error taxonomy. Kinds follow `SPEC_FULL.md` §7: a config error aborts the
//! session before workers start; everything else is recovered within the
//! worker that hit it and never escapes as a panic.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("seeds directory {0:?} does not exist or is not a directory")]
    SeedsDirMissing(PathBuf),
    #[error("seeds directory {0:?} contains no usable seed files")]
    NoUsableSeeds(PathBuf),
    #[error("invalid value for --{flag}: {value:?}")]
    InvalidFlag { flag: &'static str, value: String },
    #[error("executors must be >= 1, got {0}")]
    ZeroExecutors(usize),
}

#[derive(Debug, Error)]
pub enum CompilerServiceError {
    #[error("compiler service unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("compiler service returned malformed response: {0}")]
    MalformedResponse(String),
    #[error("compilation failed with {0} diagnostics")]
    CompileFailed(usize),
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("case {0} already exists in the workspace")]
    AlreadyExists(String),
    #[error("case {0} not found in the workspace")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("malformed OPTS block: {0}")]
    MalformedBlock(String),
}

#[derive(Debug, Error)]
pub enum MutatorError {
    #[error("mutator {mutator} failed: {reason}")]
    Failed { mutator: String, reason: String },
}

/// Top-level error returned by `main`. Only config errors and an exhausted
/// compiler-service retry budget are fatal; other kinds are handled inline
/// by the owning pipeline stage and never bubble up this far.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    CompilerService(#[from] CompilerServiceError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}
