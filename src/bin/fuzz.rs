//! CLI entrypoint. Parses configuration, builds the mutator registry, and
//! runs the Session Controller end to end.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use jit_fuzz::config::{Cli, Config};
use jit_fuzz::mutation::SourceMutator;
use jit_fuzz::session::SessionController;

fn default_mutator_registry() -> HashMap<String, Arc<dyn SourceMutator>> {
    // The mutators themselves are an external collaborator
    // (`SPEC_FULL.md` §1): a pure function from a program AST to a
    // possibly-empty new AST. This crate only ever dispatches by name.
    HashMap::new()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level)).init();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "config", "{e}");
            return ExitCode::FAILURE;
        }
    };

    let controller = match SessionController::new(config, default_mutator_registry()) {
        Ok(controller) => controller,
        Err(e) => {
            log::error!(target: "session", "failed to start session: {e}");
            return ExitCode::FAILURE;
        }
    };

    match controller.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!(target: "session", "session ended with error: {e}");
            ExitCode::FAILURE
        }
    }
}
