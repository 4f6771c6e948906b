mod channel;
mod cli;
mod commands;
mod config;
mod context;
mod errors;
mod logging;
mod migrate;
mod redeploy;
mod registry;
mod state;
mod status;
mod supervisor;

#[cfg(test)]
mod test_utils;

use std::process::ExitCode;

use clap::Parser;
use system_utils::path::expand_tilde;
use tracing::info;

use crate::cli::Args;
use crate::errors::{is_precondition, remedy};
use crate::logging::init_tracing;

const EXIT_FAILURE: u8 = 1;
const EXIT_PRECONDITION: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let audit_dir = (!args.global.no_audit_log).then(|| expand_tilde(&args.global.audit_dir));
    let _guard = match init_tracing(args.global.verbose, audit_dir.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("warning: {err:#}");
            None
        }
    };

    let command = args.command.name();
    info!(
        event = "cli.invoked",
        command,
        state_file = %args.global.state_file.display(),
        "fleetctl invoked"
    );
    match commands::run(args).await {
        Ok(code) => {
            info!(event = "cli.finished", command, code, "command finished");
            ExitCode::from(code)
        }
        Err(err) => {
            let code = if is_precondition(&err) {
                EXIT_PRECONDITION
            } else {
                EXIT_FAILURE
            };
            info!(
                event = "cli.failed",
                command,
                code,
                error = %format!("{err:#}"),
                "command failed"
            );
            eprintln!("error: {err:#}");
            if let Some(remedy) = remedy(&err) {
                eprintln!("hint: {remedy}");
            }
            ExitCode::from(code)
        }
    }
}
