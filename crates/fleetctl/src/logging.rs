use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const AUDIT_FILE: &str = "audit.log";

fn stderr_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Human-readable events on stderr, plus a daily JSON audit file when `audit_dir` is set.
///
/// `RUST_LOG` overrides the stderr level. The audit file always records `info` and above.
pub(crate) fn init_tracing(
    verbosity: u8,
    audit_dir: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(stderr_directive(verbosity)));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let mut audit_error = None;
    let (file_layer, guard) = match audit_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, AUDIT_FILE);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_target(false)
                    .json()
                    .with_filter(EnvFilter::new("info"));
                (Some(layer), Some(guard))
            }
            Err(err) => {
                audit_error = Some(format!("{}: {err}", dir.display()));
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}"))?;

    if let Some(error) = audit_error {
        tracing::warn!(event = "logging.audit_disabled", error = %error, "audit log unavailable");
    }
    Ok(guard)
}
