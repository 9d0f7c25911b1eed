//! Tracing subscriber setup for the CLI.
//!
//! Logs go to stderr so stdout stays reserved for command output. The
//! filter honours `RUST_LOG`; without it, `artifact_catalog=info`, or
//! `artifact_catalog=debug` when verbose.

use tracing_subscriber::EnvFilter;

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "artifact_catalog=debug"
    } else {
        "artifact_catalog=info"
    }
}

/// Installs the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
