use anyhow::{Context, Result};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::version::TargetPolicy;

/// Environment variable holding `EnvFilter` directives.
pub const LOG_ENV: &str = "CLASS_DOWNGRADER_LOG";

pub const MAX_THREADS: usize = 255;

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for machine readable output.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn resolve_threads(cli: &Cli) -> usize {
    let requested = cli.threads.filter(|n| *n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    });
    requested.min(MAX_THREADS)
}

pub fn resolve_policy(cli: &Cli) -> Result<TargetPolicy> {
    TargetPolicy::new(cli.target).with_context(|| format!("unsupported target {}", cli.target))
}

/// Refuses to write the output over the input.
pub fn check_paths(input: &Path, output: &Path) -> Result<()> {
    let same = match (input.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => input == output,
    };
    if same {
        anyhow::bail!("output must differ from input: {}", output.display());
    }
    Ok(())
}
