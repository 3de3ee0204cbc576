//! Tracing subscriber setup for the binary.

use std::env;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `tidytree=debug`.
pub const LOG_ENV: &str = "TIDYTREE_LOG";

/// Installs a stderr fmt subscriber.
///
/// The filter comes from `TIDYTREE_LOG`; without it the level is `warn`, or
/// `debug` when `verbose` is set. Progress bars own stdout, so logs never go there.
/// Calling this twice keeps the first subscriber.
pub fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
