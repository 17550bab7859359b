//! Logging configuration and initialization

use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

/// Filter directive for a `-v` count; with no flag the configured level wins
pub fn log_filter(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        2 => "trace".to_string(),
        _ => "trace,hyper=debug,reqwest=debug".to_string(),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides everything when set
/// and no `-v` flag was given.
pub fn init_logging(verbose: u8, configured: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env) if verbose == 0 => env,
        _ => EnvFilter::new(log_filter(verbose, configured)),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2) // Show target module for -vv and above
        .with_thread_ids(verbose >= 3)
        .with_line_number(verbose >= 3)
        .try_init();

    debug!("jobguard started with verbosity level: {}", verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
}
