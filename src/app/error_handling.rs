//! Error handling utilities

use tracing::error;

use crate::error::{describe_error_code, JobGuardError};

/// Report a fatal error and exit with its status code
///
/// A `JobGuardError` anywhere in the chain supplies the user message, the
/// numeric code and the exit status. With `verbose >= 1` the full chain is
/// printed as well.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {:#}", error);

    let guard_error = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<JobGuardError>());

    let exit_code = match guard_error {
        Some(err) => {
            eprintln!("{} [E{:04}]", err.user_message(), err.code());
            err.exit_code()
        }
        None => {
            eprintln!("Error: {error}");
            1
        }
    };

    if verbose >= 1 {
        if let Some(err) = guard_error {
            eprintln!("\nE{:04}: {}", err.code(), describe_error_code(err.code()));
        }
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code)
}
