//! Application module
//!
//! Binary-side plumbing shared by the CLI and the integration tests:
//! - Logging setup
//! - Fatal error reporting
//! - Wiring every service from one configuration

pub mod error_handling;
pub mod logging;
pub mod runtime;

pub use error_handling::handle_fatal_error;
pub use logging::{init_logging, log_filter};
pub use runtime::Services;
