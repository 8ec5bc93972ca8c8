//! Logging utilities
//!
//! The crate logs through the `log` facade. Hosts that do not install their own
//! logger can call [`init`] once at startup.

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let _ = env_logger::try_init();
}

/// Initialize the logging system with a fixed default level
///
/// `RUST_LOG` still overrides the level when set.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}
