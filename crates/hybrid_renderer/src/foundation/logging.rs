//! Logging setup
//!
//! Renderer log lines carry a bracketed subsystem tag such as `[ALLOC]`,
//! `[ACCEL]` or `[FRAME]` so `RUST_LOG` output can be grepped by subsystem.

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default level used when `RUST_LOG` is unset
pub fn init_with_level(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .parse_default_env()
        .init();
}
