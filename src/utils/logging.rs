//! Logger bootstrap plus per-module switchable logging macros.
//!
//! A module opts into the macros by declaring its own flag:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//!
//! log_info!("replay feed finished: {} records", 3);
//! ```
//! Flipping the flag to `false` silences that module without touching `RUST_LOG`.

use log::LevelFilter;

/// Initializes `env_logger` once. `RUST_LOG` overrides the default level.
pub fn init_logging(default_level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// `log::info!` gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// `log::warn!` gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// `log::error!` gated on the calling module's `ENABLE_LOGS` const.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
