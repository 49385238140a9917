//! Tagged logging facade
//!
//! Thin layer over the `log` crate so call sites read the same everywhere:
//!
//! ```rust
//! use geocall::logger::{self, LogTag};
//!
//! logger::warning(LogTag::RateLimit, "Waited 1.2s for a geocode token");
//! logger::debug(LogTag::Retry, "Attempt 2 failed, backing off 1s");
//! ```
//!
//! Call `logger::init()` once at startup to install `env_logger`
//! (enabled by the default `logging` feature). Filtering follows `RUST_LOG`,
//! with each tag mapped to its own target (`geocall::cache`, ...).

mod core;
mod levels;
mod tags;

pub use levels::LogLevel;
pub use tags::LogTag;

/// Install `env_logger` with an `info` default filter
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Install `env_logger` with `level` as the default threshold
///
/// `RUST_LOG`, when set, still takes precedence.
#[cfg(feature = "logging")]
pub fn init_with_level(level: LogLevel) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.filter_directive()),
    )
    .format_timestamp_millis()
    .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: LogLevel) {}

/// Log at ERROR level (critical failures)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level (issues that need attention)
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level (detailed diagnostics)
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level (very detailed tracing)
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Whether a message at `level` for `tag` would be emitted
///
/// Lets callers skip building expensive messages.
pub fn enabled(tag: LogTag, level: LogLevel) -> bool {
    core::should_log(&tag, level)
}
