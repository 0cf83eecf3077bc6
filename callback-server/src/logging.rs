//! Logging setup for applications embedding the callback server
//!
//! The server itself only emits `tracing` events. These helpers install a
//! subscriber for binaries and demos that do not bring their own.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the [`LoggingMode`]
pub const LOG_MODE_ENV: &str = "HM_RPC_LOG_MODE";

/// Environment variable overriding the log filter
pub const LOG_LEVEL_ENV: &str = "HM_RPC_LOG_LEVEL";

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr output
    Development,
    /// Verbose output with thread ids and source locations
    Debug,
}

impl LoggingMode {
    /// Parse a mode name as used in [`LOG_MODE_ENV`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "silent" => Some(LoggingMode::Silent),
            "development" | "dev" => Some(LoggingMode::Development),
            "debug" => Some(LoggingMode::Debug),
            _ => None,
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Initialize logging with the specified mode
///
/// # Examples
///
/// ```rust,ignore
/// callback_server::logging::init_logging(LoggingMode::Development)?;
/// ```
///
/// # Environment Variables
///
/// - `HM_RPC_LOG_LEVEL`: filter directive, e.g. `callback_server=trace`
/// - `RUST_LOG`: used when `HM_RPC_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `HM_RPC_LOG_MODE`
///
/// Unset means [`LoggingMode::Silent`]. An unrecognised value is an error.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging_from_env_or(LoggingMode::Silent)
}

/// Like [`init_logging_from_env`], with `fallback` used only when
/// `HM_RPC_LOG_MODE` is unset.
pub fn init_logging_from_env_or(fallback: LoggingMode) -> Result<(), LoggingError> {
    init_logging(mode_from_env(std::env::var(LOG_MODE_ENV).ok(), fallback)?)
}

fn mode_from_env(value: Option<String>, fallback: LoggingMode) -> Result<LoggingMode, LoggingError> {
    match value {
        Some(name) => LoggingMode::from_name(&name)
            .ok_or_else(|| LoggingError::InvalidEnv(format!("{LOG_MODE_ENV}={name}"))),
        None => Ok(fallback),
    }
}

/// Build the filter from `HM_RPC_LOG_LEVEL`, then `RUST_LOG`, then `default_level`.
fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var(LOG_LEVEL_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("{directives}: {e}")))
}

/// Check if a global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(LoggingMode::from_name("silent"), Some(LoggingMode::Silent));
        assert_eq!(LoggingMode::from_name(" Debug "), Some(LoggingMode::Debug));
        assert_eq!(LoggingMode::from_name("dev"), Some(LoggingMode::Development));
        assert_eq!(LoggingMode::from_name("loud"), None);
    }

    #[test]
    fn test_explicit_mode_wins_over_fallback() {
        let mode = mode_from_env(Some("silent".to_string()), LoggingMode::Development);
        assert_eq!(mode.unwrap(), LoggingMode::Silent);

        let mode = mode_from_env(None, LoggingMode::Development);
        assert_eq!(mode.unwrap(), LoggingMode::Development);

        assert!(matches!(
            mode_from_env(Some("loud".to_string()), LoggingMode::Development),
            Err(LoggingError::InvalidEnv(_))
        ));
    }
}
