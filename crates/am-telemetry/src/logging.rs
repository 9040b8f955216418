use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse the `general.log_format` config value. Anything other than
    /// `"json"` selects human-readable output.
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output format.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "debug", "am_session=debug,warn").
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output format.
///
/// Safe to call multiple times -- subsequent calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Initialize logging in the given format.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Pretty => init_logging(service_name, default_level),
        LogFormat::Json => init_logging_json(service_name, default_level),
    }
}

/// Test helper: route logs through the test writer so `cargo test` captures
/// them per test.
pub fn init_test_logging() {
    fmt()
        .with_env_filter(env_filter("debug"))
        .with_test_writer()
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_config() {
        assert_eq!(LogFormat::from_config("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_config("whatever"), LogFormat::Pretty);
    }

    #[test]
    fn repeated_init_is_a_noop() {
        init_test_logging();
        init_logging("test", "info");
        init_logging_json("test", "info");
    }
}
