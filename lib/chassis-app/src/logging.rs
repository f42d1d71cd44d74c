//! Logging.

use chassis_error::{ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _};

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `CHASSIS_LOG_LEVEL` environment variable to determine the log filtering directives to use.
/// If the environment variable is not set, the given default level is used, falling back to `INFO` when no default is
/// given either. Additionally, it reads the `CHASSIS_LOG_FORMAT_JSON` environment variable to determine which output
/// format to use. If it is set to `true` or `1`, the logs will be formatted as JSON. If it is set to any other value,
/// or not set at all, the logs will default to a rich, colored, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let is_json = std::env::var("CHASSIS_LOG_FORMAT_JSON")
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    // Load our level filtering directives from the environment, falling back to the given default
    // if the environment variable is not specified.
    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var("CHASSIS_LOG_LEVEL")
        .from_env_lossy();

    if is_json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(json_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install the global tracing subscriber.")?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::layer();
        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install the global tracing subscriber.")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_second_initialization_fails() {
        assert!(initialize_logging(None).is_ok());
        assert!(initialize_logging(None).is_err());
    }
}
