use ax_core::config::GeneralConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    /// One JSON object per line, with the current span attached.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Json => "json",
        }
    }
}

/// Install the global subscriber for `service_name`.
///
/// `RUST_LOG` wins over `default_level` (e.g. "info", "ax_engine=debug,warn").
/// Safe to call multiple times; only the first call installs a subscriber.
/// Returns whether this call installed it.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Human => builder.with_thread_ids(false).try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    }
    .is_ok();

    if installed {
        tracing::info!(service = service_name, format = format.as_str(), "logging initialised");
    }
    installed
}

/// Human-readable output.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// JSON output, suitable for log shippers.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}

/// Initialize logging from the `[general]` config section.
pub fn init_from_config(general: &GeneralConfig) -> LogFormat {
    let format = LogFormat::from_json_flag(general.log_json);
    init(&general.service_name, &general.log_level, format);
    format
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_selects_format() {
        assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
        assert_eq!(LogFormat::from_json_flag(false), LogFormat::Human);
        assert_eq!(LogFormat::Json.as_str(), "json");
    }
}
