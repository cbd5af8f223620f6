//! Structured logging for the cycle-count services.
//!
//! Filtering comes from `RUST_LOG` (default `info`). Output is one JSON object
//! per line unless `FACILITYOPS_LOG_FORMAT=compact` asks for human-readable
//! lines during local work.

use tracing_subscriber::EnvFilter;

/// Selects the output format.
pub const LOG_FORMAT_VAR: &str = "FACILITYOPS_LOG_FORMAT";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_FORMAT_VAR).ok().as_deref())
    }

    /// Unknown or missing values fall back to JSON.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("compact") => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

pub fn init() {
    init_with(LogFormat::from_env());
}

/// Install a subscriber with an explicit format. Later calls are no-ops.
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_current_span(true)
            .try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" Compact ")), LogFormat::Compact);
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogFormat::Compact);
        init_with(LogFormat::Json);
        ::tracing::info!("still logging");
    }
}
