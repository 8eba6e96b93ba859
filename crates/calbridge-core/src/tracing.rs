//! Logging setup shared by the worker daemon and the CLI.
//!
//! ```ignore
//! use calbridge_core::tracing::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::daemon())?;
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to parse env filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// Line format of emitted records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per line; used by the daemon.
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level applied to workspace crates when `RUST_LOG` is unset.
    pub default_level: Level,
    pub output_format: TracingOutputFormat,
    pub include_location: bool,
    pub include_target: bool,
    pub include_timestamp: bool,
    /// Log span open/close, useful to time bridge dispatch.
    pub include_span_events: bool,
    /// Explicit directive, takes precedence over `RUST_LOG`.
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            output_format: TracingOutputFormat::Compact,
            include_location: false,
            include_target: false,
            include_timestamp: true,
            include_span_events: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    /// Verbose, timestamp-less output for `--debug` runs of the CLI.
    #[must_use]
    pub fn cli_debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_location: true,
            include_target: true,
            include_timestamp: false,
            ..Self::default()
        }
    }

    /// Structured output for `calbridge daemon`.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            default_level: Level::INFO,
            output_format: TracingOutputFormat::Json,
            include_location: true,
            include_target: true,
            include_timestamp: true,
            include_span_events: true,
            env_filter: None,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        match self.env_filter {
            Some(ref directive) => Ok(EnvFilter::try_new(directive)?),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(self.default_level)))),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer()
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target)
            .with_span_events(self.span_events());

        match (self.output_format, self.include_timestamp) {
            (TracingOutputFormat::Json, _) => base.json().boxed(),
            (TracingOutputFormat::Pretty, true) => base.pretty().boxed(),
            (TracingOutputFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (TracingOutputFormat::Compact, true) => base.compact().boxed(),
            (TracingOutputFormat::Compact, false) => base.compact().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the filter
/// directive does not parse.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;
    let subscriber = tracing_subscriber::registry()
        .with(config.layer())
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

const CRATE_TARGETS: [&str; 7] = [
    "calbridge",
    "calbridge_client",
    "calbridge_core",
    "calbridge_protocol",
    "calbridge_store",
    "calbridge_providers",
    "calbridge_server",
];

/// Directive enabling `level` for every workspace crate and nothing else.
fn default_directive(level: Level) -> String {
    CRATE_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_quiet_compact() {
        let config = TracingConfig::default();
        assert_eq!(config.default_level, Level::WARN);
        assert_eq!(config.output_format, TracingOutputFormat::Compact);
        assert!(config.env_filter.is_none());
    }

    #[test]
    fn daemon_logs_json_with_spans() {
        let config = TracingConfig::daemon();
        assert_eq!(config.output_format, TracingOutputFormat::Json);
        assert!(config.include_span_events);
        assert_eq!(config.span_events(), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn cli_debug_drops_timestamps() {
        let config = TracingConfig::cli_debug();
        assert_eq!(config.default_level, Level::DEBUG);
        assert!(!config.include_timestamp);
        assert!(config.include_location);
    }

    #[test]
    fn explicit_filter_must_parse() {
        let config = TracingConfig::default().with_env_filter("calbridge_server=verbose");
        assert!(matches!(config.filter(), Err(TracingError::EnvFilter(_))));

        let config = TracingConfig::default().with_env_filter("calbridge_server=trace");
        assert!(config.filter().is_ok());
    }

    #[test]
    fn default_directive_covers_workspace() {
        let directive = default_directive(Level::DEBUG);
        assert!(directive.contains("calbridge_store=DEBUG"));
        assert!(directive.contains("calbridge=DEBUG"));
        assert!(EnvFilter::try_new(&directive).is_ok());
    }
}
