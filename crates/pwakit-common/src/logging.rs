//! Logging configuration and setup.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{PwaKitError, Result};

/// Crates whose output is raised to the configured level by default.
const PWAKIT_TARGETS: &[&str] = &["pwakit_common", "pwakit_net", "pwakit_sw", "pwakit_page"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the pwakit crates.
    pub level: Level,
    /// Level for everything else (reqwest, hyper, ...).
    pub dependency_level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "pwakit_sw=trace,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            dependency_level: Level::WARN,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Debug configuration: fetch routing and cache hits become visible.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Production configuration: JSON lines at info.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The filter directive this configuration resolves to.
    pub fn directive(&self) -> String {
        if let Some(ref custom) = self.filter {
            return custom.clone();
        }
        let level = self.level.as_str().to_ascii_lowercase();
        let mut directive = self.dependency_level.as_str().to_ascii_lowercase();
        for target in PWAKIT_TARGETS {
            directive.push_str(&format!(",{}={}", target, level));
        }
        directive
    }
}

/// Initialize logging with the given configuration.
///
/// `RUST_LOG` wins over the configured levels unless a custom filter was set.
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = if config.filter.is_some() {
        EnvFilter::try_new(config.directive())
            .map_err(|e| PwaKitError::config_with_source("invalid log filter", e))?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directive()))
    };

    let span_events = if config.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
    };

    result.map_err(|e| PwaKitError::config_with_source("logging already initialised", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.include_location);
    }

    #[test]
    fn test_default_directive_scopes_pwakit_crates() {
        let directive = LogConfig::debug().directive();
        assert!(directive.starts_with("warn"));
        assert!(directive.contains("pwakit_sw=debug"));
        assert!(directive.contains("pwakit_page=debug"));
    }

    #[test]
    fn test_custom_filter_overrides_levels() {
        let config = LogConfig::production().with_filter("pwakit_sw=trace");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directive(), "pwakit_sw=trace");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LogConfig::default().with_filter("pwakit_sw=[");
        assert!(init_logging(config).is_err());
    }
}
