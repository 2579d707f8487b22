//! Structured logging bootstrap using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is selected with the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for production and log aggregation
//! - `pretty` - Multi-line, colored output for development
//! - `compact` - Colored single-line output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact - defaults to json
//! - `LOG_SPANS`: Emit span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Replaces the computed filter entirely
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO ./mqtt-pool run
//!
//! # Follow reconnection attempts per broker
//! LOG_FORMAT=compact LOG_SPANS=true LOG_LEVEL=DEBUG ./mqtt-pool run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies capped at warn regardless of `LOG_LEVEL`
const QUIET_DEPENDENCIES: [&str; 3] = ["rumqttc=warn", "hyper=warn", "warp=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Filter for `level` with noisy dependencies quieted
pub fn default_filter(level: Level) -> EnvFilter {
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => default_filter(level),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_ansi(true)
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).init();
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(false)
                .with_span_events(span_events(include_spans));
            subscriber.with(fmt_layer).init();
        }
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Create a span scoping one broker connection's events
#[macro_export]
macro_rules! connection_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_connection", $($field)*)
    };
}

/// Create a control API request span
#[macro_export]
macro_rules! api_span {
    ($($field:tt)*) => {
        tracing::info_span!("control_request", $($field)*)
    };
}

pub use {api_span, connection_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = vec![
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("DEBUG", Level::DEBUG),
            ("trace", Level::TRACE),
            ("", Level::INFO),
            ("verbose", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_default_filter_quiets_dependencies() {
        let rendered = default_filter(Level::DEBUG).to_string();

        assert!(rendered.to_lowercase().contains("debug"));
        for directive in QUIET_DEPENDENCIES {
            assert!(rendered.contains(directive), "missing {directive}");
        }
    }

    #[test]
    fn test_span_events_toggle() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }
}
