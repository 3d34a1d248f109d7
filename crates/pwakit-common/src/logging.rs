//! Logging setup for PwaKit binaries and tests.
//!
//! Output goes to stderr so a harness can keep stdout for its own report.
//! The filter is taken from, in order: explicit directives, `RUST_LOG`,
//! then the configured level with the HTTP stack held at `warn`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::PwaKitError;

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "PWAKIT_LOG_FORMAT";

/// Crates too chatty at `info` to be useful next to worker logs.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn"];

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, for a developer at a terminal.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = PwaKitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(PwaKitError::config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for everything not covered by a directive.
    pub level: Level,
    pub format: LogFormat,
    /// Print file and line of each event.
    pub include_location: bool,
    /// Log span enter and close.
    pub include_span_events: bool,
    /// Extra `target=level` directives, e.g. `pwakit_sw=trace`.
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Everything at `debug`, with locations and span events.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// JSON lines at `info`, for log collectors.
    pub fn structured() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Defaults, with the format read from [`LOG_FORMAT_ENV`] when set.
    ///
    /// An unrecognised value is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, PwaKitError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(LOG_FORMAT_ENV) {
            config.format = value.parse()?;
        }
        Ok(config)
    }

    /// Add a `target=level` directive.
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, PwaKitError> {
        if self.directives.is_empty() {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return Ok(filter);
            }
        }

        let mut filter = EnvFilter::new(self.level.to_string());
        let directives = QUIET_DEPENDENCIES
            .iter()
            .map(|d| d.to_string())
            .chain(self.directives.iter().cloned());
        for directive in directives {
            let parsed = directive.parse().map_err(|e| {
                PwaKitError::config(format!("bad log directive '{directive}'")).with_source(e)
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global subscriber.
///
/// Fails on a malformed directive or when a subscriber is already installed.
pub fn try_init_logging(config: LogConfig) -> Result<(), PwaKitError> {
    let filter = config.env_filter()?;

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_events(span_events)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| PwaKitError::config("logging already initialized").with_source(e))
}

/// Install the global subscriber, reporting failure on stderr.
pub fn init_logging(config: LogConfig) {
    if let Err(e) = try_init_logging(config) {
        eprintln!("pwakit: {e}");
    }
}
