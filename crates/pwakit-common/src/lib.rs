//! # PwaKit Common
//!
//! Shared error types, logging configuration and small runtime utilities for
//! the PwaKit crates.
//!
//! ## Features
//!
//! - Categorized error type with an optional underlying cause
//! - Logging configuration and setup
//! - Opt-in event throttling

use thiserror::Error;

pub mod logging;
pub mod throttle;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat, LOG_FORMAT_ENV};
pub use throttle::{Throttle, FRAME_INTERVAL};

/// Boxed cause carried by the categorized variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type shared by the PwaKit crates.
///
/// The first three variants are categories; attach the underlying cause with
/// [`PwaKitError::with_source`].
#[derive(Error, Debug)]
pub enum PwaKitError {
    /// A cache generation could not be read or written.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Install, activate or a state transition failed.
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Bad or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl PwaKitError {
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause. No effect on variants without a source slot.
    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &mut self {
            PwaKitError::Cache { source, .. }
            | PwaKitError::Lifecycle { source, .. }
            | PwaKitError::Config { source, .. } => *source = Some(Box::new(cause)),
            _ => {}
        }
        self
    }

    /// Short category name, used as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            PwaKitError::Cache { .. } => "cache",
            PwaKitError::Lifecycle { .. } => "lifecycle",
            PwaKitError::Config { .. } => "config",
            PwaKitError::Io(_) => "io",
            PwaKitError::NotFound(_) => "not_found",
            PwaKitError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for PwaKit operations.
pub type Result<T> = std::result::Result<T, PwaKitError>;
