//! Shared error classification for acquisition services
//!
//! Each service keeps its own domain error enums (built with `thiserror`) and
//! implements [`ClassifiedError`] so that loops, logs and status payloads can
//! treat them uniformly: which failures are worth retrying, how loudly to
//! log them, and which ones must stop startup.

use serde::{Deserialize, Serialize};
use tracing::Level;

/// Error category enum - used for classification, logging and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Io,
    Timeout,

    // Device communication layer
    Connection,
    Protocol,

    // Data layer
    Parse,
    Conversion,
    Storage,

    // System level
    ResourceExhausted,
    Internal,
}

impl ErrorCategory {
    /// Stable lowercase name, used as a log field and counter key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Parse => "parse",
            Self::Conversion => "conversion",
            Self::Storage => "storage",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error capability trait shared by every service error type
///
/// Services keep their domain-specific variants and gain a common outward
/// interface by implementing `error_code` and `category`; the remaining
/// methods have category-based defaults that may be overridden.
pub trait ClassifiedError: std::error::Error + Send + Sync + 'static {
    /// Stable error code (for logs and status payloads)
    fn error_code(&self) -> &'static str;

    /// Error category
    fn category(&self) -> ErrorCategory;

    /// Whether repeating the same operation later may succeed
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Io
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::Storage
        )
    }

    /// Whether the error must prevent the service from starting
    fn is_fatal_at_startup(&self) -> bool {
        matches!(self.category(), ErrorCategory::Configuration)
    }

    /// Log level for a single occurrence of this error
    fn log_level(&self) -> Level {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::Io
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol
            | ErrorCategory::Storage
            | ErrorCategory::ResourceExhausted => Level::WARN,
            ErrorCategory::Parse | ErrorCategory::Conversion => Level::DEBUG,
        }
    }
}

/// Emit a classified error at its own log level
///
/// `tracing` macros need a constant level, so the dispatch happens here once
/// instead of at every call site.
pub fn log_classified<E: ClassifiedError + ?Sized>(err: &E, context: &str) {
    let code = err.error_code();
    let category = err.category().as_str();
    match err.log_level() {
        Level::ERROR => tracing::error!(code, category, "{context}: {err}"),
        Level::WARN => tracing::warn!(code, category, "{context}: {err}"),
        Level::INFO => tracing::info!(code, category, "{context}: {err}"),
        Level::DEBUG => tracing::debug!(code, category, "{context}: {err}"),
        _ => tracing::trace!(code, category, "{context}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe(ErrorCategory);

    impl std::fmt::Display for Probe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "probe {}", self.0)
        }
    }

    impl std::error::Error for Probe {}

    impl ClassifiedError for Probe {
        fn error_code(&self) -> &'static str {
            "PROBE"
        }

        fn category(&self) -> ErrorCategory {
            self.0
        }
    }

    #[test]
    fn test_retryable_by_category() {
        assert!(Probe(ErrorCategory::Timeout).is_retryable());
        assert!(Probe(ErrorCategory::Connection).is_retryable());
        assert!(Probe(ErrorCategory::Storage).is_retryable());
        assert!(!Probe(ErrorCategory::Configuration).is_retryable());
        assert!(!Probe(ErrorCategory::Parse).is_retryable());
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(Probe(ErrorCategory::Configuration).is_fatal_at_startup());
        assert!(!Probe(ErrorCategory::Connection).is_fatal_at_startup());
        assert!(!Probe(ErrorCategory::Internal).is_fatal_at_startup());
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(Probe(ErrorCategory::Internal).log_level(), Level::ERROR);
        assert_eq!(Probe(ErrorCategory::Protocol).log_level(), Level::WARN);
        assert_eq!(Probe(ErrorCategory::Conversion).log_level(), Level::DEBUG);
    }

    #[test]
    fn test_category_serializes_snake_case() {
        assert_eq!(ErrorCategory::ResourceExhausted.as_str(), "resource_exhausted");
        assert_eq!(ErrorCategory::Io.to_string(), "io");
    }
}
