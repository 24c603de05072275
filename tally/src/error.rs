//! Error types for the tally rollup reader.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// The main error type for all tally operations.
///
/// Store failures keep their own taxonomy ([`StoreError`]) so callers can tell
/// a transient outage from a permanent fault. Absence of data is never an
/// error; reads report it as `None` or an empty map.
#[derive(Error, Debug)]
pub enum TallyError {
    /// A store call was attempted and failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The fast-fail guard is open; no store call was made.
    #[error("backend unavailable, fast-failing for another {retry_after:?}")]
    BackendUnavailable {
        /// Time left until the guard lets a probe through.
        retry_after: Duration,
    },

    /// Invalid configuration detected while constructing a component.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A caller supplied an unusable time range.
    #[error("range error: {0}")]
    Range(#[from] RangeError),
}

impl TallyError {
    /// Returns `true` if retrying later may succeed.
    ///
    /// Both a real outage and a fast-fail short circuit are transient;
    /// corrupt data, bad requests and configuration faults are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::BackendUnavailable { .. } => true,
            Self::Configuration(_) | Self::Range(_) => false,
        }
    }
}

/// Failures reported by a [`MetricStore`](crate::store::MetricStore) backend.
///
/// Backends map their native failures onto these three classes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or timed out.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
        /// Underlying I/O error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The backend returned data that cannot be interpreted.
    #[error("store data corrupt: {reason}")]
    Corrupt {
        /// Description of what was invalid.
        reason: String,
    },

    /// The backend rejected the request itself.
    #[error("bad store request: {reason}")]
    BadRequest {
        /// Why the request was rejected.
        reason: String,
    },
}

impl StoreError {
    /// Builds an [`StoreError::Unavailable`] without an underlying I/O error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            source: None,
        }
    }

    /// Returns `true` for outages that should trip the fast-fail guard.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors raised while building components from configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A configuration source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    /// The fast-fail delay policy is unusable.
    #[error("invalid fast-fail policy: {reason}")]
    InvalidBreakerPolicy {
        /// Description of what makes the policy invalid.
        reason: String,
    },

    /// The calendar offset is outside the range chrono accepts.
    #[error("invalid calendar utc offset: {seconds}s (must be within +/-86399s)")]
    InvalidUtcOffset {
        /// The rejected offset in seconds east of UTC.
        seconds: i32,
    },

    /// A file-backed store was requested without a directory.
    #[error("store backend 'file' requires a path")]
    MissingStorePath,

    /// A file-backed store directory could not be prepared.
    #[error("failed to prepare store directory '{path}': {source}")]
    StoreDirectory {
        /// The directory that could not be created.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors describing an invalid time range.
#[derive(Error, Debug)]
pub enum RangeError {
    /// The range is empty or inverted.
    #[error("invalid time range: start {start} >= end {end}")]
    Empty {
        /// The start instant.
        start: DateTime<Utc>,
        /// The end instant.
        end: DateTime<Utc>,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Result type returned by [`MetricStore`](crate::store::MetricStore) implementations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::unavailable("timeout").is_transient());
        assert!(
            !StoreError::Corrupt {
                reason: "bad json".to_string()
            }
            .is_transient()
        );
        assert!(
            !StoreError::BadRequest {
                reason: "entity mismatch".to_string()
            }
            .is_transient()
        );

        let short_circuit = TallyError::BackendUnavailable {
            retry_after: Duration::from_millis(500),
        };
        assert!(short_circuit.is_transient());
        assert!(!TallyError::Configuration(ConfigurationError::MissingStorePath).is_transient());
    }

    #[test]
    fn test_store_error_converts_into_tally_error() {
        let err: TallyError = StoreError::unavailable("connection refused").into();
        assert!(matches!(err, TallyError::Store(StoreError::Unavailable { .. })));
        assert_eq!(
            err.to_string(),
            "store error: store unavailable: connection refused"
        );
    }
}
