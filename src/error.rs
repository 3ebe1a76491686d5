//! Error types for the fixture execution core.
//!
//! Errors fall into three groups:
//!
//! - configuration errors, raised while resolving a [`Namespace`](crate::Namespace)
//!   and always before any apparatus is touched;
//! - instrument failures (including timeouts), which [`Fixture::gather`](crate::Fixture::gather)
//!   captures into a failing [`Artifacts`](crate::Artifacts) instead of returning;
//! - programming defects, which always propagate to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::artifacts::{result_code, Artifacts};

/// Top-level error type for fixture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration, unresolved interpolation or unknown option.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configuration source could not be read or parsed.
    #[error("configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// An expected failure of the external apparatus or subprocess.
    #[error("instrument failure: {0}")]
    Instrument(String),

    /// A deadline expired before the fixture finished.
    #[error("{fixture} timed out after {after:?}")]
    Timeout { fixture: String, after: Duration },

    /// IO error while talking to the apparatus.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixture with the same canonical name is already registered.
    #[error("a fixture named '{0}' is already registered")]
    DuplicateFixture(String),

    /// No fixture with this canonical name is registered.
    #[error("no fixture named '{0}' is registered")]
    UnknownFixture(String),

    /// The fixture outlived the manager it was created against.
    #[error("the fixture manager for '{0}' has been dropped")]
    ManagerDropped(String),

    /// A manager was created outside of a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// Artifact data could not be serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A task spawned on the shared scheduler failed to join.
    #[error("task failure: {0}")]
    Task(String),

    /// Raised by [`assert_success`](crate::assert_success) for failing artifacts.
    #[error("assertion failed (result code {result_code:?}): {report}")]
    AssertionFailed {
        result_code: Option<i32>,
        report: String,
        artifacts: Box<Artifacts>,
    },
}

impl Error {
    /// Returns true for failures `gather` converts into failing artifacts.
    pub fn is_instrument_failure(&self) -> bool {
        matches!(
            self,
            Error::Instrument(_) | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The result code used when this error is captured into artifacts.
    pub fn result_code(&self) -> i32 {
        if self.is_timeout() {
            result_code::TIMEOUT
        } else {
            result_code::FAILURE
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigSource(_) => "configuration",
            Error::Instrument(_) => "instrument",
            Error::Timeout { .. } => "timeout",
            Error::Io(_) => "io",
            Error::DuplicateFixture(_) => "duplicate_fixture",
            Error::UnknownFixture(_) => "unknown_fixture",
            Error::ManagerDropped(_) => "manager_dropped",
            Error::NoRuntime(_) => "no_runtime",
            Error::Json(_) => "serialization",
            Error::Task(_) => "task",
            Error::AssertionFailed { .. } => "assertion",
        }
    }
}

/// Result type alias for fixture operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_failures_are_classified() {
        assert!(Error::Instrument("debugger unplugged".into()).is_instrument_failure());
        assert!(Error::Io(std::io::Error::other("broken pipe")).is_instrument_failure());
        assert!(Error::Timeout {
            fixture: "cmd".into(),
            after: Duration::from_secs(1)
        }
        .is_instrument_failure());
    }

    #[test]
    fn defects_are_not_instrument_failures() {
        assert!(!Error::Config("bad".into()).is_instrument_failure());
        assert!(!Error::DuplicateFixture("bar".into()).is_instrument_failure());
        assert!(!Error::UnknownFixture("nope".into()).is_instrument_failure());
    }

    #[test]
    fn timeout_maps_to_timeout_code() {
        let err = Error::Timeout {
            fixture: "gather".into(),
            after: Duration::from_millis(10),
        };
        assert_eq!(err.result_code(), result_code::TIMEOUT);
        assert_eq!(
            Error::Instrument("x".into()).result_code(),
            result_code::FAILURE
        );
    }
}
