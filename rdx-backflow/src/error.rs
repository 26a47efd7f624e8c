//! Error types for pipelines and for the step verifier.
//!
//! Pipeline errors ([`FlowError`]) travel through a stream as its terminal
//! `Error` signal and never escape a subscription as a panic. Verifier errors
//! ([`VerifyError`]) are test-time only and are returned to the test runner.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The cause carried by an `Error` signal.
///
/// `Clone` so that a hub can broadcast the same terminal signal to every
/// attached downstream subscriber.
#[derive(thiserror::Error, Debug, Clone)]
pub enum FlowError {
    /// A consumer broke the demand protocol, e.g. `request(0)`.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A user-supplied transform failed.
    #[error("transform failed: {0}")]
    Transform(String),

    /// A producer had an item to deliver while its consumer had no demand.
    #[error("overflow: {0}")]
    Overflow(String),

    /// A failure propagated from an external collaborator, e.g. a transport.
    #[error("upstream failure: {0}")]
    Upstream(Arc<anyhow::Error>),
}

impl FlowError {
    /// Wraps an external collaborator's failure.
    pub fn upstream(cause: impl Into<anyhow::Error>) -> Self {
        Self::Upstream(Arc::new(cause.into()))
    }

    /// A `Transform` error carrying a caught panic's message, or `fallback`
    /// when the payload is not a string.
    pub(crate) fn from_panic(payload: &(dyn Any + Send), fallback: &str) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            fallback.to_string()
        };
        Self::Transform(message)
    }

    /// Returns the fieldless discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Transform(_) => ErrorKind::Transform,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::Upstream(_) => ErrorKind::Upstream,
        }
    }
}

/// The kind of a [`FlowError`], used by `Verifier::expect_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    Transform,
    Overflow,
    Upstream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Protocol => "ProtocolError",
            Self::Transform => "TransformError",
            Self::Overflow => "OverflowError",
            Self::Upstream => "UpstreamError",
        };
        f.write_str(name)
    }
}

/// A step-verifier failure.
///
/// Both variants carry the observed signal log, rendered with `Debug`, so a
/// failing test shows exactly what the stream did.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// A scripted expectation did not match what the stream produced.
    #[error("step {step} failed: expected {expected}, observed {observed:?}")]
    Assertion {
        step: usize,
        expected: String,
        observed: Vec<String>,
    },

    /// A real-time script waited longer than its bound.
    #[error("verification timed out after {after:?} waiting for {expected}; observed {observed:?}")]
    Timeout {
        after: Duration,
        expected: String,
        observed: Vec<String>,
    },
}

impl VerifyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
