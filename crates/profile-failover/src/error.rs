//! Failover error types
//!
//! `FailoverError` is the classified error an `execute` callable raises
//! when an upstream call fails; the retry driver inspects it through the
//! `Failover` seam to decide between waiting and propagating.

use std::collections::HashMap;

use profile_store::FailureReason;

/// A provider call failure carrying its classification and any
/// retry-after hints the transport exposed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason} failure: {message}")]
pub struct FailoverError {
    pub reason: FailureReason,
    pub message: String,
    /// Response headers, when available. Lookup is case-insensitive.
    pub headers: Option<HashMap<String, String>>,
    /// Direct retry-after hint in seconds, when the provider error
    /// carried one outside the headers.
    pub retry_after_secs: Option<f64>,
}

impl FailoverError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            headers: None,
            retry_after_secs: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_retry_after_secs(mut self, secs: f64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Case-insensitive header lookup; returns the first matching value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Seam by which the retry driver inspects caller error types without
/// knowing their shape.
pub trait Failover {
    /// The classified failover error inside this error, if any.
    fn failover(&self) -> Option<&FailoverError>;
}

impl Failover for FailoverError {
    fn failover(&self) -> Option<&FailoverError> {
        Some(self)
    }
}

/// Terminal outcomes of the retry driver.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Cancellation observed at the top of the loop.
    #[error("task aborted")]
    Aborted,

    /// Cancellation fired while sleeping out a cooldown.
    #[error("aborted during cooldown wait")]
    AbortedDuringCooldown,

    /// The underlying call failed in a way the driver does not retry;
    /// the error is propagated untouched.
    #[error(transparent)]
    Execute(E),
}
