//! Error types for the delay dispatcher.
//!
//! ## Error Cases
//! - `InvalidRequest`: The request failed validation and was never routed.
//! - `InvalidConfig`: A [`DelayConfig`](crate::DelayConfig) value is out of
//!   range.
//! - `QueueFull`: The key's worker queue is full and the overflow policy is
//!   [`OverflowPolicy::Reject`](crate::OverflowPolicy::Reject).
//! - `ServiceShutdown`: A request arrived after shutdown began.
//! - `ShutdownTimeout`: Workers were still active when the shutdown deadline
//!   passed.
//! - `OrderViolation`: The ordering monitor observed an out-of-order
//!   execution.

use crate::monitor::OrderViolation;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the dispatcher.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The configuration was rejected by [`DelayConfig::validate`].
    ///
    /// [`DelayConfig::validate`]: crate::DelayConfig::validate
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The per-key queue had no free slot.
    #[error("Queue for key `{key}` is full (capacity {capacity})")]
    QueueFull { key: String, capacity: usize },

    /// The dispatcher no longer accepts requests.
    #[error("Dispatcher is shutting down")]
    ServiceShutdown,

    /// Shutdown gave up waiting on workers that had not yet expired.
    #[error("Shutdown timed out with {active} worker(s) still active")]
    ShutdownTimeout { active: usize },

    #[error(transparent)]
    OrderViolation(#[from] OrderViolation),
}

/// Failure reported by an [`ExecutionSink`](crate::ExecutionSink) for a
/// single request.
///
/// Sink failures never stop the dispatcher or a worker. They are attached to
/// the request's [`Receipt`](crate::Receipt) instead.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("Sink error: {reason}")]
pub struct SinkError {
    pub reason: String,
}

impl SinkError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Builds an error from the payload of a sink call that panicked.
    pub(crate) fn from_panic(payload: &(dyn core::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::new(format!("sink panicked: {message}"))
    }
}

impl From<OrderViolation> for SinkError {
    fn from(violation: OrderViolation) -> Self {
        Self::new(violation.to_string())
    }
}
