//! Verification-only execution order checking.
//!
//! [`OrderingMonitor`] consumes the sequence id of every sink invocation and
//! reports the first out-of-order one. [`MonitoredSink`] wires a monitor in
//! front of any [`ExecutionSink`] so that every path (direct and delayed) is
//! observed at the moment the call starts.

use crate::{ExecutionSink, Request, SinkError};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Which ordering invariant the monitor enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingScope {
    /// Sequence ids across all keys must be `0, 1, 2, ...` with no gaps.
    /// Only meaningful when every request shares one key.
    Global,
    /// Within each key, sequence ids must strictly increase. Gaps are allowed
    /// because ids are assigned across all keys.
    #[default]
    PerKey,
}

/// An execution that broke the monitor's ordering invariant.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("Out-of-order execution for key `{key}`: sequence {observed} after {previous:?}")]
pub struct OrderViolation {
    pub key: String,
    /// Last sequence id accepted in scope, if any.
    pub previous: Option<u64>,
    pub observed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderingMonitor {
    scope: OrderingScope,
    last_global: Option<u64>,
    last_per_key: HashMap<String, u64>,
    observed: u64,
}

impl OrderingMonitor {
    pub fn new(scope: OrderingScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub const fn scope(&self) -> OrderingScope {
        self.scope
    }

    /// Number of invocations accepted so far.
    pub const fn observed(&self) -> u64 {
        self.observed
    }

    /// Records one invocation.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderViolation`] if `sequence_id` breaks the scope's
    /// invariant. The offending id is not recorded.
    pub fn observe(&mut self, key: &str, sequence_id: u64) -> Result<(), OrderViolation> {
        match self.scope {
            OrderingScope::Global => {
                let expected = self.last_global.map_or(0, |last| last + 1);
                if sequence_id != expected {
                    return Err(OrderViolation {
                        key: key.to_owned(),
                        previous: self.last_global,
                        observed: sequence_id,
                    });
                }
                self.last_global = Some(sequence_id);
            }
            OrderingScope::PerKey => {
                let previous = self.last_per_key.get(key).copied();
                if previous.is_some_and(|last| sequence_id <= last) {
                    return Err(OrderViolation {
                        key: key.to_owned(),
                        previous,
                        observed: sequence_id,
                    });
                }
                self.last_per_key.insert(key.to_owned(), sequence_id);
            }
        }

        self.observed += 1;
        Ok(())
    }
}

/// An [`ExecutionSink`] decorator that checks ordering before delegating.
///
/// On a violation the call is refused with a [`SinkError`] and the violation
/// is kept; [`verify`](Self::verify) reports the first one.
pub struct MonitoredSink<S> {
    inner: S,
    monitor: Mutex<OrderingMonitor>,
    violation: Mutex<Option<OrderViolation>>,
}

impl<S> MonitoredSink<S> {
    pub fn new(inner: S, scope: OrderingScope) -> Self {
        Self {
            inner,
            monitor: Mutex::new(OrderingMonitor::new(scope)),
            violation: Mutex::new(None),
        }
    }

    pub const fn inner(&self) -> &S {
        &self.inner
    }

    pub fn observed(&self) -> u64 {
        self.monitor.lock().observed()
    }

    /// # Errors
    ///
    /// Returns the first [`OrderViolation`] observed, if any.
    pub fn verify(&self) -> Result<(), OrderViolation> {
        match self.violation.lock().clone() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    fn check(&self, request: &Request) -> Result<(), OrderViolation> {
        let result = self
            .monitor
            .lock()
            .observe(request.key(), request.sequence_id());

        if let Err(violation) = &result {
            #[cfg(feature = "tracing")]
            tracing::error!("{violation}");
            self.violation.lock().get_or_insert_with(|| violation.clone());
        }
        result
    }
}

impl<S: ExecutionSink> ExecutionSink for MonitoredSink<S> {
    async fn execute(&self, request: &Request) -> Result<(), SinkError> {
        self.check(request)?;
        self.inner.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_scope_requires_contiguous_ids_from_zero() {
        let mut monitor = OrderingMonitor::new(OrderingScope::Global);
        for id in 0..5 {
            monitor.observe("user1", id).unwrap();
        }
        assert_eq!(monitor.observed(), 5);

        let violation = monitor.observe("user1", 6).unwrap_err();
        assert_eq!(violation.previous, Some(4));
        assert_eq!(violation.observed, 6);
    }

    #[test]
    fn global_scope_rejects_nonzero_start() {
        let mut monitor = OrderingMonitor::new(OrderingScope::Global);
        let violation = monitor.observe("user1", 1).unwrap_err();
        assert_eq!(violation.previous, None);
    }

    #[test]
    fn per_key_scope_allows_gaps_but_not_regressions() {
        let mut monitor = OrderingMonitor::new(OrderingScope::PerKey);
        monitor.observe("a", 0).unwrap();
        monitor.observe("b", 1).unwrap();
        monitor.observe("a", 2).unwrap();
        monitor.observe("b", 7).unwrap();

        assert!(monitor.observe("a", 2).is_err());
        assert!(monitor.observe("b", 3).is_err());
        assert_eq!(monitor.observed(), 4);
    }

    #[test]
    fn violation_message_names_key() {
        let violation = OrderViolation {
            key: "user1".to_string(),
            previous: Some(3),
            observed: 2,
        };
        assert_eq!(
            violation.to_string(),
            "Out-of-order execution for key `user1`: sequence 2 after Some(3)"
        );
    }
}
