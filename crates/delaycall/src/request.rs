use crate::{Error, Result};

/// A keyed unit of work flowing through the dispatcher.
///
/// Requests are immutable once built. The `delay` flag switches the key into
/// conflation mode when no worker currently owns it; once a worker is active,
/// every request for the key is routed to that worker regardless of its flag.
///
/// `sequence_id` is assigned by the producer and is expected to increase
/// monotonically in arrival order. The dispatcher never interprets it, but the
/// [`OrderingMonitor`](crate::OrderingMonitor) does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Request {
    key: String,
    payload: String,
    #[cfg_attr(feature = "serde", serde(default))]
    delay: bool,
    sequence_id: u64,
}

impl Request {
    /// Builds a request that executes directly unless its key is already in
    /// delay mode.
    pub fn new(key: impl Into<String>, payload: impl Into<String>, sequence_id: u64) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            delay: false,
            sequence_id,
        }
    }

    /// Builds a delay-flagged request.
    pub fn delayed(key: impl Into<String>, payload: impl Into<String>, sequence_id: u64) -> Self {
        Self::new(key, payload, sequence_id).with_delay(true)
    }

    #[must_use]
    pub fn with_delay(mut self, delay: bool) -> Self {
        self.delay = delay;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub const fn is_delayed(&self) -> bool {
        self.delay
    }

    pub const fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Checks that the request can be routed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the key is empty or longer than
    /// `max_key_len` bytes.
    pub fn validate(&self, max_key_len: usize) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidRequest {
                reason: format!("Request {} has an empty key", self.sequence_id),
            });
        }

        if self.key.len() > max_key_len {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Request {} key length {} exceeds maximum allowed ({})",
                    self.sequence_id,
                    self.key.len(),
                    max_key_len
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_sets_flag() {
        let req = Request::delayed("user1", "task000", 0);
        assert!(req.is_delayed());
        assert_eq!(req.key(), "user1");
        assert_eq!(req.payload(), "task000");
        assert_eq!(req.sequence_id(), 0);

        assert!(!Request::new("user1", "task001", 1).is_delayed());
    }

    #[test]
    fn rejects_empty_key() {
        let err = Request::new("", "a", 7).validate(16).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn rejects_oversized_key() {
        let req = Request::new("k".repeat(17), "a", 0);
        assert!(req.validate(16).is_err());
        assert!(req.validate(17).is_ok());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn delay_defaults_to_false_when_absent() {
        let req: Request =
            serde_json::from_str(r#"{"key":"user1","payload":"a","sequence_id":3}"#).unwrap();
        assert_eq!(req, Request::new("user1", "a", 3));
    }
}
