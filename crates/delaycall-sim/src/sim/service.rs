use core::time::Duration;
use delaycall::{ExecutionSink, Request, SinkError};
use rand::Rng;
use tokio::time::sleep;

/// Stand-in for the downstream service: every call takes a random latency up
/// to `max_latency` and, when `failure_one_in` is non-zero, fails one call in
/// that many.
#[derive(Debug, Clone)]
pub struct SimulatedService {
    max_latency_ms: u64,
    failure_one_in: u32,
}

impl SimulatedService {
    pub fn new(max_latency: Duration, failure_one_in: u32) -> Self {
        Self {
            max_latency_ms: u64::try_from(max_latency.as_millis()).unwrap_or(u64::MAX),
            failure_one_in,
        }
    }
}

impl ExecutionSink for SimulatedService {
    async fn execute(&self, request: &Request) -> Result<(), SinkError> {
        let (latency, fail) = {
            let mut rng = rand::rng();
            let latency = rng.random_range(0..=self.max_latency_ms);
            let fail = self.failure_one_in > 0 && rng.random_ratio(1, self.failure_one_in);
            (latency, fail)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            key = request.key(),
            sequence_id = request.sequence_id(),
            latency_ms = latency,
            "{}",
            request.payload()
        );

        sleep(Duration::from_millis(latency)).await;

        if fail {
            return Err(SinkError::new(format!(
                "service refused {} for {}",
                request.payload(),
                request.key()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn always_fails_when_configured_one_in_one() {
        let service = SimulatedService::new(Duration::from_millis(5), 1);
        let err = service
            .execute(&Request::new("user1", "task000", 0))
            .await
            .unwrap_err();
        assert!(err.reason.contains("task000"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_fails_when_failures_disabled() {
        let service = SimulatedService::new(Duration::from_millis(5), 0);
        for i in 0..20 {
            service
                .execute(&Request::new("user1", "task", i))
                .await
                .unwrap();
        }
    }
}
