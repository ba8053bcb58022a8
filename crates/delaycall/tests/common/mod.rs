#![allow(dead_code)]

use core::time::Duration;
use delaycall::{DelayConfig, DispatchEvent, ExecutionSink, Request, SinkError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const KEY: &str = "user1";

pub const fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub fn config(window: Duration) -> DelayConfig {
    DelayConfig {
        window,
        ..DelayConfig::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub key: String,
    pub payload: String,
    pub sequence_id: u64,
    pub at: Instant,
}

/// Records every invocation, optionally sleeping to simulate service latency
/// and failing any request whose payload starts with `fail`.
pub struct RecordingSink {
    calls: Mutex<Vec<Call>>,
    latency: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            latency,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.payload).collect()
    }

    /// Offsets of each call from `start`, in milliseconds.
    pub fn offsets_ms(&self, start: Instant) -> Vec<u128> {
        self.calls()
            .into_iter()
            .map(|c| c.at.duration_since(start).as_millis())
            .collect()
    }
}

impl ExecutionSink for RecordingSink {
    async fn execute(&self, request: &Request) -> Result<(), SinkError> {
        self.calls.lock().push(Call {
            key: request.key().to_owned(),
            payload: request.payload().to_owned(),
            sequence_id: request.sequence_id(),
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if request.payload().starts_with("fail") {
            return Err(SinkError::new(format!("refused {}", request.payload())));
        }
        Ok(())
    }
}

pub fn drain(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<DispatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn spawned(events: &[DispatchEvent]) -> Vec<(String, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::WorkerSpawned { key, generation } => Some((key.clone(), *generation)),
            _ => None,
        })
        .collect()
}

pub fn retired(events: &[DispatchEvent]) -> Vec<(String, u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::WorkerRetired {
                key,
                generation,
                processed,
            } => Some((key.clone(), *generation, *processed)),
            _ => None,
        })
        .collect()
}
