use crate::sim::telemetry;
use delaycall::{DispatchEvent, ExecutionPath};
use std::collections::HashMap;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tokio::time::Instant;

/// Totals observed on the event stream over a whole run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventReport {
    pub direct: u64,
    pub delayed: u64,
    pub failures: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
    pub peak_workers: usize,
    /// Events dropped because this consumer fell behind.
    pub lagged: u64,
}

/// Consumes dispatch events until every sender is gone, feeding metrics and
/// returning the run totals.
pub async fn record_events(mut events: Receiver<DispatchEvent>) -> EventReport {
    let mut report = EventReport::default();
    let mut live: HashMap<(String, u64), Instant> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(skipped, "Event consumer lagged");
                report.lagged += skipped;
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            DispatchEvent::WorkerSpawned { key, generation } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key, generation, "Worker spawned");
                telemetry::worker_spawned();
                report.workers_spawned += 1;
                live.insert((key, generation), Instant::now());
                report.peak_workers = report.peak_workers.max(live.len());
            }
            DispatchEvent::Executed(receipt) => {
                let delayed = matches!(receipt.path, ExecutionPath::Delayed { .. });
                if delayed {
                    report.delayed += 1;
                } else {
                    report.direct += 1;
                }
                if let Err(_err) = &receipt.outcome {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        key = receipt.key,
                        sequence_id = receipt.sequence_id,
                        "Service call failed: {}",
                        _err.reason
                    );
                    report.failures += 1;
                }
                telemetry::record_execution(delayed, receipt.outcome.is_ok());
            }
            DispatchEvent::WorkerRetired {
                key,
                generation,
                processed,
            } => {
                report.workers_retired += 1;
                // A lagged receiver may have missed the spawn.
                let lifetime_ms = live
                    .remove(&(key.clone(), generation))
                    .map_or(0.0, |spawned| spawned.elapsed().as_secs_f64() * 1_000.0);
                #[cfg(feature = "tracing")]
                tracing::debug!(key, generation, processed, lifetime_ms, "Worker retired");
                telemetry::worker_retired(lifetime_ms, processed);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use delaycall::{Receipt, SinkError};
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn tallies_events_until_closed() {
        let (tx, rx) = broadcast::channel(16);
        let handle = tokio::spawn(record_events(rx));

        let receipt = |sequence_id, path, outcome| {
            DispatchEvent::Executed(Receipt {
                key: "user1".to_owned(),
                sequence_id,
                path,
                outcome,
            })
        };

        tx.send(receipt(0, ExecutionPath::Direct, Ok(()))).unwrap();
        tx.send(DispatchEvent::WorkerSpawned {
            key: "user1".to_owned(),
            generation: 1,
        })
        .unwrap();
        tx.send(receipt(1, ExecutionPath::Delayed { generation: 1 }, Ok(())))
            .unwrap();
        tx.send(receipt(
            2,
            ExecutionPath::Delayed { generation: 1 },
            Err(SinkError::new("boom")),
        ))
        .unwrap();
        tx.send(DispatchEvent::WorkerRetired {
            key: "user1".to_owned(),
            generation: 1,
            processed: 2,
        })
        .unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(
            report,
            EventReport {
                direct: 1,
                delayed: 2,
                failures: 1,
                workers_spawned: 1,
                workers_retired: 1,
                peak_workers: 1,
                lagged: 0,
            }
        );
    }
}
