use crate::{
    ExecutionPath, ExecutionSink, Request,
    dispatcher::Shared,
    routing::{Expiry, WorkerSeed},
};
use std::sync::Arc;
use tokio::time::{Instant, sleep};

/// Lifecycle of a key delay worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Executing the request that caused the worker to spawn.
    Draining,
    /// Idle timer armed; waiting for the next request or expiry.
    Waiting,
    /// Queue closed; executing whatever was buffered before the close.
    Closing,
    /// Routing entry removed; the task is exiting.
    Terminated,
}

/// Owns a key for as long as traffic keeps arriving within the idle window.
///
/// The worker executes its seed request, then alternates between executing
/// queued requests and waiting on an idle timer. A delay-flagged follow-up
/// request costs one extra window of sleep after it executes. When the timer
/// fires, the worker asks the routing table to close its queue; if a request
/// raced in, the timer is re-armed instead.
///
/// After the queue is closed the worker executes anything still buffered,
/// removes its routing entry and exits. Requests for the key therefore always
/// execute in arrival order, on this task, until the entry is gone.
pub(crate) async fn worker_loop<S: ExecutionSink>(seed: WorkerSeed, shared: Arc<Shared<S>>) {
    let WorkerSeed {
        key,
        generation,
        mut queue,
        request,
    } = seed;
    let window = shared.config.window;
    let path = ExecutionPath::Delayed { generation };
    let mut seed = Some(request);
    let mut processed: u64 = 0;
    let mut state = WorkerState::Draining;

    let idle = sleep(window);
    tokio::pin!(idle);

    #[cfg(feature = "tracing")]
    tracing::debug!("Worker for key {key} (generation {generation}) started");

    while state != WorkerState::Terminated {
        let next = match state {
            WorkerState::Draining => {
                if let Some(request) = seed.take() {
                    let _ = shared.invoke(&request, path).await;
                    processed += 1;
                }
                idle.as_mut().reset(Instant::now() + window);
                WorkerState::Waiting
            }
            WorkerState::Waiting => tokio::select! {
                biased;

                next = queue.recv() => match next {
                    Some(request) => {
                        process(&shared, &request, path, window).await;
                        processed += 1;
                        idle.as_mut().reset(Instant::now() + window);
                        WorkerState::Waiting
                    }
                    // The routing entry holds a sender until `try_close`, so
                    // this only happens once the queue was closed.
                    None => WorkerState::Closing,
                },
                () = &mut idle => match shared.routes.try_close(&key, generation, &mut queue) {
                    Expiry::Extend => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Worker for key {key} extending: request raced expiry");
                        idle.as_mut().reset(Instant::now() + window);
                        WorkerState::Waiting
                    }
                    Expiry::Closing => WorkerState::Closing,
                },
            },
            WorkerState::Closing => {
                // Requests whose send completed before the close are still
                // buffered.
                while let Some(request) = queue.recv().await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        "Worker for key {key} draining request {} after close",
                        request.sequence_id()
                    );
                    process(&shared, &request, path, window).await;
                    processed += 1;
                }
                shared.routes.retire(&key, generation, processed);
                WorkerState::Terminated
            }
            WorkerState::Terminated => WorkerState::Terminated,
        };

        #[cfg(feature = "tracing")]
        {
            if next != state {
                tracing::trace!("Worker for key {key}: {state:?} -> {next:?}");
            }
        }
        state = next;
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("Worker for key {key} (generation {generation}) retired after {processed} request(s)");
}

/// Executes one queued request, throttling afterwards if it is delay-flagged.
async fn process<S: ExecutionSink>(
    shared: &Shared<S>,
    request: &Request,
    path: ExecutionPath,
    window: core::time::Duration,
) {
    let _ = shared.invoke(request, path).await;
    if request.is_delayed() {
        sleep(window).await;
    }
}
