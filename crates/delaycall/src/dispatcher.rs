//! The dispatcher routes an ordered stream of keyed requests.
//!
//! For each request it consults the [`RoutingTable`]:
//!
//! - If the key has an active worker, the request is forwarded to that
//!   worker's bounded queue.
//! - If the request is delay-flagged, a routing entry is installed and a
//!   [worker](crate::worker) is spawned on a [`TaskTracker`] with the request
//!   as its seed.
//! - Otherwise the dispatcher awaits the [`ExecutionSink`] itself, which is
//!   what serializes non-delayed traffic.
//!
//! The routing lock is released before any `.await`. A forward that races with
//! a worker closing its queue gets its request back and routes again, and a
//! key whose worker is closing is not touched until the worker has retired.

use crate::{
    DelayConfig, DispatchEvent, Error, ExecutionPath, ExecutionSink, OverflowPolicy, Receipt,
    Request, Result, SinkError,
    event::EventBus,
    routing::{Route, RouteStatus, RoutingTable},
    worker::worker_loop,
};
use core::panic::AssertUnwindSafe;
use futures::{FutureExt, Stream, StreamExt};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{
        broadcast,
        mpsc::{
            self,
            error::{SendError, TrySendError},
        },
    },
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// How the dispatcher disposed of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Executed on the dispatcher; carries the sink's outcome.
    Direct(Result<(), SinkError>),
    /// Started a new worker for the key with this request as its seed.
    Spawned { generation: u64 },
    /// Queued on the key's existing worker.
    Forwarded { generation: u64 },
}

/// Whether a key is currently owned by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// No worker; non-delayed requests execute directly.
    Direct,
    /// A worker owns the key and accepts requests.
    Delaying,
    /// The worker has closed its queue and is about to retire.
    Closing,
}

/// Counters accumulated over one [`Dispatcher::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub accepted: u64,
    pub direct: u64,
    pub spawned: u64,
    pub forwarded: u64,
    /// Requests refused by validation or a full queue.
    pub rejected: u64,
    /// Direct executions whose sink call failed.
    pub failed: u64,
}

/// Snapshot of the dispatcher's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub accepted: u64,
    pub direct: u64,
    pub spawned: u64,
    pub forwarded: u64,
    pub rejected: u64,
    /// Failed sink calls on any path.
    pub sink_failures: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    direct: AtomicU64,
    spawned: AtomicU64,
    forwarded: AtomicU64,
    rejected: AtomicU64,
    sink_failures: AtomicU64,
}

/// State shared between the dispatcher and every worker.
pub(crate) struct Shared<S> {
    pub(crate) sink: S,
    pub(crate) routes: RoutingTable,
    pub(crate) events: EventBus,
    pub(crate) config: DelayConfig,
    counters: Counters,
}

impl<S: ExecutionSink> Shared<S> {
    /// Calls the sink and publishes the receipt. Failures are logged and
    /// returned, never propagated as dispatcher errors. A panicking sink call
    /// is reported as a failure of that request.
    pub(crate) async fn invoke(
        &self,
        request: &Request,
        path: ExecutionPath,
    ) -> core::result::Result<(), SinkError> {
        let outcome = AssertUnwindSafe(async { self.sink.execute(request).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SinkError::from_panic(panic.as_ref())));

        if let Err(_e) = &outcome {
            self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Sink failed for key {} request {}: {_e}",
                request.key(),
                request.sequence_id()
            );
        }

        self.events.publish(DispatchEvent::Executed(Receipt {
            key: request.key().to_owned(),
            sequence_id: request.sequence_id(),
            path,
            outcome: outcome.clone(),
        }));

        outcome
    }
}

enum ForwardError {
    /// The worker closed its queue; the request was handed back.
    Retired(Request),
    /// The queue had no free slot; the request was handed back.
    Full(Request),
}

/// Routes requests to direct execution or to per-key delay workers.
///
/// Cloning is cheap and every clone shares the same routing table, workers
/// and sink.
pub struct Dispatcher<S> {
    shared: Arc<Shared<S>>,
    workers: TaskTracker,
    shutdown_token: CancellationToken,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            workers: self.workers.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<S: ExecutionSink> Dispatcher<S> {
    /// Creates a dispatcher that invokes `sink` once per accepted request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn new(config: DelayConfig, sink: S) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let routes = RoutingTable::new(config.queue_capacity, events.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                sink,
                routes,
                events,
                config,
                counters: Counters::default(),
            }),
            workers: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DelayConfig {
        &self.shared.config
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    /// Subscribes to [`DispatchEvent`]s published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }

    /// Number of keys currently owned by a worker.
    pub fn active_workers(&self) -> usize {
        self.shared.routes.len()
    }

    pub fn is_delaying(&self, key: &str) -> bool {
        self.key_status(key) != KeyStatus::Direct
    }

    pub fn key_status(&self, key: &str) -> KeyStatus {
        match self.shared.routes.status(key) {
            None => KeyStatus::Direct,
            Some(RouteStatus::Active) => KeyStatus::Delaying,
            Some(RouteStatus::Closing) => KeyStatus::Closing,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            direct: c.direct.load(Ordering::Relaxed),
            spawned: c.spawned.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
        }
    }

    /// Routes a single request.
    ///
    /// Returns once the request is accepted: executed (direct path), handed to
    /// a new worker, or queued on the key's existing worker. Forwarding waits
    /// for queue space under [`OverflowPolicy::Block`].
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) began.
    /// - [`Error::InvalidRequest`] if the request fails validation.
    /// - [`Error::QueueFull`] under [`OverflowPolicy::Reject`] when the key's
    ///   queue has no free slot. The request is not accepted.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(key = request.key(), seq = request.sequence_id())))]
    pub async fn handle(&self, request: Request) -> Result<Dispatched> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        if let Err(e) = request.validate(self.shared.config.max_key_len) {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let counters = &self.shared.counters;
        let mut request = request;

        loop {
            match self.shared.routes.route(request) {
                Route::Direct(pending) => {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                    counters.direct.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.shared.invoke(&pending, ExecutionPath::Direct).await;
                    return Ok(Dispatched::Direct(outcome));
                }
                Route::Spawn(seed) => {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                    counters.spawned.fetch_add(1, Ordering::Relaxed);
                    let generation = seed.generation;

                    #[cfg(feature = "tracing")]
                    tracing::debug!("Spawning worker generation {generation}");

                    self.workers
                        .spawn(worker_loop(seed, Arc::clone(&self.shared)));
                    return Ok(Dispatched::Spawned { generation });
                }
                Route::Forward {
                    queue,
                    generation,
                    request: pending,
                } => match self.forward(queue, pending).await {
                    Ok(()) => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                        counters.forwarded.fetch_add(1, Ordering::Relaxed);
                        return Ok(Dispatched::Forwarded { generation });
                    }
                    Err(ForwardError::Retired(returned)) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!("Worker generation {generation} retired during forward");
                        request = returned;
                    }
                    Err(ForwardError::Full(refused)) => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::QueueFull {
                            key: refused.key().to_owned(),
                            capacity: self.shared.config.queue_capacity,
                        });
                    }
                },
                Route::AwaitRetirement {
                    retired,
                    request: pending,
                } => {
                    retired.cancelled().await;
                    request = pending;
                }
            }
        }
    }

    async fn forward(
        &self,
        queue: mpsc::Sender<Request>,
        request: Request,
    ) -> core::result::Result<(), ForwardError> {
        match self.shared.config.overflow {
            OverflowPolicy::Block => queue
                .send(request)
                .await
                .map_err(|SendError(request)| ForwardError::Retired(request)),
            OverflowPolicy::Reject => queue.try_send(request).map_err(|e| match e {
                TrySendError::Full(request) => ForwardError::Full(request),
                TrySendError::Closed(request) => ForwardError::Retired(request),
            }),
        }
    }

    /// Dispatches every request from `requests` in order until the stream
    /// ends.
    ///
    /// Rejected requests are counted and logged without stopping the run.
    /// Workers still active when the stream ends keep running and retire on
    /// their own idle timers; call [`shutdown`](Self::shutdown) to wait for
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if shutdown begins mid-stream.
    pub async fn run<St>(&self, requests: St) -> Result<RunSummary>
    where
        St: Stream<Item = Request>,
    {
        tokio::pin!(requests);
        let mut summary = RunSummary::default();

        while let Some(request) = requests.next().await {
            match self.handle(request).await {
                Ok(dispatched) => {
                    summary.accepted += 1;
                    match dispatched {
                        Dispatched::Direct(outcome) => {
                            summary.direct += 1;
                            if outcome.is_err() {
                                summary.failed += 1;
                            }
                        }
                        Dispatched::Spawned { .. } => summary.spawned += 1,
                        Dispatched::Forwarded { .. } => summary.forwarded += 1,
                    }
                }
                Err(Error::InvalidRequest { .. } | Error::QueueFull { .. }) => {
                    summary.rejected += 1;
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Request rejected; continuing");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Stops accepting requests and waits for active workers to retire.
    ///
    /// Accepted requests are never cancelled: each worker finishes its queue
    /// and expires after one idle window, as it would without a shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutdownTimeout`] if workers are still active after
    /// [`DelayConfig::shutdown_timeout`].
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.shutdown_token.cancel();
        self.workers.close();

        // === Phase 1: Wait for workers to expire ===
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Waiting for {} active worker(s) to expire",
            self.workers.len()
        );
        match timeout(self.shared.config.shutdown_timeout, self.workers.wait()).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Dispatcher shutdown complete");
                Ok(())
            }
            Err(_) => {
                let active = self.workers.len();
                #[cfg(feature = "tracing")]
                tracing::warn!("Shutdown timed out ({active} worker(s) still active)");
                Err(Error::ShutdownTimeout { active })
            }
        }
    }
}
