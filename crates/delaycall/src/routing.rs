//! Shared key → worker routing.
//!
//! The [`RoutingTable`] is the only mutable state shared between the
//! dispatcher and the delay workers, and the sole source of truth for whether
//! a key is in delay mode. All access goes through one [`Mutex`], which is
//! never held across an `.await`.
//!
//! Each entry moves through `Active → Closing → (removed)`:
//!
//! - `Active`: the worker is accepting requests through its queue.
//! - `Closing`: the worker found its queue empty on idle expiry and closed it.
//!   It is executing anything that slipped into the buffer before the close.
//!   The dispatcher must wait for removal before routing the key again.
//! - removed: the worker has exited. The next delay-flagged request for the
//!   key installs a fresh entry with a new generation.

use crate::{DispatchEvent, Request, event::EventBus};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteStatus {
    Active,
    Closing,
}

struct RoutingEntry {
    generation: u64,
    status: RouteStatus,
    queue: mpsc::Sender<Request>,
    /// Cancelled once the entry is removed.
    retired: CancellationToken,
}

/// Everything a freshly spawned worker needs to take ownership of a key.
pub(crate) struct WorkerSeed {
    pub(crate) key: String,
    pub(crate) generation: u64,
    pub(crate) queue: mpsc::Receiver<Request>,
    pub(crate) request: Request,
}

/// Routing decision for a single request.
pub(crate) enum Route {
    /// The key has an active worker; send the request to its queue.
    Forward {
        queue: mpsc::Sender<Request>,
        generation: u64,
        request: Request,
    },
    /// The key's worker is closing; wait for `retired` and route again.
    AwaitRetirement {
        retired: CancellationToken,
        request: Request,
    },
    /// A new entry was installed; spawn a worker with this seed.
    Spawn(WorkerSeed),
    /// No worker owns the key and the request is not delay-flagged.
    Direct(Request),
}

/// Result of a worker's idle-expiry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    /// A request raced in before the lock was taken; keep the entry alive.
    Extend,
    /// The queue is closed and the entry is `Closing`.
    Closing,
}

pub(crate) struct RoutingTable {
    entries: Mutex<HashMap<String, RoutingEntry>>,
    next_generation: AtomicU64,
    queue_capacity: usize,
    events: EventBus,
}

impl RoutingTable {
    pub(crate) fn new(queue_capacity: usize, events: EventBus) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            queue_capacity,
            events,
        }
    }

    /// Decides where `request` goes, installing a new entry when a
    /// delay-flagged request finds its key unowned.
    pub(crate) fn route(&self, request: Request) -> Route {
        let mut entries = self.entries.lock();

        // An active entry with a closed queue lost its worker without a
        // retirement. Only `try_close` closes a live worker's queue, and it
        // marks the entry `Closing` first.
        let abandoned = entries.get(request.key()).is_some_and(|entry| {
            entry.status == RouteStatus::Active && entry.queue.is_closed()
        });
        if abandoned {
            if let Some(entry) = entries.remove(request.key()) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Evicting abandoned worker for key {} (generation {})",
                    request.key(),
                    entry.generation
                );
                entry.retired.cancel();
                self.events.publish(DispatchEvent::WorkerRetired {
                    key: request.key().to_owned(),
                    generation: entry.generation,
                    processed: 0,
                });
            }
        }

        if let Some(entry) = entries.get(request.key()) {
            return match entry.status {
                RouteStatus::Active => Route::Forward {
                    queue: entry.queue.clone(),
                    generation: entry.generation,
                    request,
                },
                RouteStatus::Closing => Route::AwaitRetirement {
                    retired: entry.retired.clone(),
                    request,
                },
            };
        }

        if !request.is_delayed() {
            return Route::Direct(request);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let key = request.key().to_owned();

        entries.insert(
            key.clone(),
            RoutingEntry {
                generation,
                status: RouteStatus::Active,
                queue: tx,
                retired: CancellationToken::new(),
            },
        );
        self.events.publish(DispatchEvent::WorkerSpawned {
            key: key.clone(),
            generation,
        });

        Route::Spawn(WorkerSeed {
            key,
            generation,
            queue: rx,
            request,
        })
    }

    /// Called by a worker whose idle timer fired.
    ///
    /// Under the lock, re-checks the worker's queue. A non-empty queue keeps
    /// the entry `Active`. An empty one is closed and the entry becomes
    /// `Closing`, after which no new request can enter the queue.
    pub(crate) fn try_close(
        &self,
        key: &str,
        generation: u64,
        queue: &mut mpsc::Receiver<Request>,
    ) -> Expiry {
        let mut entries = self.entries.lock();

        if !queue.is_empty() {
            return Expiry::Extend;
        }

        if let Some(entry) = entries.get_mut(key) {
            if entry.generation == generation {
                entry.status = RouteStatus::Closing;
            }
        }
        queue.close();

        Expiry::Closing
    }

    /// Removes the entry for `key` if it still belongs to `generation`.
    ///
    /// Wakes every dispatcher waiting on the entry's retirement and publishes
    /// `WorkerRetired` before releasing the lock.
    pub(crate) fn retire(&self, key: &str, generation: u64, processed: u64) -> bool {
        let mut entries = self.entries.lock();

        let owned = entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation);
        if !owned {
            return false;
        }

        if let Some(entry) = entries.remove(key) {
            entry.retired.cancel();
        }
        self.events.publish(DispatchEvent::WorkerRetired {
            key: key.to_owned(),
            generation,
            processed,
        });

        true
    }

    pub(crate) fn status(&self, key: &str) -> Option<RouteStatus> {
        self.entries.lock().get(key).map(|entry| entry.status)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
