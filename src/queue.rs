//! Per-provider dedup queue collapsing concurrent identical operations.
//!
//! [`DedupQueue::wrap`] runs at most one operation per key at a time. Callers
//! that arrive while an operation for their key is in flight attach to it and
//! receive a clone of its result, in arrival order. Operations for different
//! keys run concurrently up to the queue's concurrency bound; permits are
//! granted first-come first-served.
//!
//! The in-flight map is process-local and forgotten on restart.
//!
//! # Example
//!
//! ```
//! use debrid_core::queue::DedupQueue;
//!
//! # async fn example() -> Result<(), debrid_core::queue::QueueError> {
//! let queue: DedupQueue<u32> = DedupQueue::new("example", 50);
//! let value = queue.wrap("key", async { 42 }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, trace, warn};

/// Default number of operations a queue runs at once.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 50;

/// Dedup queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The in-flight operation ended without producing a result (it panicked
    /// or its task was cancelled).
    #[error("in-flight operation was abandoned before producing a result")]
    Abandoned,
}

type Waiters<T> = Vec<oneshot::Sender<T>>;

/// FIFO dedup queue with bounded concurrency.
pub struct DedupQueue<T> {
    name: String,
    in_flight: Arc<DashMap<String, Waiters<T>>>,
    permits: Arc<Semaphore>,
}

impl<T> fmt::Debug for DedupQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupQueue")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl<T> DedupQueue<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a queue running at most `concurrency` operations at once (minimum 1).
    #[must_use]
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            in_flight: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Number of distinct keys currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Runs `operation` for `key`, or attaches to the one already in flight.
    ///
    /// The operation runs on its own task, so dropping the returned future
    /// does not cancel it for other waiters.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Abandoned`] when the operation panics.
    pub async fn wrap<F>(&self, key: impl Into<String>, operation: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let (sender, receiver) = oneshot::channel();

        let leader = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(sender);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![sender]);
                true
            }
        };

        if leader {
            self.spawn_operation(key, operation);
        } else {
            trace!(queue = %self.name, "attached to in-flight operation");
        }

        receiver.await.map_err(|_| {
            warn!(queue = %self.name, "in-flight operation abandoned");
            QueueError::Abandoned
        })
    }

    fn spawn_operation<F>(&self, key: String, operation: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let permits = Arc::clone(&self.permits);
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut guard = InFlightGuard {
                in_flight: Arc::clone(&in_flight),
                key: key.clone(),
                armed: true,
            };

            // The semaphore is never closed, so acquisition only fails if it is.
            let _permit = permits.acquire_owned().await.ok();
            let result = operation.await;

            guard.armed = false;
            let waiters = in_flight
                .remove(&key)
                .map(|(_, waiters)| waiters)
                .unwrap_or_default();
            debug!(queue = %name, waiters = waiters.len(), "broadcasting result");
            for waiter in waiters {
                // A waiter that gave up has dropped its receiver.
                let _ = waiter.send(result.clone());
            }
        });
    }
}

/// Clears the key if the operation task unwinds, so waiters are released.
struct InFlightGuard<T> {
    in_flight: Arc<DashMap<String, Waiters<T>>>,
    key: String,
    armed: bool,
}

impl<T> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.remove(&self.key);
        }
    }
}
