//! Coalescing of concurrent computations for the same key.
//!
//! The first caller for a key spawns the computation; later callers join the
//! same shared future and receive a clone of its output, success or failure.
//! The spawned task runs to completion even if every caller goes away, and it
//! removes its own entry once it settles, so the next caller after that
//! starts afresh.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "optimizer::inflight";

pub(crate) type SharedComputation<T> = Shared<BoxFuture<'static, T>>;

type Registry<T> = Arc<Mutex<HashMap<String, SharedComputation<T>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

pub(crate) struct InFlight<T: Clone> {
    pending: Registry<T>,
    /// Output handed to waiters when the spawned task panics or is aborted.
    lost: fn(JoinError) -> T,
}

/// Removes the entry when the spawned task ends, panics included.
struct Settle<T: Clone> {
    registry: Registry<T>,
    key: String,
}

impl<T: Clone> Drop for Settle<T> {
    fn drop(&mut self) {
        mutex_lock(&self.registry, SOURCE, "settle").remove(&self.key);
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(lost: fn(JoinError) -> T) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            lost,
        }
    }

    /// Join the computation running for `key`, or spawn one with `start`.
    /// `start` is only called when nothing is in flight.
    pub fn join_or_start<F, Fut>(&self, key: &str, start: F) -> (SharedComputation<T>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        // Held until the entry is inserted, so the task cannot settle first.
        let mut pending = mutex_lock(&self.pending, SOURCE, "join_or_start");
        if let Some(running) = pending.get(key) {
            return (running.clone(), Role::Follower);
        }

        let settle = Settle {
            registry: Arc::clone(&self.pending),
            key: key.to_string(),
        };
        let work = start();
        let task = tokio::spawn(async move {
            let _settle = settle;
            work.await
        });
        let lost = self.lost;
        let computation = async move { task.await.unwrap_or_else(lost) }
            .boxed()
            .shared();

        pending.insert(key.to_string(), computation.clone());
        (computation, Role::Leader)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
