//! Bounded-concurrency task queue with shared exponential backoff.
//!
//! At most `concurrency` tasks run at once. A single global failure counter
//! `f` is the backoff exponent: every task body is preceded by a wait of
//! `min(300, 2^f)` seconds. Any success resets `f` to zero, immediately
//! rescuing the whole fleet from a slow backoff; any transient failure
//! increments it and re-enqueues the same item, with no per-item attempt
//! cap. The failure mode this defends against is service-wide (throttling,
//! outage), which is why the counter is shared rather than per-item.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Backoff ceiling in seconds.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one scheduled attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Counts against the shared backoff exponent; the item is re-enqueued
    /// and retried indefinitely.
    #[error("{0}")]
    Transient(#[source] BoxError),

    /// Aborts the whole run. Configuration, session, and local-I/O failures
    /// land here — no amount of retrying fixes them.
    #[error("{0}")]
    Fatal(#[source] BoxError),
}

/// Backoff delay for the current failure streak.
fn backoff_delay(failures: u32) -> Duration {
    let secs = if failures >= 63 {
        MAX_RETRY_DELAY_SECS
    } else {
        (1u64 << failures).min(MAX_RETRY_DELAY_SECS)
    };
    Duration::from_secs(secs)
}

/// Fixed-width scheduler. Workers pull from a shared queue; the queue
/// drains only when every item has succeeded.
pub struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run every item to success. Returns the first fatal error, if any;
    /// remaining queued items are abandoned in that case.
    pub async fn run<T, F>(&self, items: Vec<T>, task: F) -> Result<(), TaskError>
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(());
        }

        let workers = self.concurrency.min(items.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(items)));
        let failures = Arc::new(AtomicU32::new(0));
        let fatal: Arc<Mutex<Option<TaskError>>> = Arc::new(Mutex::new(None));
        let task = Arc::new(task);

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let failures = failures.clone();
            let fatal = fatal.clone();
            let task = task.clone();

            set.spawn(async move {
                loop {
                    if fatal.lock().is_some() {
                        break;
                    }
                    let Some(item) = queue.lock().pop_front() else {
                        break;
                    };

                    let delay = backoff_delay(failures.load(Ordering::SeqCst));
                    if delay.as_secs() >= MAX_RETRY_DELAY_SECS {
                        warn!(worker, "backoff at ceiling ({}s)", delay.as_secs());
                    }
                    tokio::time::sleep(delay).await;

                    match task(item.clone()).await {
                        Ok(()) => {
                            failures.store(0, Ordering::SeqCst);
                        }
                        Err(TaskError::Transient(err)) => {
                            let streak = failures.fetch_add(1, Ordering::SeqCst) + 1;
                            debug!(worker, streak, "task failed, re-enqueueing: {err}");
                            queue.lock().push_back(item);
                        }
                        Err(err @ TaskError::Fatal(_)) => {
                            let mut slot = fatal.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            break;
                        }
                    }
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| TaskError::Fatal(Box::new(e)))?;
        }

        let result = fatal.lock().take();
        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
