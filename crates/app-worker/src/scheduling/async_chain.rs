//! Ordered execution of async tasks.
//!
//! An [`AsyncChain`] runs the tasks appended to it one after another, in
//! submission order. Each task starts only after the previous one settled,
//! whether it returned or panicked. The chain keeps a backpressure counter of
//! submitted-but-not-settled tasks that admission control reads.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Reasons a chained task produced no value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Chained task panicked")]
    TaskPanicked,

    #[error("Chain runner is gone")]
    Closed,
}

/// FIFO executor with a backpressure counter.
///
/// Must be created inside a tokio runtime; the runner task lives until the
/// chain is dropped and every queued task settled.
#[derive(Debug)]
pub struct AsyncChain {
    sender: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    backpressure: Arc<AtomicUsize>,
}

impl AsyncChain {
    #[must_use]
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();

        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
        });

        Self {
            sender,
            backpressure: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Append a task.
    ///
    /// The task is queued synchronously, so the backpressure counter already
    /// includes it when this returns. The returned future resolves with the
    /// task's output once it has run; it does not need to be polled for the
    /// task to run.
    pub fn add_to_chain<F, Fut, T>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, ChainError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.backpressure.fetch_add(1, Ordering::SeqCst);
        self.enqueue(task)
    }

    /// Append a task only while the backpressure is below `limit`.
    ///
    /// The check and the increment are one atomic step, so concurrent
    /// callers can never push the backpressure past `limit`. Returns `None`
    /// without running anything when the chain is full.
    pub fn try_add_to_chain<F, Fut, T>(
        &self,
        limit: usize,
        task: F,
    ) -> Option<impl Future<Output = Result<T, ChainError>> + Send + 'static>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.backpressure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()?;
        Some(self.enqueue(task))
    }

    // Caller has already counted the task in `backpressure`.
    fn enqueue<F, Fut, T>(
        &self,
        task: F,
    ) -> impl Future<Output = Result<T, ChainError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let backpressure = Arc::clone(&self.backpressure);

        let job = async move {
            let outcome = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;
            backpressure.fetch_sub(1, Ordering::SeqCst);

            let outcome = outcome.map_err(|_| {
                warn!(target: "worker.scheduler", "Chained task panicked");
                ChainError::TaskPanicked
            });
            // Caller may have stopped waiting
            let _ = result_tx.send(outcome);
        };

        if self.sender.send(job.boxed()).is_err() {
            self.backpressure.fetch_sub(1, Ordering::SeqCst);
        }

        async move {
            result_rx
                .await
                .map_err(|_| ChainError::Closed)
                .and_then(|outcome| outcome)
        }
    }

    /// Submitted tasks that have not settled yet.
    #[must_use]
    pub fn backpressure(&self) -> usize {
        self.backpressure.load(Ordering::SeqCst)
    }
}

impl Default for AsyncChain {
    fn default() -> Self {
        Self::new()
    }
}
