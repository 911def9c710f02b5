//! Admission-controlled fetch dispatch.
//!
//! [`build_fetch_manager_builder`] returns a factory; every databox socket
//! gets its own [`FetchManager`] from it.
//!
//! - Parallel mode: every fetch runs immediately and independently.
//! - Sequential mode: fetches run one at a time through a private
//!   [`AsyncChain`]. A fetch is admitted only while the chain's backpressure
//!   is below `max_backpressure`; otherwise it is rejected on the spot with
//!   `MaxBackpressureReached` and no work is done.
//!
//! Every dispatched fetch produces exactly one result.

use crate::errors::WorkerError;
use crate::observability::metrics;
use crate::scheduling::async_chain::{AsyncChain, ChainError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use tracing::debug;

/// Factory for per-socket fetch managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchManagerBuilder {
    parallel_fetch: bool,
    max_backpressure: usize,
}

/// Create a factory for fetch managers with the given mode.
#[must_use]
pub fn build_fetch_manager_builder(
    parallel_fetch: bool,
    max_backpressure: usize,
) -> FetchManagerBuilder {
    FetchManagerBuilder {
        parallel_fetch,
        max_backpressure,
    }
}

impl FetchManagerBuilder {
    /// Build a fresh manager. Sequential managers own their own chain, so
    /// this must run inside a tokio runtime.
    #[must_use]
    pub fn build(&self) -> FetchManager {
        if self.parallel_fetch {
            FetchManager::Parallel
        } else {
            FetchManager::Sequential {
                chain: AsyncChain::new(),
                max_backpressure: self.max_backpressure,
            }
        }
    }

    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.parallel_fetch
    }
}

/// Per-socket fetch dispatcher.
#[derive(Debug)]
pub enum FetchManager {
    Parallel,
    Sequential {
        chain: AsyncChain,
        max_backpressure: usize,
    },
}

impl FetchManager {
    /// Dispatch a fetch.
    ///
    /// Admission is decided before this returns: a rejected fetch yields an
    /// already-completed future and `work` is never called.
    pub fn dispatch<F, Fut, T>(&self, work: F) -> BoxFuture<'static, Result<T, WorkerError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            FetchManager::Parallel => {
                let handle = tokio::spawn(async move { work().await });
                async move {
                    handle
                        .await
                        .map_err(|e| WorkerError::Internal(format!("fetch task failed: {e}")))
                }
                .boxed()
            }
            FetchManager::Sequential {
                chain,
                max_backpressure,
            } => match chain.try_add_to_chain(*max_backpressure, work) {
                Some(queued) => async move { queued.await.map_err(chain_error) }.boxed(),
                None => {
                    metrics::record_fetch_rejected();
                    debug!(
                        target: "worker.scheduler",
                        max_backpressure = *max_backpressure,
                        "Fetch rejected: max backpressure reached"
                    );
                    futures::future::ready(Err(WorkerError::MaxBackpressureReached {
                        max_backpressure: *max_backpressure,
                    }))
                    .boxed()
                }
            },
        }
    }

    /// Dispatch a fetch and hand its result to `respond` exactly once.
    ///
    /// Rejections call `respond` before this returns.
    pub fn dispatch_with<F, Fut, T, R>(&self, work: F, respond: R)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        R: FnOnce(Result<T, WorkerError>) + Send + 'static,
    {
        let mut pending = self.dispatch(work);
        match (&mut pending).now_or_never() {
            Some(result) => respond(result),
            None => {
                tokio::spawn(async move { respond(pending.await) });
            }
        }
    }

    /// Fetches admitted but not yet completed (always 0 in parallel mode).
    #[must_use]
    pub fn backpressure(&self) -> usize {
        match self {
            FetchManager::Parallel => 0,
            FetchManager::Sequential { chain, .. } => chain.backpressure(),
        }
    }
}

fn chain_error(err: ChainError) -> WorkerError {
    WorkerError::Internal(format!("fetch failed: {err}"))
}
