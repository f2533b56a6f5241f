//! Live queries.
//!
//! A [`LiveQuery`] is a stream that yields the result of a query once on
//! first poll and again after every change to the tables the query reads.
//! Changes arriving while a result is computed collapse into one re-run.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};
use crate::invalidation::{CallbackGate, Subscription};

/// Stream of query results, re-run on every change to the observed tables.
///
/// Dropping the stream cancels its subscription.
pub struct LiveQuery<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T: Send + 'static> LiveQuery<T> {
    /// Builds the stream from a subscription whose callback signals `wake`.
    pub(crate) fn new<F, Fut>(
        subscription: Subscription,
        wake: mpsc::Receiver<()>,
        run: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let inner = stream::unfold(
            (subscription, true, wake, run),
            |(subscription, first, mut wake, run)| async move {
                if !first {
                    wake.recv().await?;
                }
                let result = run().await;
                Some((result, (subscription, false, wake, run)))
            },
        );
        Self {
            inner: inner.boxed(),
        }
    }

    /// A stream yielding `error` once.
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            inner: stream::once(async move { Err(error) }).boxed(),
        }
    }
}

impl<T> Stream for LiveQuery<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery").finish_non_exhaustive()
    }
}

/// Drives a [`LiveQuery`] into a callback. Cancelled on drop.
pub struct QueryObserver {
    abort: AbortHandle,
    gate: Arc<CallbackGate>,
}

impl QueryObserver {
    pub(crate) fn spawn<T, F>(handle: &tokio::runtime::Handle, mut query: LiveQuery<T>, callback: F) -> Self
    where
        T: Send + 'static,
        F: Fn(Result<T>) + Send + Sync + 'static,
    {
        let gate = Arc::new(CallbackGate::new());
        let task_gate = Arc::clone(&gate);
        let abort = handle
            .spawn(async move {
                while let Some(result) = query.next().await {
                    if !task_gate.run(|| callback(result)) {
                        break;
                    }
                }
            })
            .abort_handle();
        Self { abort, gate }
    }

    /// Stops the observer. No callback runs after this returns, unless
    /// called from the callback itself.
    pub fn cancel(&self) {
        self.abort.abort();
        self.gate.close();
    }

    /// Returns false once cancelled or once the query ended.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_live() && !self.abort.is_finished()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("active", &self.is_active())
            .finish()
    }
}
