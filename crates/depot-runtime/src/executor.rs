//! Executors supplied to a database.
//!
//! Reads run on a query executor, a tokio runtime handle on which they may
//! run concurrently. Writes run on a transaction executor: one worker task
//! draining a queue, so jobs execute strictly in submission order.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};

/// Runs reads on a runtime handle.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    handle: Handle,
}

impl QueryExecutor {
    /// Creates an executor spawning on `handle`.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The runtime handle.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `job` on the executor and waits for its result.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.handle
            .spawn(job)
            .await
            .map_err(|e| Error::Executor(e.to_string()))?
    }
}

type Job = BoxFuture<'static, ()>;

/// Serial queue of write jobs.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl TransactionExecutor {
    /// Starts the worker on `handle`. It stops once every clone of the
    /// executor is dropped.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            debug!("Transaction executor stopped");
        });
        Self { sender }
    }

    /// Queues `job`. The ticket resolves to its result; dropping the ticket
    /// does not cancel the job.
    pub fn submit<T, F>(&self, job: F) -> WriteTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // The caller may have dropped its ticket.
            let _ = sender.send(job.await);
        });
        if self.sender.send(job).is_err() {
            debug!("Transaction executor is gone, dropping job");
        }
        WriteTicket { receiver }
    }
}

/// Result of a queued write.
#[derive(Debug)]
#[must_use = "a write ticket reports the outcome of the write"]
pub struct WriteTicket<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> WriteTicket<T> {
    /// A ticket that resolves to `error` immediately.
    pub(crate) fn failed(error: Error) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Self { receiver }
    }
}

impl<T> Future for WriteTicket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(Error::Executor(
                    "transaction executor stopped before running the job".to_string(),
                ))
            })
        })
    }
}
