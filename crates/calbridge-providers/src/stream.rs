//! Sync progress streams.
//!
//! A [`SyncStream`] is the receiving half of a spawned sync task. Items are
//! produced as the task makes progress, and the task is aborted when the
//! stream is dropped or [cancelled](SyncStream::cancel).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// Progress reported by a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started,
    /// Running count of items applied so far.
    ItemSynced(usize),
    /// The run finished; carries the new sync token, if the backend has one.
    Completed(Option<String>),
}

const CHANNEL_CAPACITY: usize = 32;

/// Producer handle given to the sync task.
#[derive(Debug, Clone)]
pub struct SyncSender {
    tx: mpsc::Sender<ProviderResult<SyncEvent>>,
}

impl SyncSender {
    /// Sends one event. Returns `false` once the stream is gone.
    pub async fn send(&self, event: SyncEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }
}

pub struct SyncStream {
    rx: mpsc::Receiver<ProviderResult<SyncEvent>>,
    task: JoinHandle<()>,
}

impl fmt::Debug for SyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncStream")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl SyncStream {
    /// Runs `producer` on the current runtime. An error returned by the
    /// producer becomes the last item of the stream.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(SyncSender) -> Fut,
        Fut: Future<Output = ProviderResult<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sender = SyncSender { tx: tx.clone() };
        let fut = producer(sender);
        let task = tokio::spawn(async move {
            if let Err(e) = fut.await {
                debug!(error = %e, "sync task failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        Self { rx, task }
    }

    /// Stream that yields a single error.
    pub fn failed(error: ProviderError) -> Self {
        Self::spawn(move |_| async move { Err(error) })
    }

    /// Stops the sync task. Items already queued are discarded.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Stream for SyncStream {
    type Item = ProviderResult<SyncEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SyncStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
