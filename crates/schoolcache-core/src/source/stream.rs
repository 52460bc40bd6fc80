use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{EntityValue, SourceState};

type Release = Box<dyn FnOnce() + Send + Sync>;

/// A subscription to the shared state stream of one entity.
///
/// Yields the current state first, then every later state. Intermediate
/// states may be conflated when the subscriber falls behind; the latest state
/// is never lost. Dropping the stream releases the subscription.
pub struct SourceStream<T: EntityValue> {
    states: WatchStream<SourceState<T>>,
    latest: watch::Receiver<SourceState<T>>,
    release: Option<Release>,
}

impl<T: EntityValue> SourceStream<T> {
    pub(crate) fn new(receiver: watch::Receiver<SourceState<T>>, release: Release) -> Self {
        Self {
            states: WatchStream::new(receiver.clone()),
            latest: receiver,
            release: Some(release),
        }
    }

    /// Most recent state, without waiting.
    pub fn latest(&self) -> SourceState<T> {
        self.latest.borrow().clone()
    }

    /// Wait for the first state that will not change without new demand.
    ///
    /// Returns `None` if the stream was closed by an invalidation first.
    pub async fn settled(&mut self) -> Option<SourceState<T>> {
        while let Some(state) = self.next().await {
            if state.is_terminal() {
                return Some(state);
            }
        }
        None
    }
}

impl<T: EntityValue> Stream for SourceStream<T> {
    type Item = SourceState<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.states).poll_next(cx)
    }
}

impl<T: EntityValue> Drop for SourceStream<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
