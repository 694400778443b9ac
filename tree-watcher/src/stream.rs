//! Async iteration over a watch session.

use std::path::Path;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WatchOptions;
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, WatchEvent};
use crate::watcher::RecursiveWatcher;

/// Start watching `path` and iterate its changes.
pub fn watch(path: impl AsRef<Path>, options: WatchOptions) -> Result<WatchStream> {
    let mut watcher = RecursiveWatcher::new(options);
    watcher.start(path)?;
    Ok(WatchStream::new(watcher))
}

/// Change events of a started [`RecursiveWatcher`], with optional
/// cancellation.
pub struct WatchStream {
    watcher: RecursiveWatcher,
    cancel: Option<CancellationToken>,
    finished: bool,
}

impl WatchStream {
    /// Wrap a started watcher.
    pub fn new(watcher: RecursiveWatcher) -> Self {
        Self {
            watcher,
            cancel: None,
            finished: false,
        }
    }

    /// Stop the stream when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Next change, or the next error event as `Err`.
    ///
    /// On cancellation the watcher is closed, this call returns
    /// [`WatcherError::Cancelled`] and later calls return `None`.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        if self.finished {
            return None;
        }

        let event = match self.cancel.clone() {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return self.cancelled(),
                    event = self.watcher.next() => event,
                }
            }
            None => self.watcher.next().await,
        };

        match event {
            Some(WatchEvent::Change(change)) => Some(Ok(change)),
            Some(WatchEvent::Error(err)) => Some(Err(err)),
            Some(WatchEvent::Close) | None => {
                self.finished = true;
                None
            }
        }
    }

    fn cancelled(&mut self) -> Option<Result<ChangeEvent>> {
        debug!("Watch stream cancelled");
        self.finished = true;
        self.watcher.close();
        Some(Err(WatcherError::Cancelled))
    }

    /// Close the underlying watcher. Pending events are still delivered.
    pub fn close(&mut self) {
        self.watcher.close();
    }

    /// The underlying watcher.
    pub fn watcher(&self) -> &RecursiveWatcher {
        &self.watcher
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}
