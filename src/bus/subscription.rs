//! Subscriber handle on a source feed

use futures::{Stream, ready};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use super::{BusInner, FeedEvent};
use crate::types::{SourceConfig, SourceId};

/// One subscriber's view of a source feed
///
/// Yields every frame published after it subscribed, then a
/// [`FeedEvent::Closed`] if the source is lost. Frames the subscriber was too
/// slow to take are skipped (oldest first) and counted in
/// [`dropped_frames`](Self::dropped_frames).
///
/// Hand it back with [`FrameBus::unsubscribe`](super::FrameBus::unsubscribe).
/// Dropping it instead releases it in the background.
pub struct Subscription {
    pub(super) source: Arc<SourceConfig>,
    pub(super) feed_id: u64,
    pub(super) stream: BroadcastStream<FeedEvent>,
    pub(super) dropped: u64,
    pub(super) finished: bool,
    pub(super) released: bool,
    pub(super) bus: Weak<BusInner>,
}

impl Subscription {
    /// Source being watched
    pub fn source_id(&self) -> &SourceId {
        &self.source.id
    }

    /// Snapshot of the source record taken at subscribe time
    pub fn source(&self) -> &Arc<SourceConfig> {
        &self.source
    }

    /// Generation of the feed this subscription reads from
    pub fn feed_id(&self) -> u64 {
        self.feed_id
    }

    /// Frames lost because this subscriber fell behind
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

impl Stream for Subscription {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match ready!(Pin::new(&mut self.stream).poll_next(cx)) {
                Some(Ok(event)) => {
                    self.finished = matches!(event, FeedEvent::Closed(_));
                    return Poll::Ready(Some(event));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    self.dropped += skipped;
                    let total = self.dropped;
                    debug!(source_id = %self.source.id, skipped, total, "Subscriber lagging");
                }
                None => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };

        let source_id = self.source.id.clone();
        let feed_id = self.feed_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%source_id, "Subscription dropped, releasing");
                handle.spawn(async move { bus.release(&source_id, feed_id).await });
            }
            Err(_) => {
                warn!(%source_id, "Subscription dropped outside a runtime, feed not released")
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("source_id", &self.source.id)
            .field("feed_id", &self.feed_id)
            .field("dropped", &self.dropped)
            .finish()
    }
}
