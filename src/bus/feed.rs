//! Per-source broadcast loop

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::FeedEvent;
use crate::Result;
use crate::adapter::FrameSourceAdapter;
use crate::processor::FrameProcessor;
use crate::types::{Frame, SourceId};

/// State of one open source, guarded by its slot lock
pub(super) struct ActiveFeed {
    /// Generation, distinguishes a reopened source from the feed it replaced
    pub feed_id: u64,
    pub sender: broadcast::Sender<FeedEvent>,
    pub subscribers: usize,
    /// Cancelled by the bus to close the feed, or by the loop once the source is lost
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl ActiveFeed {
    /// Start broadcasting frames read from `adapter`, passed through `processor`
    pub fn spawn(
        feed_id: u64,
        adapter: FrameSourceAdapter,
        processor: Option<Arc<dyn FrameProcessor>>,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(adapter, processor, sender.clone(), cancel.clone()));

        Self { feed_id, sender, subscribers: 0, cancel, task }
    }

    /// Whether the loop stopped on its own after losing the source
    pub fn is_dead(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Read the next frame and run it through the processor
///
/// The outer error is the source failing; the inner one is the processor
/// rejecting this frame.
async fn next_processed(
    adapter: &mut FrameSourceAdapter,
    processor: Option<&dyn FrameProcessor>,
) -> Result<Result<Frame>> {
    let frame = adapter.next_frame().await?;
    let Some(processor) = processor else {
        return Ok(Ok(frame));
    };

    let original = Frame { data: Bytes::new(), ..frame.clone() };
    let processed = processor.process(adapter.config(), frame).await;
    Ok(processed.map(|processed| Frame { data: processed.data, ..original }))
}

/// Broadcast loop - reads frames and fans them out to every subscriber
///
/// Sending never waits on receivers: a slow subscriber loses its oldest
/// queued frames instead of holding up the loop.
async fn run(
    mut adapter: FrameSourceAdapter,
    processor: Option<Arc<dyn FrameProcessor>>,
    sender: broadcast::Sender<FeedEvent>,
    cancel: CancellationToken,
) {
    let source_id: SourceId = adapter.config().id.clone();
    info!(%source_id, processor = processor.as_ref().map(|p| p.name()), "Feed started");
    let mut frames_sent = 0u64;

    let failure = loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%source_id, "Feed cancelled");
                break None;
            }
            result = next_processed(&mut adapter, processor.as_deref()) => result,
        };

        match result {
            Ok(Ok(frame)) => {
                frames_sent += 1;
                trace!(%source_id, sequence = frame.sequence, "Broadcast");
                // No receivers is fine: the bus closes the feed when the last one leaves
                let _ = sender.send(FeedEvent::Frame(frame));
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(%source_id, error = %e, "Frame processing failed, frame dropped");
            }
            Ok(Err(e)) => {
                error!(%source_id, error = %e, "Frame processing failed, closing feed");
                break Some(e.kind());
            }
            Err(e) => {
                error!(%source_id, error = %e, "Source lost, closing feed");
                break Some(e.kind());
            }
        }
    };

    let (produced, reconnects) = (adapter.frames_produced(), adapter.reconnects());
    adapter.close().await;

    if let Some(kind) = failure {
        // Mark the feed dead before notifying so a late subscriber either sees
        // the notification or opens a fresh feed
        cancel.cancel();
        let _ = sender.send(FeedEvent::Closed(kind));
    }

    info!(%source_id, produced, broadcast = frames_sent, reconnects, "Feed ended");
}
