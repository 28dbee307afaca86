//! Per-session delivery loop

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::state::{SessionState, SessionStats, transition};
use crate::bus::{FeedEvent, FrameBus, Subscription};
use crate::stream::Decimate;
use crate::transport::Transport;
use crate::types::{SessionId, ViewerId};
use crate::ErrorKind;

/// Everything the delivery loop needs, moved into its task
pub(super) struct DeliveryTask {
    pub session_id: SessionId,
    pub viewer_id: ViewerId,
    pub bus: FrameBus,
    pub transport: Arc<dyn Transport>,
    pub state: Arc<watch::Sender<SessionState>>,
    pub stats: Arc<SessionStats>,
    pub cancel: CancellationToken,
}

enum Exit {
    Cancelled,
    SourceLost(ErrorKind),
    TransportClosed,
}

impl DeliveryTask {
    /// Forward decimated frames to the viewer until cancelled or the feed ends
    ///
    /// Returns the subscription when the manager is tearing the session down,
    /// so the manager can release it. When the loop ends the session itself
    /// it releases the subscription and returns `None`.
    pub async fn run(self, mut frames: Decimate<Subscription>) -> Option<Subscription> {
        let session_id = self.session_id;
        let viewer_id = &self.viewer_id;
        let mut last_sequence: Option<u64> = None;

        debug!(%session_id, %viewer_id, "Delivery started");

        let exit = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Exit::Cancelled,
                event = frames.next() => event,
            };

            let frame = match event {
                Some(FeedEvent::Frame(frame)) => frame,
                Some(FeedEvent::Closed(kind)) => break Exit::SourceLost(kind),
                None => break Exit::SourceLost(ErrorKind::SourceUnavailable),
            };

            self.stats.record_drops(frames.skipped(), frames.get_ref().dropped_frames());

            if last_sequence.is_some_and(|last| frame.sequence <= last) {
                warn!(%session_id, sequence = frame.sequence, "Out of order frame skipped");
                continue;
            }

            let sequence = frame.sequence;
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Exit::Cancelled,
                sent = self.transport.send(viewer_id, frame) => sent,
            };

            match sent {
                Ok(()) => {
                    trace!(%session_id, sequence, "Delivered");
                    last_sequence = Some(sequence);
                    self.stats.record_delivery(sequence);
                }
                Err(e) => {
                    debug!(%session_id, error = %e, "Viewer unreachable");
                    break Exit::TransportClosed;
                }
            }
        };

        let subscription = frames.into_inner();

        match exit {
            Exit::Cancelled => Some(subscription),
            Exit::SourceLost(kind) => {
                if !transition(&self.state, SessionState::Active, SessionState::Terminated) {
                    return Some(subscription);
                }
                info!(%session_id, %viewer_id, %kind, "Session terminated, source lost");
                self.bus.unsubscribe(subscription).await;
                if let Err(e) = self.transport.send_error(viewer_id, kind).await {
                    debug!(%session_id, error = %e, "Could not report source loss");
                }
                None
            }
            Exit::TransportClosed => {
                if !transition(&self.state, SessionState::Active, SessionState::Terminated) {
                    return Some(subscription);
                }
                info!(%session_id, %viewer_id, "Session terminated, transport closed");
                self.bus.unsubscribe(subscription).await;
                None
            }
        }
    }
}
