//! Transport boundary: commands in, frames and notifications out.
//!
//! The session manager never talks to sockets. It consumes
//! [`ViewerCommand`]s and pushes [`Outbound`] messages through a [`Transport`]
//! implementation owned by the embedding application (a WebSocket server
//! encoding frames as base64 images, for instance).
//!
//! Commands deserialize from the event names browser clients send:
//!
//! ```rust
//! use framecast::transport::ViewerCommand;
//!
//! let command: ViewerCommand = serde_yaml_ng::from_str(
//!     "event: startStream\ndata: {viewerId: sock-1, sourceId: cam1, frameRate: 5}",
//! )?;
//! assert_eq!(command.viewer_id().as_str(), "sock-1");
//! # Ok::<(), serde_yaml_ng::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{Frame, SessionId, SourceId, UpdateRate, ViewerId};
use crate::{ErrorKind, Result, StreamError};

/// Inbound command from a viewer's channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ViewerCommand {
    /// Start watching a source; a missing rate uses the configured default
    #[serde(rename = "startStream", rename_all = "camelCase")]
    Start {
        viewer_id: ViewerId,
        source_id: SourceId,
        #[serde(default)]
        frame_rate: Option<u32>,
    },

    /// Stop watching a source
    #[serde(rename = "stopStream", rename_all = "camelCase")]
    Stop { viewer_id: ViewerId, source_id: SourceId },

    /// The viewer's channel went away
    #[serde(rename = "disconnect", rename_all = "camelCase")]
    Disconnect { viewer_id: ViewerId },
}

impl ViewerCommand {
    /// Viewer the command came from
    pub fn viewer_id(&self) -> &ViewerId {
        match self {
            ViewerCommand::Start { viewer_id, .. }
            | ViewerCommand::Stop { viewer_id, .. }
            | ViewerCommand::Disconnect { viewer_id } => viewer_id,
        }
    }
}

/// Lifecycle notification sent to a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StatusEvent {
    /// The session is live; frames follow
    #[serde(rename = "streamStarted", rename_all = "camelCase")]
    Started { session_id: SessionId, source_id: SourceId, rate: UpdateRate },

    /// The session was stopped on request
    #[serde(rename = "streamStopped", rename_all = "camelCase")]
    Stopped { session_id: SessionId, source_id: SourceId },
}

/// Message pushed to a viewer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Frame),
    Error(ErrorKind),
    Status(StatusEvent),
}

/// Outbound half of a viewer's channel
///
/// Sends for one viewer may suspend (a full socket buffer, for instance);
/// this only delays that viewer's own session.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver a frame
    async fn send(&self, viewer: &ViewerId, frame: Frame) -> Result<()>;

    /// Report a failure
    async fn send_error(&self, viewer: &ViewerId, kind: ErrorKind) -> Result<()>;

    /// Report a session lifecycle change
    async fn send_status(&self, viewer: &ViewerId, status: StatusEvent) -> Result<()>;
}

/// In-process transport backed by one bounded channel per viewer
#[derive(Debug)]
pub struct ChannelTransport {
    capacity: usize,
    viewers: Mutex<HashMap<ViewerId, mpsc::Sender<Outbound>>>,
}

impl ChannelTransport {
    /// Create a transport whose per-viewer channels hold `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), viewers: Mutex::new(HashMap::new()) }
    }

    /// Open (or replace) the channel for a viewer
    pub fn connect(&self, viewer: ViewerId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(viewer_id = %viewer, "Viewer channel opened");
        self.viewers.lock().unwrap_or_else(|e| e.into_inner()).insert(viewer, tx);
        rx
    }

    /// Close a viewer's channel; returns whether it was open
    pub fn disconnect(&self, viewer: &ViewerId) -> bool {
        let removed = self.viewers.lock().unwrap_or_else(|e| e.into_inner()).remove(viewer);
        removed.is_some()
    }

    /// Number of open viewer channels
    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn deliver(&self, viewer: &ViewerId, message: Outbound) -> Result<()> {
        let sender = {
            let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
            viewers.get(viewer).cloned()
        };
        let sender = sender.ok_or_else(|| StreamError::transport_closed(viewer.as_str()))?;
        sender.send(message).await.map_err(|_| StreamError::transport_closed(viewer.as_str()))
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, viewer: &ViewerId, frame: Frame) -> Result<()> {
        self.deliver(viewer, Outbound::Frame(frame)).await
    }

    async fn send_error(&self, viewer: &ViewerId, kind: ErrorKind) -> Result<()> {
        self.deliver(viewer, Outbound::Error(kind)).await
    }

    async fn send_status(&self, viewer: &ViewerId, status: StatusEvent) -> Result<()> {
        self.deliver(viewer, Outbound::Status(status)).await
    }
}
