//! Frame types flowing from sources to viewers

use bytes::Bytes;
use std::time::Duration;

use super::SourceId;

/// Frame as produced by a [`FrameSource`](crate::provider::FrameSource)
///
/// Carries the encoded image and the capture time on the source's own clock.
/// Sequence numbering is applied by the adapter, not the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Encoded image payload
    pub data: Bytes,

    /// Capture time relative to when the source connected
    pub timestamp: Duration,
}

impl RawFrame {
    /// Create a new raw frame
    pub fn new(data: impl Into<Bytes>, timestamp: Duration) -> Self {
        Self { data: data.into(), timestamp }
    }
}

/// Sequenced frame broadcast to every session watching a source
///
/// Cheap to clone: the payload is reference counted and never copied or
/// mutated once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Source this frame was captured from
    pub source_id: SourceId,

    /// Monotonic frame counter, restarting at zero whenever the source is reopened
    pub sequence: u64,

    /// Capture timestamp, non-decreasing within one open of the source
    pub timestamp: Duration,

    /// Encoded image payload (zero-copy via reference counting)
    pub data: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(source_id: SourceId, sequence: u64, timestamp: Duration, data: Bytes) -> Self {
        Self { source_id, sequence, timestamp, data }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
