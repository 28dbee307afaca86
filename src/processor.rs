//! Per-frame processing applied before fan-out

use crate::Result;
use crate::types::{Frame, SourceConfig};

/// Hook that transforms every frame of a source once, before it is broadcast
///
/// Typical use is running a detector over the image and drawing its results
/// into the payload. The frame bus calls it from the source's broadcast loop,
/// so each frame is processed exactly once however many viewers watch it, and
/// a slow processor slows that source down rather than any one viewer.
///
/// Register a processor per [`SourceKind`](crate::types::SourceKind) with
/// [`AdapterTable::register_processor`](crate::adapter::AdapterTable::register_processor).
///
/// Only the payload of the returned frame is kept. Source, sequence and
/// timestamp always come from the original frame.
#[async_trait::async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str {
        "frame processor"
    }

    /// Process one frame
    ///
    /// Returns:
    /// - `Ok(frame)` - Frame to broadcast in place of the original
    /// - `Err(e)` where `e.is_retryable()` - This frame is dropped, the feed continues
    /// - `Err(e)` otherwise - The feed closes and every subscriber is told `e.kind()`
    async fn process(&self, source: &SourceConfig, frame: Frame) -> Result<Frame>;
}
