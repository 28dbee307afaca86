//! Provider trait for frame acquisition

use crate::Result;
use crate::types::RawFrame;

/// Trait for the physical (or synthetic) side of a source
///
/// A frame source knows how to reach one feed and pull frames from it.
/// It does not retry, sequence or time out on its own: the
/// [`FrameSourceAdapter`](crate::adapter::FrameSourceAdapter) wraps it with
/// those policies.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Establish the connection to the feed
    ///
    /// Called once on open and again for every reconnection attempt.
    ///
    /// Returns:
    /// - `Ok(())` - Feed is ready to read
    /// - `Err(e)` where `e.is_retryable()` - Transient failure, may be retried
    /// - `Err(e)` otherwise - The feed can never be reached with this configuration
    async fn connect(&mut self) -> Result<()>;

    /// Get the next frame
    ///
    /// Each source handles its own pacing:
    /// - Cameras: wait for the device to deliver a frame
    /// - Directories and generators: sleep until the next frame is due
    ///
    /// Returns:
    /// - `Ok(frame)` - New frame available
    /// - `Err(StreamError::SourceDisconnected)` - Feed dropped, reconnecting may help
    /// - `Err(StreamError::SourceUnavailable)` - Feed is gone for good
    async fn read_frame(&mut self) -> Result<RawFrame>;

    /// Release the connection to the feed
    async fn disconnect(&mut self);
}
