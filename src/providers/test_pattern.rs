//! Synthetic source for development and tests

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info};

use super::{frame_period, nominal_timestamp};
use crate::provider::FrameSource;
use crate::types::{RawFrame, SourceConfig, SourceId};
use crate::{Result, StreamError};

const PATTERN_LEN: usize = 64;

/// Source emitting a deterministic byte pattern at its nominal rate
///
/// Frames are paced on the tokio clock, so paused-time tests advance through
/// them instantly. Timestamps are exact multiples of the frame interval
/// counted from connect.
pub struct TestPatternSource {
    source_id: SourceId,
    frame_rate: f64,
    interval: Option<Interval>,
    emitted: u64,
    total_emitted: u64,

    /// Frames (across reconnects) after which the feed drops once
    fail_after: Option<u64>,
    /// Connection attempts left to reject
    fail_connects: u32,
}

impl TestPatternSource {
    /// Create a source
    pub fn new(source_id: impl Into<SourceId>, frame_rate: f64) -> Self {
        Self {
            source_id: source_id.into(),
            frame_rate,
            interval: None,
            emitted: 0,
            total_emitted: 0,
            fail_after: None,
            fail_connects: 0,
        }
    }

    /// Create a source from its registry record
    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.id.clone(), config.frame_rate)
    }

    /// Drop the feed once after `frames` frames
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Reject the first `attempts` connection attempts
    pub fn fail_connects(mut self, attempts: u32) -> Self {
        self.fail_connects = attempts;
        self
    }

    fn pattern(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PATTERN_LEN);
        buf.put_slice(b"FCTP");
        buf.put_u64(self.total_emitted);
        let seed = self.total_emitted as u8;
        while buf.len() < PATTERN_LEN {
            let i = buf.len() as u8;
            buf.put_u8(i.wrapping_mul(31).wrapping_add(seed));
        }
        buf.freeze()
    }
}

#[async_trait::async_trait]
impl FrameSource for TestPatternSource {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            let reason = "injected connect failure";
            return Err(StreamError::disconnected(self.source_id.as_str(), reason));
        }

        let mut ticks = interval(frame_period(self.frame_rate));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(ticks);
        self.emitted = 0;

        info!(source_id = %self.source_id, frame_rate = self.frame_rate, "Test pattern connected");
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RawFrame> {
        if self.fail_after == Some(self.total_emitted) {
            self.fail_after = None;
            return Err(StreamError::disconnected(self.source_id.as_str(), "injected feed drop"));
        }

        let ticks = self.interval.as_mut().ok_or_else(|| {
            StreamError::disconnected(self.source_id.as_str(), "read before connect")
        })?;
        ticks.tick().await;

        let frame = RawFrame::new(self.pattern(), nominal_timestamp(self.emitted, self.frame_rate));
        self.emitted += 1;
        self.total_emitted += 1;
        Ok(frame)
    }

    async fn disconnect(&mut self) {
        if self.interval.take().is_some() {
            let frames = self.total_emitted;
            debug!(source_id = %self.source_id, frames, "Test pattern disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn emits_paced_frames_with_exact_timestamps() {
        let mut source = TestPatternSource::new("tp", 30.0);
        source.connect().await.unwrap();

        let start = tokio::time::Instant::now();
        let mut timestamps = Vec::new();
        for _ in 0..7 {
            timestamps.push(source.read_frame().await.unwrap().timestamp);
        }

        assert_eq!(timestamps[6], Duration::from_millis(200));
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        // First tick is immediate, six more periods follow
        assert!(start.elapsed() >= Duration::from_millis(199));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_is_deterministic() {
        let mut a = TestPatternSource::new("tp", 10.0);
        let mut b = TestPatternSource::new("tp", 10.0);
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let fa = a.read_frame().await.unwrap();
        let fb = b.read_frame().await.unwrap();
        assert_eq!(fa.data, fb.data);
        assert_eq!(fa.data.len(), PATTERN_LEN);
        assert_eq!(&fa.data[..4], b"FCTP");

        assert_ne!(a.read_frame().await.unwrap().data, fa.data);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failures() {
        let mut source = TestPatternSource::new("tp", 10.0).fail_connects(1).fail_after(2);
        assert!(source.connect().await.unwrap_err().is_retryable());
        source.connect().await.unwrap();

        source.read_frame().await.unwrap();
        source.read_frame().await.unwrap();
        let err = source.read_frame().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceDisconnected { .. }));

        // Clock restarts on reconnect
        source.connect().await.unwrap();
        assert_eq!(source.read_frame().await.unwrap().timestamp, Duration::ZERO);
    }

    #[tokio::test]
    async fn read_before_connect_fails() {
        let mut source = TestPatternSource::new("tp", 10.0);
        assert!(source.read_frame().await.is_err());
    }
}
