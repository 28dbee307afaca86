//! Frame source adapter: the resilient, sequenced view of one source.
//!
//! A [`FrameSource`] only knows how to talk to its feed. The adapter wraps it
//! with the policies every source needs:
//!
//! - **Timeouts**: connection attempts and individual reads are bounded
//! - **Reconnection**: transient failures (`SourceDisconnected`, `Timeout`) are
//!   retried with bounded exponential backoff; exhaustion surfaces as
//!   `SourceUnavailable`
//! - **Sequencing**: frames are numbered from zero per open, and timestamps
//!   never go backwards, even across reconnections
//!
//! The [`AdapterTable`] maps each [`SourceKind`] to a constructor, so the
//! physical acquisition for cameras or video files can be supplied by the
//! embedding application. It also holds the optional [`FrameProcessor`] run
//! over every frame of a kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::AdapterConfig;
use crate::processor::FrameProcessor;
use crate::provider::FrameSource;
use crate::providers::{DirectorySource, TestPatternSource};
use crate::types::{Frame, RawFrame, SourceConfig, SourceKind};
use crate::{Result, StreamError};

/// Constructor turning a source record into a frame source
pub type SourceConstructor =
    Arc<dyn Fn(&SourceConfig) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Registration table from source kind to frame source implementation
#[derive(Clone, Default)]
pub struct AdapterTable {
    constructors: HashMap<SourceKind, SourceConstructor>,
    processors: HashMap<SourceKind, Arc<dyn FrameProcessor>>,
}

impl AdapterTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with the sources shipped in this crate
    ///
    /// Registers [`TestPatternSource`] and [`DirectorySource`]. Cameras and
    /// video files need a decoder and must be registered by the caller.
    pub fn with_builtin() -> Self {
        let mut table = Self::new();
        table.register(SourceKind::TestPattern, |config| {
            Ok(Box::new(TestPatternSource::from_config(config)) as Box<dyn FrameSource>)
        });
        table.register(SourceKind::Directory, |config| {
            Ok(Box::new(DirectorySource::from_config(config)?) as Box<dyn FrameSource>)
        });
        table
    }

    /// Register (or replace) the constructor for a kind
    pub fn register<F>(&mut self, kind: SourceKind, constructor: F) -> &mut Self
    where
        F: Fn(&SourceConfig) -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(constructor));
        self
    }

    /// Register (or replace) the processor applied to every frame of a kind
    pub fn register_processor(
        &mut self,
        kind: SourceKind,
        processor: Arc<dyn FrameProcessor>,
    ) -> &mut Self {
        self.processors.insert(kind, processor);
        self
    }

    /// Processor for frames of a kind, if any
    pub fn processor(&self, kind: SourceKind) -> Option<Arc<dyn FrameProcessor>> {
        self.processors.get(&kind).cloned()
    }

    /// Whether a constructor is registered for the kind
    pub fn supports(&self, kind: SourceKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build the frame source for a record
    pub fn create(&self, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        config.validate()?;
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            StreamError::invalid_config(
                config.id.as_str(),
                format!("no frame source registered for kind '{}'", config.kind),
            )
        })?;
        constructor(config)
    }
}

impl fmt::Debug for AdapterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        let mut processors: Vec<_> = self
            .processors
            .iter()
            .map(|(kind, processor)| format!("{kind}: {}", processor.name()))
            .collect();
        processors.sort();
        f.debug_struct("AdapterTable")
            .field("kinds", &kinds)
            .field("processors", &processors)
            .finish()
    }
}

/// One open handle on a source
///
/// The frame bus holds exactly one adapter per active source, regardless of
/// how many sessions are watching it.
pub struct FrameSourceAdapter {
    config: Arc<SourceConfig>,
    source: Box<dyn FrameSource>,
    settings: AdapterConfig,
    next_sequence: u64,
    last_timestamp: Option<Duration>,
    timestamp_offset: Duration,
    reconnects: u64,
    connected: bool,
}

impl FrameSourceAdapter {
    /// Open a source
    ///
    /// Connection failures are retried according to the reconnect policy.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` when the record is incomplete or rejected by the source
    /// - `SourceUnavailable` when no connection could be established
    pub async fn open(
        config: Arc<SourceConfig>,
        source: Box<dyn FrameSource>,
        settings: AdapterConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut adapter = Self {
            config,
            source,
            settings,
            next_sequence: 0,
            last_timestamp: None,
            timestamp_offset: Duration::ZERO,
            reconnects: 0,
            connected: false,
        };

        match adapter.connect_once().await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => adapter.reconnect(e).await?,
            Err(e) => return Err(adapter.terminal(e)),
        }

        info!(
            source_id = %adapter.config.id,
            kind = %adapter.config.kind,
            frame_rate = adapter.config.frame_rate,
            "Source opened"
        );

        Ok(adapter)
    }

    /// Get the next frame
    ///
    /// Waits for the source, reconnecting on transient failures.
    ///
    /// # Errors
    ///
    /// `SourceUnavailable` once reconnection is exhausted or the source fails
    /// permanently. The adapter should be closed afterwards.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            let read_timeout = self.settings.read_timeout;
            let result = match tokio::time::timeout(read_timeout, self.source.read_frame()).await {
                Ok(result) => result,
                Err(_) => Err(StreamError::Timeout { duration: read_timeout }),
            };

            match result {
                Ok(raw) => return Ok(self.sequence(raw)),
                Err(e) if e.is_retryable() => {
                    let source_id = &self.config.id;
                    warn!(%source_id, error = %e, "Source read failed, reconnecting");
                    self.reconnect(e).await?;
                }
                Err(e) => return Err(self.terminal(e)),
            }
        }
    }

    /// Release the underlying feed
    pub async fn close(mut self) {
        if self.connected {
            self.source.disconnect().await;
            self.connected = false;
        }
        info!(
            source_id = %self.config.id,
            frames = self.next_sequence,
            reconnects = self.reconnects,
            "Source closed"
        );
    }

    /// Record this adapter was opened for
    pub fn config(&self) -> &Arc<SourceConfig> {
        &self.config
    }

    /// Frames produced since open
    pub fn frames_produced(&self) -> u64 {
        self.next_sequence
    }

    /// Successful reconnections since open
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    async fn connect_once(&mut self) -> Result<()> {
        let open_timeout = self.settings.open_timeout;
        match tokio::time::timeout(open_timeout, self.source.connect()).await {
            Ok(Ok(())) => {
                self.connected = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::Timeout { duration: open_timeout }),
        }
    }

    /// Reconnect after a transient failure
    ///
    /// Exponential backoff: initial, 2x, 4x, ... capped at `max_backoff`, for
    /// at most `max_attempts` attempts within `max_elapsed`.
    async fn reconnect(&mut self, cause: StreamError) -> Result<()> {
        if self.connected {
            self.source.disconnect().await;
            self.connected = false;
        }

        let policy = self.settings.reconnect.clone();
        let started = Instant::now();
        let mut last_error = cause;

        for attempt in 1..=policy.max_attempts {
            let delay = policy.backoff(attempt);
            if started.elapsed() + delay > policy.max_elapsed {
                debug!(source_id = %self.config.id, attempt, "Reconnect time budget exhausted");
                break;
            }

            tokio::time::sleep(delay).await;

            match self.connect_once().await {
                Ok(()) => {
                    self.reconnects += 1;
                    info!(
                        source_id = %self.config.id,
                        attempt,
                        "Source reconnected"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        source_id = %self.config.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = e;
                }
                Err(e) => return Err(self.terminal(e)),
            }
        }

        Err(StreamError::source_unavailable(
            self.config.id.as_str(),
            format!("reconnection exhausted: {last_error}"),
        ))
    }

    /// Map a non-retryable source error onto the adapter's error contract
    fn terminal(&self, error: StreamError) -> StreamError {
        match error {
            e @ (StreamError::SourceUnavailable { .. } | StreamError::InvalidConfig { .. }) => e,
            other => StreamError::source_unavailable(self.config.id.as_str(), other.to_string()),
        }
    }

    fn sequence(&mut self, raw: RawFrame) -> Frame {
        let mut timestamp = raw.timestamp + self.timestamp_offset;

        // Source clocks restart on reconnect; keep delivered timestamps monotonic
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                let rebased = last + self.config.frame_interval();
                self.timestamp_offset = rebased.saturating_sub(raw.timestamp);
                timestamp = rebased;
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_timestamp = Some(timestamp);

        trace!(source_id = %self.config.id, sequence, ?timestamp, size = raw.data.len(), "Frame");

        Frame::new(self.config.id.clone(), sequence, timestamp, raw.data)
    }
}

impl fmt::Debug for FrameSourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSourceAdapter")
            .field("source_id", &self.config.id)
            .field("next_sequence", &self.next_sequence)
            .field("reconnects", &self.reconnects)
            .field("connected", &self.connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::test_utils::{ScriptedSource, SourceTally, test_source};

    fn settings() -> AdapterConfig {
        AdapterConfig::default()
            .read_timeout(Duration::from_millis(500))
            .open_timeout(Duration::from_millis(500))
            .reconnect(
                ReconnectPolicy::default()
                    .max_attempts(3)
                    .initial_backoff(Duration::from_millis(10))
                    .max_backoff(Duration::from_millis(40)),
            )
    }

    async fn open(source: ScriptedSource) -> Result<FrameSourceAdapter> {
        FrameSourceAdapter::open(Arc::new(test_source("cam1", 30.0)), Box::new(source), settings())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn sequences_start_at_zero_and_increase() {
        let tally = SourceTally::default();
        let mut adapter = open(ScriptedSource::new(30.0, tally.clone())).await.unwrap();

        let mut last = None;
        for expected in 0..10u64 {
            let frame = adapter.next_frame().await.unwrap();
            assert_eq!(frame.sequence, expected);
            if let Some(prev) = last {
                assert!(frame.timestamp > prev);
            }
            last = Some(frame.timestamp);
        }

        assert_eq!(adapter.frames_produced(), 10);
        adapter.close().await;
        assert_eq!(tally.connects(), 1);
        assert_eq!(tally.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_disconnect_is_retried_transparently() {
        let tally = SourceTally::default();
        let source = ScriptedSource::new(30.0, tally.clone()).disconnect_after(3);
        let mut adapter = open(source).await.unwrap();

        let mut frames = Vec::new();
        for _ in 0..6 {
            frames.push(adapter.next_frame().await.unwrap());
        }

        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
        assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(adapter.reconnects(), 1);
        assert_eq!(tally.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnection_is_unavailable() {
        let tally = SourceTally::default();
        let source =
            ScriptedSource::new(30.0, tally.clone()).disconnect_after(2).fail_reconnects(u32::MAX);
        let mut adapter = open(source).await.unwrap();

        adapter.next_frame().await.unwrap();
        adapter.next_frame().await.unwrap();
        let err = adapter.next_frame().await.unwrap_err();

        assert!(matches!(err, StreamError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("reconnection exhausted"));
        // Initial connect plus three attempts
        assert_eq!(tally.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_read_times_out_and_reconnects() {
        let tally = SourceTally::default();
        let source = ScriptedSource::new(30.0, tally.clone()).stall_after(1);
        let mut adapter = open(source).await.unwrap();

        assert_eq!(adapter.next_frame().await.unwrap().sequence, 0);
        // The stalled read hits read_timeout, the adapter reconnects and reads on
        assert_eq!(adapter.next_frame().await.unwrap().sequence, 1);
        assert_eq!(adapter.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_unavailable() {
        let tally = SourceTally::default();
        let source = ScriptedSource::new(30.0, tally.clone()).fail_connects(u32::MAX);
        let err = open(source).await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable { .. }));
        assert_eq!(tally.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_open_recovers() {
        let tally = SourceTally::default();
        let source = ScriptedSource::new(30.0, tally.clone()).fail_connects(2);
        let mut adapter = open(source).await.unwrap();
        assert_eq!(adapter.next_frame().await.unwrap().sequence, 0);
        assert_eq!(tally.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn invalid_record_rejected_before_connecting() {
        let tally = SourceTally::default();
        let config = Arc::new(SourceConfig::new("cam", SourceKind::Camera, 30.0));
        let err = FrameSourceAdapter::open(
            config,
            Box::new(ScriptedSource::new(30.0, tally.clone())),
            settings(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig { .. }));
        assert_eq!(tally.connect_attempts(), 0);
    }

    #[test]
    fn table_rejects_unregistered_kinds() {
        let table = AdapterTable::with_builtin();
        assert!(table.supports(SourceKind::TestPattern));
        assert!(!table.supports(SourceKind::Camera));

        let camera = SourceConfig::new("cam", SourceKind::Camera, 30.0).with_connection(
            crate::types::ConnectionDetails {
                address: Some("10.0.0.1".into()),
                user: Some("u".into()),
                password: Some("p".into()),
                ..Default::default()
            },
        );
        let err = table.create(&camera).err().unwrap();
        assert!(matches!(err, StreamError::InvalidConfig { .. }));

        let mut table = table;
        table.register(SourceKind::Camera, |config| {
            Ok(Box::new(TestPatternSource::from_config(config)) as Box<dyn FrameSource>)
        });
        assert!(table.create(&camera).is_ok());
    }
}
