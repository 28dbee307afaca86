//! Test utilities: scripted sources, a recording transport and registry helpers
//!
//! Shared by the unit tests and the benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapter::AdapterTable;
use crate::provider::FrameSource;
use crate::providers::{frame_period, nominal_timestamp};
use crate::registry::InMemoryRegistry;
use crate::transport::{Outbound, StatusEvent, Transport};
use crate::types::{Frame, RawFrame, SourceConfig, SourceId, SourceKind, ViewerId};
use crate::{ErrorKind, Result, StreamError};

/// A synthetic source record
pub fn test_source(id: &str, frame_rate: f64) -> SourceConfig {
    SourceConfig::new(id, SourceKind::TestPattern, frame_rate)
}

/// Registry holding one synthetic source per `(id, frame_rate)`
pub fn test_registry(sources: &[(&str, f64)]) -> Arc<InMemoryRegistry> {
    Arc::new(InMemoryRegistry::from_sources(
        sources.iter().map(|(id, rate)| test_source(id, *rate)),
    ))
}

#[derive(Debug, Default)]
struct TallyCounts {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    reads: AtomicU64,
}

/// Shared counters observing what a [`ScriptedSource`] was asked to do
#[derive(Debug, Clone, Default)]
pub struct SourceTally(Arc<TallyCounts>);

impl SourceTally {
    /// Connection attempts, successful or not
    pub fn connect_attempts(&self) -> u64 {
        self.0.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful connections
    pub fn connects(&self) -> u64 {
        self.0.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u64 {
        self.0.disconnects.load(Ordering::SeqCst)
    }

    /// Frames handed out
    pub fn reads(&self) -> u64 {
        self.0.reads.load(Ordering::SeqCst)
    }

    /// Connections currently held open
    pub fn open_connections(&self) -> u64 {
        self.connects().saturating_sub(self.disconnects())
    }
}

/// Failure script for a [`ScriptedSource`]
///
/// Frame counts are totals across reconnections.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Drop the feed once after this many frames
    pub disconnect_after: Option<u64>,
    /// Hang the read once after this many frames
    pub stall_after: Option<u64>,
    /// Fail permanently after this many frames
    pub unavailable_after: Option<u64>,
    /// Reject the first connection attempts
    pub fail_connects: u32,
    /// Reject connection attempts after the first success
    pub fail_reconnects: u32,
    /// Delay every connection attempt
    pub connect_delay: Duration,
}

/// Frame source following a [`Script`], reporting to a [`SourceTally`]
///
/// Emits frames at `frame_rate` on the tokio clock. Payloads are the frame's
/// overall index (big endian), timestamps restart at zero on every connect.
pub struct ScriptedSource {
    tally: SourceTally,
    script: Script,
    frame_rate: f64,
    emitted: u64,
    total: u64,
    has_connected: bool,
}

impl ScriptedSource {
    pub fn new(frame_rate: f64, tally: SourceTally) -> Self {
        Self::with_script(frame_rate, tally, Script::default())
    }

    pub fn with_script(frame_rate: f64, tally: SourceTally, script: Script) -> Self {
        Self { tally, script, frame_rate, emitted: 0, total: 0, has_connected: false }
    }

    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.script.disconnect_after = Some(frames);
        self
    }

    pub fn stall_after(mut self, frames: u64) -> Self {
        self.script.stall_after = Some(frames);
        self
    }

    pub fn unavailable_after(mut self, frames: u64) -> Self {
        self.script.unavailable_after = Some(frames);
        self
    }

    pub fn fail_connects(mut self, attempts: u32) -> Self {
        self.script.fail_connects = attempts;
        self
    }

    pub fn fail_reconnects(mut self, attempts: u32) -> Self {
        self.script.fail_reconnects = attempts;
        self
    }
}

#[async_trait::async_trait]
impl FrameSource for ScriptedSource {
    async fn connect(&mut self) -> Result<()> {
        self.tally.0.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.script.connect_delay.is_zero() {
            tokio::time::sleep(self.script.connect_delay).await;
        }

        if self.script.fail_connects > 0 {
            self.script.fail_connects -= 1;
            return Err(StreamError::disconnected("scripted", "connect refused"));
        }
        if self.has_connected && self.script.fail_reconnects > 0 {
            self.script.fail_reconnects -= 1;
            return Err(StreamError::disconnected("scripted", "reconnect refused"));
        }

        self.has_connected = true;
        self.emitted = 0;
        self.tally.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RawFrame> {
        if self.script.unavailable_after == Some(self.total) {
            return Err(StreamError::source_unavailable("scripted", "feed gone"));
        }
        if self.script.disconnect_after == Some(self.total) {
            self.script.disconnect_after = None;
            return Err(StreamError::disconnected("scripted", "feed dropped"));
        }
        if self.script.stall_after == Some(self.total) {
            self.script.stall_after = None;
            std::future::pending::<()>().await;
        }

        tokio::time::sleep(frame_period(self.frame_rate)).await;

        let timestamp = nominal_timestamp(self.emitted, self.frame_rate);
        let frame = RawFrame::new(self.total.to_be_bytes().to_vec(), timestamp);
        self.emitted += 1;
        self.total += 1;
        self.tally.0.reads.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    async fn disconnect(&mut self) {
        self.tally.0.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted sources keyed by source id, with an adapter table serving them
#[derive(Debug, Clone, Default)]
pub struct ScriptedSources {
    tallies: Arc<Mutex<HashMap<String, SourceTally>>>,
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl ScriptedSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tally for a source id, created on first use
    pub fn tally(&self, source_id: &str) -> SourceTally {
        let mut tallies = self.tallies.lock().unwrap_or_else(|e| e.into_inner());
        tallies.entry(source_id.to_string()).or_default().clone()
    }

    /// Script applied to sources opened from now on
    pub fn script(&self, source_id: &str, script: Script) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts.insert(source_id.to_string(), script);
    }

    /// Adapter table serving every test pattern record with a scripted source
    pub fn table(&self) -> AdapterTable {
        let sources = self.clone();
        let mut table = AdapterTable::new();
        table.register(SourceKind::TestPattern, move |config| {
            let scripts = sources.scripts.lock().unwrap_or_else(|e| e.into_inner());
            let script = scripts.get(config.id.as_str()).cloned().unwrap_or_default();
            drop(scripts);
            let tally = sources.tally(config.id.as_str());
            Ok(Box::new(ScriptedSource::with_script(config.frame_rate, tally, script))
                as Box<dyn FrameSource>)
        });
        table
    }
}

/// Transport recording everything sent to each viewer
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(ViewerId, Outbound)>>,
    closed: Mutex<Vec<ViewerId>>,
    frame_delay: Mutex<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later send to `viewer` fail
    pub fn close(&self, viewer: &ViewerId) {
        self.closed.lock().unwrap_or_else(|e| e.into_inner()).push(viewer.clone());
    }

    /// Hold every later frame for `delay` before recording it
    pub fn delay_frames(&self, delay: Duration) {
        *self.frame_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn messages(&self, viewer: &ViewerId) -> Vec<Outbound> {
        let sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.iter().filter(|(v, _)| v == viewer).map(|(_, message)| message.clone()).collect()
    }

    pub fn frames(&self, viewer: &ViewerId) -> Vec<Frame> {
        self.messages(viewer)
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, viewer: &ViewerId) -> Vec<ErrorKind> {
        self.messages(viewer)
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Error(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, viewer: &ViewerId) -> Vec<StatusEvent> {
        self.messages(viewer)
            .into_iter()
            .filter_map(|message| match message {
                Outbound::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, viewer: &ViewerId, message: Outbound) -> Result<()> {
        if self.closed.lock().unwrap_or_else(|e| e.into_inner()).contains(viewer) {
            return Err(StreamError::transport_closed(viewer.as_str()));
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((viewer.clone(), message));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, viewer: &ViewerId, frame: Frame) -> Result<()> {
        let delay = *self.frame_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.record(viewer, Outbound::Frame(frame))
    }

    async fn send_error(&self, viewer: &ViewerId, kind: ErrorKind) -> Result<()> {
        self.record(viewer, Outbound::Error(kind))
    }

    async fn send_status(&self, viewer: &ViewerId, status: StatusEvent) -> Result<()> {
        self.record(viewer, Outbound::Status(status))
    }
}

/// Source id shorthand
pub fn sid(id: &str) -> SourceId {
    SourceId::new(id)
}

/// Viewer id shorthand
pub fn vid(id: &str) -> ViewerId {
    ViewerId::new(id)
}
