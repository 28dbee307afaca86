//! Session lifecycle tests
//!
//! Exercise the public API end to end: configuration, registry, adapter
//! table, frame bus, session manager and the in-process channel transport.
//! Sources are test patterns wrapped in a counter so the tests can see how
//! often the physical source was opened and closed.
//!
//! Platform: Cross-platform, paused tokio clock

use framecast::config::Config;
use framecast::{
    AdapterTable, ChannelTransport, ErrorKind, Frame, FrameBus, FrameProcessor, FrameSource,
    InMemoryRegistry, Outbound, RawFrame, Result, SessionManager, SessionState, SourceConfig,
    SourceId, SourceKind, StatusEvent, StreamError, TestPatternSource, UpdateRate, ViewerCommand,
    ViewerId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const CONFIG: &str = r#"
session:
  cleanup_timeout_ms: 500
  default_rate: 10
sources:
  - id: cam1
    type: test_pattern
    frameRate: 30
  - id: cam2
    type: test_pattern
    frameRate: 10
  - id: door
    type: camera
    frameRate: 15
    connectionDetails:
      address: 10.0.0.5
      user: admin
      password: secret
"#;

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU64,
    closes: AtomicU64,
}

impl Counters {
    fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Test pattern counting connections, optionally vanishing for good
struct CountingSource {
    id: SourceId,
    inner: TestPatternSource,
    counters: Arc<Counters>,
    vanish_after: Option<u64>,
    read: u64,
}

#[async_trait::async_trait]
impl FrameSource for CountingSource {
    async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await?;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RawFrame> {
        if self.vanish_after == Some(self.read) {
            return Err(StreamError::source_unavailable(self.id.as_str(), "camera removed"));
        }
        let frame = self.inner.read_frame().await?;
        self.read += 1;
        Ok(frame)
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Marks every payload the way a detector would draw its boxes
#[derive(Default)]
struct Overlay {
    calls: AtomicU64,
}

#[async_trait::async_trait]
impl FrameProcessor for Overlay {
    async fn process(&self, _source: &SourceConfig, mut frame: Frame) -> Result<Frame> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut data = frame.data.to_vec();
        data.extend_from_slice(OVERLAY);
        frame.data = data.into();
        Ok(frame)
    }
}

const OVERLAY: &[u8] = b"|boxes";

struct Service {
    sessions: SessionManager,
    transport: Arc<ChannelTransport>,
    counters: Arc<Counters>,
}

fn service(vanish_after: Option<u64>) -> Service {
    service_with(vanish_after, None)
}

fn service_with(vanish_after: Option<u64>, overlay: Option<Arc<Overlay>>) -> Service {
    let _ = tracing_subscriber::fmt::try_init();
    let config = Config::from_yaml_str(CONFIG).unwrap();
    let registry = Arc::new(InMemoryRegistry::from_sources(config.sources.clone()));

    let counters = Arc::new(Counters::default());
    let mut adapters = AdapterTable::new();
    let shared = Arc::clone(&counters);
    adapters.register(SourceKind::TestPattern, move |source: &SourceConfig| {
        Ok(Box::new(CountingSource {
            id: source.id.clone(),
            inner: TestPatternSource::from_config(source),
            counters: Arc::clone(&shared),
            vanish_after,
            read: 0,
        }) as Box<dyn FrameSource>)
    });

    if let Some(overlay) = overlay {
        adapters.register_processor(SourceKind::TestPattern, overlay);
    }

    let bus = FrameBus::from_config(registry, adapters, &config);
    let transport = Arc::new(ChannelTransport::new(256));
    let sessions = SessionManager::new(bus, transport.clone(), config.session.clone());
    Service { sessions, transport, counters }
}

fn viewer(id: &str) -> ViewerId {
    ViewerId::new(id)
}

fn source(id: &str) -> SourceId {
    SourceId::new(id)
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn sequences(messages: &[Outbound]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|message| match message {
            Outbound::Frame(frame) => Some(frame.sequence),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn thirty_fps_source_delivered_at_five() {
    let svc = service(None);
    let mut rx = svc.transport.connect(viewer("v1"));

    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Max(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1990)).await;

    let messages = drain(&mut rx);
    assert!(matches!(messages.first(), Some(Outbound::Status(StatusEvent::Started { .. }))));

    let delivered = sequences(&messages);
    assert!((9..=11).contains(&delivered.len()), "delivered {delivered:?}");
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));
    // One frame in six
    assert!(delivered.iter().all(|seq| seq % 6 == 0), "delivered {delivered:?}");
}

#[tokio::test(start_paused = true)]
async fn missing_source_leaves_no_session() {
    let svc = service(None);
    let mut rx = svc.transport.connect(viewer("v1"));

    let missing = svc.sessions.start(&viewer("v1"), &source("missing"), UpdateRate::Max(5)).await;
    let err = missing.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceNotFound);
    assert!(svc.sessions.session(&viewer("v1")).await.is_none());

    let err = svc.sessions.stop(&viewer("v1"), &source("missing")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionNotFound);

    assert_eq!(svc.counters.opens(), 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn viewers_share_a_single_read() {
    let svc = service(None);
    let mut rx1 = svc.transport.connect(viewer("v1"));
    let mut rx2 = svc.transport.connect(viewer("v2"));

    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();
    svc.sessions.start(&viewer("v2"), &source("cam1"), UpdateRate::Max(10)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(svc.counters.opens(), 1);

    let all = drain(&mut rx1);
    let decimated = drain(&mut rx2);
    assert!(sequences(&decimated).len() < sequences(&all).len());
    for frame in decimated.iter().filter_map(|m| match m {
        Outbound::Frame(frame) => Some(frame),
        _ => None,
    }) {
        let same = all.iter().any(|m| matches!(m, Outbound::Frame(f) if f == frame));
        assert!(same, "frame {} not seen by the native viewer", frame.sequence);
    }

    svc.sessions.stop(&viewer("v1"), &source("cam1")).await.unwrap();
    assert_eq!(svc.counters.closes(), 0);
    svc.sessions.stop(&viewer("v2"), &source("cam1")).await.unwrap();
    assert_eq!(svc.counters.closes(), 1);
    assert!(!svc.sessions.bus().is_active(&source("cam1")).await);
}

#[tokio::test(start_paused = true)]
async fn second_source_ends_first_session_before_activating() {
    let svc = service(None);
    let mut rx = svc.transport.connect(viewer("v1"));

    let first =
        svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();
    let mut first_state = svc.sessions.watch_state(&viewer("v1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second =
        svc.sessions.start(&viewer("v1"), &source("cam2"), UpdateRate::Native).await.unwrap();
    assert_eq!(*first_state.borrow_and_update(), SessionState::Terminated);
    assert_eq!(second.state, SessionState::Active);

    let statuses: Vec<StatusEvent> = drain(&mut rx)
        .into_iter()
        .filter_map(|m| match m {
            Outbound::Status(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![
        StatusEvent::Started {
            session_id: first.id,
            source_id: source("cam1"),
            rate: UpdateRate::Native,
        },
        StatusEvent::Stopped { session_id: first.id, source_id: source("cam1") },
        StatusEvent::Started {
            session_id: second.id,
            source_id: source("cam2"),
            rate: UpdateRate::Native,
        },
    ]);
    assert!(!svc.sessions.bus().is_active(&source("cam1")).await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_within_cleanup_window() {
    let svc = service(None);
    let _rx = svc.transport.connect(viewer("v1"));
    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    svc.transport.disconnect(&viewer("v1"));
    let started = Instant::now();
    let info = svc.sessions.disconnect(&viewer("v1")).await.unwrap();

    assert!(started.elapsed() <= Duration::from_millis(500));
    assert_eq!(info.state, SessionState::Terminated);
    assert_eq!(svc.sessions.bus().subscriber_count(&source("cam1")).await, 0);
    assert_eq!(svc.counters.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_viewer_channel_ends_session() {
    let svc = service(None);
    let rx = svc.transport.connect(viewer("v1"));
    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();

    drop(rx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(svc.sessions.session(&viewer("v1")).await.is_none());
    assert!(!svc.sessions.bus().is_active(&source("cam1")).await);
    assert_eq!(svc.counters.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_source_reported_to_every_viewer() {
    let svc = service(Some(15));
    let mut rx1 = svc.transport.connect(viewer("v1"));
    let mut rx2 = svc.transport.connect(viewer("v2"));

    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();
    svc.sessions.start(&viewer("v2"), &source("cam1"), UpdateRate::Max(5)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    for (id, rx) in [("v1", &mut rx1), ("v2", &mut rx2)] {
        let messages = drain(rx);
        assert!(
            matches!(messages.last(), Some(Outbound::Error(ErrorKind::SourceUnavailable))),
            "{id} got {messages:?}"
        );
        assert!(svc.sessions.session(&viewer(id)).await.is_none());
    }

    assert_eq!(svc.counters.opens(), 1);
    assert_eq!(svc.counters.closes(), 1);
    assert!(svc.sessions.bus().active_sources().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsupported_source_kind_is_invalid_config() {
    let svc = service(None);
    let _rx = svc.transport.connect(viewer("v1"));

    let err =
        svc.sessions.start(&viewer("v1"), &source("door"), UpdateRate::Native).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert!(svc.sessions.session(&viewer("v1")).await.is_none());
    assert!(!svc.sessions.bus().is_active(&source("door")).await);
}

#[tokio::test(start_paused = true)]
async fn wire_commands_drive_sessions() {
    let svc = service(None);
    let mut rx = svc.transport.connect(viewer("sock-1"));

    let commands = [
        "event: startStream\ndata:\n  viewerId: sock-1\n  sourceId: cam2\n",
        "event: stopStream\ndata:\n  viewerId: sock-1\n  sourceId: cam1\n",
        "event: stopStream\ndata:\n  viewerId: sock-1\n  sourceId: cam2\n",
    ];
    let mut results = Vec::new();
    for yaml in commands {
        let command: ViewerCommand = serde_yaml_ng::from_str(yaml).unwrap();
        results.push(svc.sessions.dispatch(command).await.is_ok());
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert_eq!(results, vec![true, false, true]);

    let messages = drain(&mut rx);
    assert!(matches!(
        messages.first(),
        Some(Outbound::Status(StatusEvent::Started { rate: UpdateRate::Native, .. }))
    ));
    assert!(messages.contains(&Outbound::Error(ErrorKind::SessionNotFound)));
    assert!(matches!(messages.last(), Some(Outbound::Status(StatusEvent::Stopped { .. }))));
    assert!(!sequences(&messages).is_empty());
    assert_eq!(svc.counters.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn overlay_drawn_once_for_all_viewers() {
    let overlay = Arc::new(Overlay::default());
    let svc = service_with(None, Some(overlay.clone()));
    let mut rx1 = svc.transport.connect(viewer("v1"));
    let mut rx2 = svc.transport.connect(viewer("v2"));

    svc.sessions.start(&viewer("v1"), &source("cam1"), UpdateRate::Native).await.unwrap();
    svc.sessions.start(&viewer("v2"), &source("cam1"), UpdateRate::Max(5)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    svc.sessions.stop(&viewer("v1"), &source("cam1")).await.unwrap();
    svc.sessions.stop(&viewer("v2"), &source("cam1")).await.unwrap();

    let mut delivered = 0u64;
    let mut native = 0u64;
    for (rx, is_native) in [(&mut rx1, true), (&mut rx2, false)] {
        for message in drain(rx) {
            if let Outbound::Frame(frame) = message {
                assert!(frame.data.ends_with(OVERLAY));
                assert!(!frame.data[..frame.len() - OVERLAY.len()].ends_with(OVERLAY));
                delivered += 1;
                native += u64::from(is_native);
            }
        }
    }

    // Every frame was processed once, however many viewers received it
    let calls = overlay.calls.load(Ordering::SeqCst);
    assert!(native >= 25, "native viewer got {native} frames");
    assert!(calls >= native && calls < delivered, "{calls} calls for {delivered} deliveries");
}
