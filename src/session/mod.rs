//! Session manager: lifecycle and rate control for every viewer.
//!
//! A viewer holds at most one session. Starting a different source stops the
//! current session first; starting the same source again returns the session
//! already running, unless its feed has already closed.
//!
//! Each active session owns a delivery task that reads the source's
//! [`Subscription`], drops frames above the requested rate and pushes the rest
//! through the [`Transport`]. A slow viewer only ever delays its own task.
//!
//! Every way a session ends is visible to the viewer: a `Stopped` status for an
//! explicit stop, an error for a lost source. A disconnected viewer has
//! nobody left to tell.

mod state;
mod task;

pub use state::{SessionState, SessionStats};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{FrameBus, Subscription};
use crate::config::SessionConfig;
use crate::stream::DecimateExt;
use crate::transport::{StatusEvent, Transport, ViewerCommand};
use crate::types::{SessionId, SourceId, UpdateRate, ViewerId};
use crate::{Result, StreamError};
use state::transition;
use task::DeliveryTask;

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub viewer_id: ViewerId,
    pub source_id: SourceId,
    /// Rate the viewer asked for
    pub requested_rate: UpdateRate,
    /// Rate actually applied, after normalizing against the source
    pub rate: UpdateRate,
    pub state: SessionState,
    pub delivered: u64,
    pub decimated: u64,
    pub lagged: u64,
    pub last_sequence: Option<u64>,
}

struct Session {
    id: SessionId,
    viewer_id: ViewerId,
    source_id: SourceId,
    /// Bus feed the session was subscribed to
    feed_id: u64,
    requested_rate: UpdateRate,
    rate: UpdateRate,
    state: Arc<watch::Sender<SessionState>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Option<Subscription>>>,
}

impl Session {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            viewer_id: self.viewer_id.clone(),
            source_id: self.source_id.clone(),
            requested_rate: self.requested_rate,
            rate: self.rate,
            state: self.state(),
            delivered: self.stats.delivered(),
            decimated: self.stats.decimated(),
            lagged: self.stats.lagged(),
            last_sequence: self.stats.last_sequence(),
        }
    }
}

/// A viewer's session, plus a token cancelled once the viewer is gone
///
/// The token lives outside the lock so a disconnect can abort a start that
/// is still waiting on a slow source.
#[derive(Default)]
struct ViewerSlot {
    session: tokio::sync::Mutex<Option<Session>>,
    gone: CancellationToken,
}

struct ManagerInner {
    bus: FrameBus,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    viewers: Mutex<HashMap<ViewerId, Arc<ViewerSlot>>>,
    next_session_id: AtomicU64,
}

/// Orchestrates viewer sessions over a shared [`FrameBus`]
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(bus: FrameBus, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let inner = ManagerInner {
            bus,
            transport,
            config,
            viewers: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Frame bus sessions subscribe through
    pub fn bus(&self) -> &FrameBus {
        &self.inner.bus
    }

    /// Start streaming `source_id` to `viewer_id` at `rate`
    ///
    /// # Errors
    ///
    /// - `InvalidRate` for a zero rate
    /// - `SourceNotFound` for an unknown source; the viewer's current session is kept
    /// - `InvalidConfig` or `SourceUnavailable` if the source cannot be opened
    /// - `TransportClosed` if the viewer cannot be told the session started, or
    ///   disconnects before the source opens
    pub async fn start(
        &self,
        viewer_id: &ViewerId,
        source_id: &SourceId,
        rate: UpdateRate,
    ) -> Result<SessionInfo> {
        let inner = &self.inner;
        if let UpdateRate::Max(requested) = rate {
            if !rate.is_valid() {
                return Err(StreamError::InvalidRate { requested });
            }
        }

        let gone = || StreamError::transport_closed(viewer_id.as_str());
        let slot = inner.slot(viewer_id);
        let mut current = tokio::select! {
            biased;
            _ = slot.gone.cancelled() => return Err(gone()),
            current = slot.session.lock() => current,
        };
        if current.as_ref().is_some_and(|session| session.state().is_terminated()) {
            *current = None;
        }

        let running = current
            .as_ref()
            .filter(|session| &session.source_id == source_id && session.state().is_live());
        if let Some(session) = running {
            if inner.bus.is_feed_active(source_id, session.feed_id).await {
                debug!(session_id = %session.id, %viewer_id, %source_id, "Session already running");
                return Ok(session.info());
            }
            // The feed closed under the session before it noticed
            info!(session_id = %session.id, %viewer_id, %source_id, "Restarting on a closed feed");
            if let Some(stale) = current.take() {
                inner.terminate_session(stale).await;
            }
        }

        // Unknown sources are rejected before anything changes
        inner.bus.registry().lookup(source_id).await?;

        if let Some(previous) = current.take() {
            info!(session_id = %previous.id, %viewer_id, "Superseding session");
            if let Err(e) = inner.stop_session(previous).await {
                debug!(%viewer_id, error = %e, "Superseded session already ended");
            }
        }

        let session_id = SessionId(inner.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (state, _) = watch::channel(SessionState::Idle);
        let state = Arc::new(state);
        transition(&state, SessionState::Idle, SessionState::Starting);

        let subscribed = tokio::select! {
            biased;
            _ = slot.gone.cancelled() => Err(gone()),
            subscribed = inner.bus.subscribe(source_id) => subscribed,
        };
        let subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                transition(&state, SessionState::Starting, SessionState::Terminated);
                warn!(%session_id, %viewer_id, %source_id, error = %e, "Session failed to start");
                return Err(e);
            }
        };

        let feed_id = subscription.feed_id();
        let source_hz = subscription.source().frame_rate;
        let effective = rate.normalize(source_hz);
        let started = StatusEvent::Started {
            session_id,
            source_id: source_id.clone(),
            rate: effective,
        };

        let confirmed = tokio::select! {
            biased;
            _ = slot.gone.cancelled() => false,
            sent = inner.transport.send_status(viewer_id, started) => sent.is_ok(),
        };
        if !confirmed {
            transition(&state, SessionState::Starting, SessionState::Terminated);
            inner.bus.unsubscribe(subscription).await;
            warn!(%session_id, %viewer_id, "Viewer gone before session started");
            return Err(gone());
        }

        transition(&state, SessionState::Starting, SessionState::Active);

        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();
        let frames = subscription.decimate(rate.frame_interval(source_hz));
        let delivery = DeliveryTask {
            session_id,
            viewer_id: viewer_id.clone(),
            bus: inner.bus.clone(),
            transport: Arc::clone(&inner.transport),
            state: Arc::clone(&state),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(delivery.run(frames));

        let session = Session {
            id: session_id,
            viewer_id: viewer_id.clone(),
            source_id: source_id.clone(),
            feed_id,
            requested_rate: rate,
            rate: effective,
            state,
            stats,
            cancel,
            task: Some(task),
        };

        info!(%session_id, %viewer_id, %source_id, rate = %effective, "Session active");
        let info = session.info();
        *current = Some(session);
        Ok(info)
    }

    /// Stop the viewer's session on `source_id`
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the viewer has no active session on that source.
    pub async fn stop(&self, viewer_id: &ViewerId, source_id: &SourceId) -> Result<SessionInfo> {
        let inner = &self.inner;
        let not_found = || StreamError::session_not_found(viewer_id.as_str(), source_id.as_str());
        let slot = inner.existing_slot(viewer_id).ok_or_else(not_found)?;

        let result = {
            let mut current = slot.session.lock().await;
            let matches = current.as_ref().is_some_and(|session| {
                &session.source_id == source_id && session.state() == SessionState::Active
            });

            match current.take() {
                Some(session) if matches => inner.stop_session(session).await,
                other => {
                    *current = other.filter(|session| !session.state().is_terminated());
                    Err(not_found())
                }
            }
        };

        inner.prune(viewer_id, &slot);
        result
    }

    /// Force-terminate the viewer's session after its channel went away
    ///
    /// A start still opening its source is aborted first, so this completes
    /// within the cleanup timeout however slow the source is. Returns the
    /// terminated session, if there was an active one.
    pub async fn disconnect(&self, viewer_id: &ViewerId) -> Option<SessionInfo> {
        let inner = &self.inner;
        let slot = {
            let mut viewers = inner.viewers.lock().unwrap_or_else(|e| e.into_inner());
            viewers.remove(viewer_id)?
        };
        slot.gone.cancel();

        let session = slot.session.lock().await.take();
        match session {
            Some(session) => inner.terminate_session(session).await,
            None => None,
        }
    }

    /// Execute a viewer command, reporting failures back to the viewer
    pub async fn dispatch(&self, command: ViewerCommand) -> Result<()> {
        let result = match &command {
            ViewerCommand::Start { viewer_id, source_id, frame_rate } => {
                let rate = frame_rate
                    .map(UpdateRate::Max)
                    .unwrap_or_else(|| self.inner.config.default_update_rate());
                self.start(viewer_id, source_id, rate).await.map(drop)
            }
            ViewerCommand::Stop { viewer_id, source_id } => {
                self.stop(viewer_id, source_id).await.map(drop)
            }
            ViewerCommand::Disconnect { viewer_id } => {
                self.disconnect(viewer_id).await;
                Ok(())
            }
        };

        if let Err(e) = &result {
            let viewer_id = command.viewer_id();
            warn!(%viewer_id, error = %e, "Command failed");
            if !matches!(e, StreamError::TransportClosed { .. }) {
                let _ = self.inner.transport.send_error(viewer_id, e.kind()).await;
            }
        }
        result
    }

    /// Current session of a viewer
    pub async fn session(&self, viewer_id: &ViewerId) -> Option<SessionInfo> {
        let slot = self.inner.existing_slot(viewer_id)?;
        let current = slot.session.lock().await;
        current.as_ref().filter(|session| !session.state().is_terminated()).map(Session::info)
    }

    /// Watch a viewer's current session move through its states
    pub async fn watch_state(&self, viewer_id: &ViewerId) -> Option<watch::Receiver<SessionState>> {
        let slot = self.inner.existing_slot(viewer_id)?;
        let current = slot.session.lock().await;
        current.as_ref().map(|session| session.state.subscribe())
    }

    /// Number of sessions that have not terminated
    pub async fn session_count(&self) -> usize {
        let mut count = 0;
        for slot in self.inner.slots() {
            let current = slot.session.lock().await;
            if current.as_ref().is_some_and(|session| !session.state().is_terminated()) {
                count += 1;
            }
        }
        count
    }

    /// Terminate every session and close every feed
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ViewerSlot>> = {
            let mut viewers = self.inner.viewers.lock().unwrap_or_else(|e| e.into_inner());
            viewers.drain().map(|(_, slot)| slot).collect()
        };

        for slot in &slots {
            slot.gone.cancel();
        }

        let mut terminated = 0usize;
        for slot in slots {
            let session = slot.session.lock().await.take();
            if let Some(session) = session {
                if self.inner.terminate_session(session).await.is_some() {
                    terminated += 1;
                }
            }
        }

        self.inner.bus.shutdown().await;
        info!(sessions = terminated, "Session manager shut down");
    }
}

impl ManagerInner {
    fn slot(&self, viewer_id: &ViewerId) -> Arc<ViewerSlot> {
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(viewers.entry(viewer_id.clone()).or_default())
    }

    fn existing_slot(&self, viewer_id: &ViewerId) -> Option<Arc<ViewerSlot>> {
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers.get(viewer_id).cloned()
    }

    fn slots(&self) -> Vec<Arc<ViewerSlot>> {
        let viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        viewers.values().cloned().collect()
    }

    /// Forget an empty slot nobody else is holding
    fn prune(&self, viewer_id: &ViewerId, slot: &Arc<ViewerSlot>) {
        let mut viewers = self.viewers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(current) = viewers.get(viewer_id) else {
            return;
        };

        let unused = Arc::ptr_eq(current, slot)
            && Arc::strong_count(slot) == 2
            && slot.session.try_lock().is_ok_and(|session| session.is_none());
        if unused {
            viewers.remove(viewer_id);
        }
    }

    /// Active -> Stopping -> Terminated, acknowledged with a `Stopped` status
    async fn stop_session(&self, mut session: Session) -> Result<SessionInfo> {
        if !transition(&session.state, SessionState::Active, SessionState::Stopping) {
            return Err(StreamError::session_not_found(
                session.viewer_id.as_str(),
                session.source_id.as_str(),
            ));
        }

        self.wind_down(&mut session).await;
        transition(&session.state, SessionState::Stopping, SessionState::Terminated);

        let stopped =
            StatusEvent::Stopped { session_id: session.id, source_id: session.source_id.clone() };
        if let Err(e) = self.transport.send_status(&session.viewer_id, stopped).await {
            debug!(session_id = %session.id, error = %e, "Could not acknowledge stop");
        }

        info!(session_id = %session.id, viewer_id = %session.viewer_id, "Session stopped");
        Ok(session.info())
    }

    /// Active -> Terminated without ceremony
    async fn terminate_session(&self, mut session: Session) -> Option<SessionInfo> {
        if !transition(&session.state, SessionState::Active, SessionState::Terminated) {
            return None;
        }

        self.wind_down(&mut session).await;
        info!(session_id = %session.id, viewer_id = %session.viewer_id, "Session terminated");
        Some(session.info())
    }

    /// Stop the delivery task and release its subscription, within the cleanup bound
    async fn wind_down(&self, session: &mut Session) {
        session.cancel.cancel();
        let Some(mut task) = session.task.take() else {
            return;
        };

        let deadline = Instant::now() + self.config.cleanup_timeout;
        let subscription = match timeout(self.config.cleanup_timeout, &mut task).await {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                warn!(session_id = %session.id, error = %e, "Delivery task failed");
                None
            }
            Err(_) => {
                // Dropping the aborted task's subscription releases it in the background
                warn!(session_id = %session.id, "Delivery task did not stop in time, aborting");
                task.abort();
                None
            }
        };

        if let Some(subscription) = subscription {
            self.release(session.id, subscription, deadline).await;
        }
    }

    /// Unsubscribe, giving up waiting at `deadline`
    ///
    /// The release runs on its own task, so it completes even when the wait
    /// is abandoned.
    async fn release(&self, session_id: SessionId, subscription: Subscription, deadline: Instant) {
        let bus = self.bus.clone();
        let release = tokio::spawn(async move { bus.unsubscribe(subscription).await });
        let remaining =
            deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));
        if timeout(remaining, release).await.is_err() {
            warn!(%session_id, "Subscription release still pending after cleanup timeout");
        }
    }
}
