//! Frame bus: one physical read per source, fanned out to every viewer.
//!
//! The bus opens a source's [`FrameSourceAdapter`] when the first subscriber
//! arrives, broadcasts its frames to all current subscribers, and closes it
//! when the last one leaves. A later subscriber reopens the source fresh, with
//! sequence numbers starting again at zero.
//!
//! A [`FrameProcessor`](crate::processor::FrameProcessor) registered for the
//! source's kind runs once per frame, before the broadcast.
//!
//! ## Concurrency
//!
//! Each source has its own slot. Opening or closing one source holds only
//! that slot's lock, so a slow camera never delays subscribers of another
//! source. The broadcast loop holds no lock at all: subscribers come and go
//! through the broadcast channel, which never blocks the sender.
//!
//! ## Example
//!
//! ```rust,no_run
//! use framecast::{AdapterTable, FrameBus, InMemoryRegistry, SourceConfig, SourceId, SourceKind};
//! use framecast::bus::FeedEvent;
//! use framecast::config::{AdapterConfig, BusConfig};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> framecast::Result<()> {
//! let registry = Arc::new(InMemoryRegistry::from_sources([SourceConfig::new(
//!     "cam1",
//!     SourceKind::TestPattern,
//!     30.0,
//! )]));
//! let bus = FrameBus::new(
//!     registry,
//!     AdapterTable::with_builtin(),
//!     BusConfig::default(),
//!     AdapterConfig::default(),
//! );
//!
//! let mut subscription = bus.subscribe(&SourceId::new("cam1")).await?;
//! if let Some(FeedEvent::Frame(frame)) = subscription.next().await {
//!     println!("frame {} ({} bytes)", frame.sequence, frame.len());
//! }
//! bus.unsubscribe(subscription).await;
//! # Ok(())
//! # }
//! ```

mod feed;
mod subscription;

pub use subscription::Subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterTable, FrameSourceAdapter};
use crate::config::{AdapterConfig, BusConfig, Config};
use crate::registry::SourceRegistry;
use crate::stream::Timestamped;
use crate::types::{Frame, SourceId};
use crate::{ErrorKind, Result};
use feed::ActiveFeed;

/// Event delivered to subscribers of a source
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Next frame from the source
    Frame(Frame),
    /// The source was lost and the feed torn down; nothing follows
    Closed(ErrorKind),
}

impl Timestamped for FeedEvent {
    fn timestamp(&self) -> Option<Duration> {
        match self {
            FeedEvent::Frame(frame) => Some(frame.timestamp),
            FeedEvent::Closed(_) => None,
        }
    }
}

type FeedSlot = tokio::sync::Mutex<Option<ActiveFeed>>;

pub(crate) struct BusInner {
    registry: Arc<dyn SourceRegistry>,
    adapters: AdapterTable,
    adapter_config: AdapterConfig,
    queue_capacity: usize,
    feeds: Mutex<HashMap<SourceId, Arc<FeedSlot>>>,
    next_feed_id: AtomicU64,
}

/// Per-source broadcaster shared by all sessions
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<BusInner>,
}

impl FrameBus {
    /// Create a bus resolving sources through `registry` and `adapters`
    pub fn new(
        registry: Arc<dyn SourceRegistry>,
        adapters: AdapterTable,
        config: BusConfig,
        adapter_config: AdapterConfig,
    ) -> Self {
        let inner = BusInner {
            registry,
            adapters,
            adapter_config,
            queue_capacity: config.queue_capacity.max(1),
            feeds: Mutex::new(HashMap::new()),
            next_feed_id: AtomicU64::new(1),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Create a bus from the service configuration
    pub fn from_config(
        registry: Arc<dyn SourceRegistry>,
        adapters: AdapterTable,
        config: &Config,
    ) -> Self {
        Self::new(registry, adapters, config.bus.clone(), config.adapter.clone())
    }

    /// Registry the bus resolves sources with
    pub fn registry(&self) -> &Arc<dyn SourceRegistry> {
        &self.inner.registry
    }

    /// Subscribe to a source, opening it if nobody is watching yet
    ///
    /// # Errors
    ///
    /// - `SourceNotFound` for an unknown id
    /// - `InvalidConfig` when the record cannot be served
    /// - `SourceUnavailable` when the source cannot be opened
    pub async fn subscribe(&self, source_id: &SourceId) -> Result<Subscription> {
        let inner = &self.inner;
        let source = inner.registry.lookup(source_id).await?;
        let slot = inner.slot(source_id);
        let mut feed = slot.lock().await;

        let active = match feed.take() {
            Some(active) if !active.is_dead() => feed.insert(active),
            previous => {
                if previous.is_some() {
                    debug!(%source_id, "Replacing dead feed");
                }

                let opened = match inner.adapters.create(&source) {
                    Ok(frame_source) => {
                        FrameSourceAdapter::open(
                            Arc::clone(&source),
                            frame_source,
                            inner.adapter_config.clone(),
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };

                let adapter = match opened {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        warn!(%source_id, error = %e, "Failed to open source");
                        drop(feed);
                        inner.prune(source_id, &slot);
                        return Err(e);
                    }
                };

                let feed_id = inner.next_feed_id.fetch_add(1, Ordering::Relaxed);
                info!(%source_id, feed_id, "Feed activated");
                let processor = inner.adapters.processor(source.kind);
                feed.insert(ActiveFeed::spawn(feed_id, adapter, processor, inner.queue_capacity))
            }
        };

        active.subscribers += 1;
        debug!(%source_id, subscribers = active.subscribers, "Subscribed");

        Ok(Subscription {
            source,
            feed_id: active.feed_id,
            stream: BroadcastStream::new(active.sender.subscribe()),
            dropped: 0,
            finished: false,
            released: false,
            bus: Arc::downgrade(inner),
        })
    }

    /// Release a subscription, closing the source if it was the last one
    ///
    /// Returns once the source is closed, so a following subscribe always
    /// opens it fresh.
    pub async fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.released = true;
        let source_id = subscription.source.id.clone();
        let feed_id = subscription.feed_id;
        drop(subscription);
        self.inner.release(&source_id, feed_id).await;
    }

    /// Number of subscribers on a source's current feed
    pub async fn subscriber_count(&self, source_id: &SourceId) -> usize {
        match self.inner.existing_slot(source_id) {
            Some(slot) => slot.lock().await.as_ref().map_or(0, |feed| feed.subscribers),
            None => 0,
        }
    }

    /// Whether the source is currently open and broadcasting
    pub async fn is_active(&self, source_id: &SourceId) -> bool {
        match self.inner.existing_slot(source_id) {
            Some(slot) => slot.lock().await.as_ref().is_some_and(|feed| !feed.is_dead()),
            None => false,
        }
    }

    /// Whether feed `feed_id` is still the source's current, open feed
    ///
    /// False once the source was lost, even before subscribers have seen the
    /// `Closed` event, and after the feed was replaced by a reopened one.
    pub async fn is_feed_active(&self, source_id: &SourceId, feed_id: u64) -> bool {
        match self.inner.existing_slot(source_id) {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|feed| feed.feed_id == feed_id && !feed.is_dead()),
            None => false,
        }
    }

    /// Sources currently open, sorted by id
    pub async fn active_sources(&self) -> Vec<SourceId> {
        let slots: Vec<(SourceId, Arc<FeedSlot>)> = {
            let feeds = self.inner.feeds.lock().unwrap_or_else(|e| e.into_inner());
            feeds.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect()
        };

        let mut active = Vec::new();
        for (source_id, slot) in slots {
            if slot.lock().await.as_ref().is_some_and(|feed| !feed.is_dead()) {
                active.push(source_id);
            }
        }
        active.sort();
        active
    }

    /// Close every feed
    ///
    /// Outstanding subscriptions end without a `Closed` event.
    pub async fn shutdown(&self) {
        let slots: Vec<(SourceId, Arc<FeedSlot>)> = {
            let mut feeds = self.inner.feeds.lock().unwrap_or_else(|e| e.into_inner());
            feeds.drain().collect()
        };

        for (source_id, slot) in slots {
            if let Some(feed) = slot.lock().await.take() {
                feed.cancel.cancel();
                let _ = feed.task.await;
                info!(%source_id, "Feed closed on shutdown");
            }
        }
    }
}

impl BusInner {
    fn slot(&self, source_id: &SourceId) -> Arc<FeedSlot> {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(feeds.entry(source_id.clone()).or_default())
    }

    fn existing_slot(&self, source_id: &SourceId) -> Option<Arc<FeedSlot>> {
        let feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        feeds.get(source_id).cloned()
    }

    /// Drop one subscriber from feed `feed_id`, closing it at zero
    pub(crate) async fn release(&self, source_id: &SourceId, feed_id: u64) {
        let Some(slot) = self.existing_slot(source_id) else {
            return;
        };

        {
            let mut feed = slot.lock().await;
            let Some(active) = feed.as_mut().filter(|active| active.feed_id == feed_id) else {
                // Feed already replaced or shut down
                return;
            };

            active.subscribers = active.subscribers.saturating_sub(1);
            debug!(%source_id, subscribers = active.subscribers, "Unsubscribed");

            if active.subscribers == 0 {
                if let Some(active) = feed.take() {
                    active.cancel.cancel();
                    let _ = active.task.await;
                    info!(%source_id, feed_id, "Feed deactivated");
                }
            }
        }

        self.prune(source_id, &slot);
    }

    /// Forget an empty slot nobody else is holding
    fn prune(&self, source_id: &SourceId, slot: &Arc<FeedSlot>) {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        let Some(current) = feeds.get(source_id) else {
            return;
        };

        // One reference in the map, one held by the caller
        let unused = Arc::ptr_eq(current, slot)
            && Arc::strong_count(slot) == 2
            && slot.try_lock().is_ok_and(|feed| feed.is_none());
        if unused {
            feeds.remove(source_id);
        }
    }
}
