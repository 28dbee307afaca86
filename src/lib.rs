//! Live video streaming sessions over shared camera feeds.
//!
//! Framecast reads frames from cameras, image directories and synthetic
//! patterns, and streams them to many concurrent viewers, each at its own
//! frame rate. A source is read once no matter how many viewers watch it.
//!
//! # Architecture
//!
//! - [`FrameSourceAdapter`] turns a [`FrameSource`] into a sequenced stream of
//!   [`Frame`]s, with read timeouts and bounded reconnection
//! - [`FrameBus`] opens a source for its first subscriber, fans frames out to
//!   every subscriber and closes the source after the last one leaves
//! - [`FrameProcessor`] is an optional hook run once over every frame of a
//!   source before it is fanned out
//! - [`SessionManager`] owns each viewer's session: start, stop, switch
//!   source, rate decimation and cleanup
//! - [`Transport`] is the boundary to the viewer's channel; [`ChannelTransport`]
//!   is the in-process implementation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use framecast::{
//!     AdapterTable, ChannelTransport, FrameBus, InMemoryRegistry, SessionManager, SourceConfig,
//!     SourceId, SourceKind, UpdateRate, ViewerId,
//! };
//! use framecast::config::Config;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> framecast::Result<()> {
//!     let config = Config::default();
//!     framecast::logging::init(&config.logging)?;
//!
//!     let registry = Arc::new(InMemoryRegistry::from_sources([SourceConfig::new(
//!         "cam1",
//!         SourceKind::TestPattern,
//!         30.0,
//!     )]));
//!     let bus = FrameBus::from_config(registry, AdapterTable::with_builtin(), &config);
//!
//!     let transport = Arc::new(ChannelTransport::default());
//!     let viewer = ViewerId::new("viewer-1");
//!     let mut outbound = transport.connect(viewer.clone());
//!
//!     let sessions = SessionManager::new(bus, transport.clone(), config.session.clone());
//!     sessions.start(&viewer, &SourceId::new("cam1"), UpdateRate::Max(5)).await?;
//!
//!     while let Some(message) = outbound.recv().await {
//!         println!("{message:?}");
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Configuration and logging
pub mod config;
pub mod logging;

// Frame sources
pub mod adapter;
pub mod processor;
pub mod provider;
pub mod providers;
pub mod registry;

// Distribution and delivery
pub mod bus;
pub mod session;
pub mod stream;
pub mod transport;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use adapter::{AdapterTable, FrameSourceAdapter};
pub use bus::{FeedEvent, FrameBus, Subscription};
pub use config::Config;
pub use processor::FrameProcessor;
pub use provider::FrameSource;
pub use providers::{DirectorySource, TestPatternSource};
pub use registry::{InMemoryRegistry, SourceRegistry};
pub use session::{SessionInfo, SessionManager, SessionState};
pub use transport::{ChannelTransport, Outbound, StatusEvent, Transport, ViewerCommand};
