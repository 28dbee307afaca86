//! Core types shared by every layer of the streaming pipeline.
//!
//! ## Architecture
//!
//! - [`SourceConfig`] is the immutable record the registry hands out for a source
//! - [`RawFrame`] is what a frame source produces; the adapter turns it into a sequenced [`Frame`]
//! - [`Frame`] is broadcast to every session watching a source, sharing one payload allocation
//! - [`UpdateRate`] is the per-session delivery rate, normalized against the source rate
//!
//! ## Usage Example
//!
//! ```rust
//! use framecast::types::{Frame, SourceConfig, SourceId, SourceKind, UpdateRate};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let source = SourceConfig::new("cam1", SourceKind::TestPattern, 30.0);
//! assert!(source.validate().is_ok());
//!
//! let frame = Frame::new(SourceId::new("cam1"), 0, Duration::ZERO, Bytes::from_static(b"jpeg"));
//! let shared = frame.clone(); // payload is reference counted, not copied
//! assert_eq!(shared.data.as_ptr(), frame.data.as_ptr());
//!
//! // 5fps on a 30fps source keeps one frame in six
//! let interval = UpdateRate::Max(5).frame_interval(source.frame_rate);
//! assert_eq!(interval, Some(Duration::from_millis(200)));
//! ```

mod frame;
mod ids;
mod source;
mod update_rate;

pub use frame::{Frame, RawFrame};
pub use ids::{SessionId, SourceId, ViewerId};
pub use source::{
    ConnectionDetails, DEFAULT_RTSP_STREAM_PATH, MIN_FRAME_RATE, SourceConfig, SourceKind,
};
pub use update_rate::UpdateRate;
