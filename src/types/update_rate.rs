//! Update rate control for viewer sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requested delivery rate for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRate {
    /// Every frame the source produces
    Native,

    /// At most this many frames per second
    /// If the requested rate reaches the source rate, Native is used
    Max(u32),
}

impl UpdateRate {
    /// Build a rate from a frames-per-second value as sent by viewers
    pub fn fps(fps: u32) -> Self {
        UpdateRate::Max(fps)
    }

    /// Whether the rate can be served at all
    pub fn is_valid(self) -> bool {
        !matches!(self, UpdateRate::Max(0))
    }

    /// Normalize rate against source frequency
    /// Returns effective rate to use
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Minimum spacing between delivered frames, if any
    pub fn frame_interval(self, source_hz: f64) -> Option<Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_nanos(1_000_000_000 / hz as u64)),
        }
    }

    /// Effective frames per second given the source frequency
    pub fn effective_hz(self, source_hz: f64) -> f64 {
        match self.normalize(source_hz) {
            UpdateRate::Native => source_hz,
            UpdateRate::Max(hz) => hz as f64,
        }
    }
}

impl std::fmt::Display for UpdateRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateRate::Native => f.write_str("native"),
            UpdateRate::Max(hz) => write!(f, "{hz}fps"),
        }
    }
}
