//! Built-in frame sources

mod directory;
mod test_pattern;

pub use directory::{DirectorySource, IMAGE_EXTENSIONS};
pub use test_pattern::TestPatternSource;

use std::time::Duration;

/// Nominal capture time of the `index`-th frame of a source running at `frame_rate`
///
/// Computed in integer millihertz so whole and common fractional rates land
/// on exact nanoseconds (frame 6 at 30fps is exactly 200ms).
pub(crate) fn nominal_timestamp(index: u64, frame_rate: f64) -> Duration {
    let millihertz = (frame_rate * 1000.0).round().max(1.0) as u128;
    let nanos = index as u128 * 1_000_000_000_000 / millihertz;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Pacing period for a source running at `frame_rate`
pub(crate) fn frame_period(frame_rate: f64) -> Duration {
    nominal_timestamp(1, frame_rate)
}
