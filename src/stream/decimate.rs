//! Rate control by timestamp decimation

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::types::{Frame, UpdateRate};

/// Items carrying a capture timestamp
///
/// Items without one (end-of-feed notifications) always pass through.
pub trait Timestamped {
    fn timestamp(&self) -> Option<Duration>;
}

impl Timestamped for Frame {
    fn timestamp(&self) -> Option<Duration> {
        Some(self.timestamp)
    }
}

/// Admission decisions for one session's requested rate
///
/// A frame is admitted once its timestamp reaches the next due time, which
/// then becomes the admitted frame's timestamp plus one interval. Admitted
/// frames are therefore never closer than an interval, even when a frame is
/// admitted late in its window; under jitter the long-run rate may fall
/// slightly below the requested one. Frames are judged on capture time, not
/// arrival time, so the result is the same however bursty delivery is.
#[derive(Debug, Clone, Default)]
pub struct Pacer {
    interval: Option<Duration>,
    next_due: Option<Duration>,
}

impl Pacer {
    /// Admit frames no closer than `interval`; `None` admits everything
    pub fn new(interval: Option<Duration>) -> Self {
        Self { interval, next_due: None }
    }

    /// Pacer for `rate` against a source producing `source_hz`
    pub fn for_rate(rate: UpdateRate, source_hz: f64) -> Self {
        Self::new(rate.frame_interval(source_hz))
    }

    /// Minimum spacing between admitted frames
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Decide whether the frame captured at `timestamp` is delivered
    pub fn admit(&mut self, timestamp: Duration) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };

        if self.next_due.is_some_and(|due| timestamp < due) {
            return false;
        }
        self.next_due = Some(timestamp + interval);
        true
    }
}

/// Extension trait to add decimation to any timestamped stream
pub trait DecimateExt: Stream {
    /// Drop items arriving faster than `interval` apart (by timestamp)
    fn decimate(self, interval: Option<Duration>) -> Decimate<Self>
    where
        Self: Sized,
    {
        Decimate::new(self, Pacer::new(interval))
    }
}

impl<T: Stream> DecimateExt for T {}

pin_project! {
    /// A stream combinator enforcing a maximum delivery rate
    pub struct Decimate<S> {
        #[pin]
        stream: S,
        pacer: Pacer,
        skipped: u64,
    }
}

impl<S> Decimate<S> {
    /// Wrap `stream` with an explicit pacer
    pub fn new(stream: S, pacer: Pacer) -> Self {
        Self { stream, pacer, skipped: 0 }
    }

    /// Items dropped so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the combinator, returning the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Stream for Decimate<S>
where
    S: Stream,
    S::Item: Timestamped,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(item) => match item.timestamp() {
                    Some(ts) if !this.pacer.admit(ts) => *this.skipped += 1,
                    _ => return Poll::Ready(Some(item)),
                },
                None => return Poll::Ready(None),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.stream.size_hint().1)
    }
}
