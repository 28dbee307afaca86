//! Session lifecycle states and delivery counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Lifecycle of one viewer session
///
/// ```text
/// Idle -> Starting -> Active -> Stopping -> Terminated
///            |          |                     ^
///            +----------+---------------------+
/// ```
///
/// `Starting -> Terminated` covers a start that failed after the source was
/// found; `Active -> Terminated` covers disconnects and lost sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Terminated,
}

impl SessionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Active)
                | (Starting, Terminated)
                | (Active, Stopping)
                | (Active, Terminated)
                | (Stopping, Terminated)
        )
    }

    /// Starting or Active
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }

    pub fn is_terminated(self) -> bool {
        self == SessionState::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Move `state` from `from` to `to`
///
/// Fails (returning false) unless the session is currently in `from`; of two
/// actors racing to end a session, exactly one wins.
pub(crate) fn transition(
    state: &watch::Sender<SessionState>,
    from: SessionState,
    to: SessionState,
) -> bool {
    debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");
    state.send_if_modified(|current| {
        if *current == from && current.can_transition_to(to) {
            *current = to;
            true
        } else {
            false
        }
    })
}

const NO_SEQUENCE: u64 = u64::MAX;

/// Delivery counters for one session, updated by its delivery task
#[derive(Debug)]
pub struct SessionStats {
    delivered: AtomicU64,
    decimated: AtomicU64,
    lagged: AtomicU64,
    last_sequence: AtomicU64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            decimated: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
            last_sequence: AtomicU64::new(NO_SEQUENCE),
        }
    }
}

impl SessionStats {
    /// Frames handed to the transport
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames skipped by rate control
    pub fn decimated(&self) -> u64 {
        self.decimated.load(Ordering::Relaxed)
    }

    /// Frames lost on the bus because the session fell behind
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    /// Sequence number of the last delivered frame
    pub fn last_sequence(&self) -> Option<u64> {
        match self.last_sequence.load(Ordering::Relaxed) {
            NO_SEQUENCE => None,
            sequence => Some(sequence),
        }
    }

    pub(crate) fn record_delivery(&self, sequence: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.last_sequence.store(sequence, Ordering::Relaxed);
    }

    pub(crate) fn record_drops(&self, decimated: u64, lagged: u64) {
        self.decimated.store(decimated, Ordering::Relaxed);
        self.lagged.store(lagged, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [SessionState; 5] = [
        SessionState::Idle,
        SessionState::Starting,
        SessionState::Active,
        SessionState::Stopping,
        SessionState::Terminated,
    ];

    #[test]
    fn terminated_is_absorbing() {
        for next in ALL {
            assert!(!SessionState::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn transition_requires_expected_state() {
        let (tx, rx) = watch::channel(SessionState::Idle);
        assert!(transition(&tx, SessionState::Idle, SessionState::Starting));
        assert!(transition(&tx, SessionState::Starting, SessionState::Active));

        // Two actors racing to end the session: only the first succeeds
        assert!(transition(&tx, SessionState::Active, SessionState::Terminated));
        assert!(!transition(&tx, SessionState::Active, SessionState::Stopping));
        assert_eq!(*rx.borrow(), SessionState::Terminated);
    }

    #[test]
    fn stats_track_last_sequence() {
        let stats = SessionStats::default();
        assert_eq!(stats.last_sequence(), None);
        stats.record_delivery(4);
        stats.record_delivery(10);
        stats.record_drops(7, 2);
        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.last_sequence(), Some(10));
        assert_eq!(stats.decimated(), 7);
        assert_eq!(stats.lagged(), 2);
    }

    fn any_state() -> impl Strategy<Value = SessionState> {
        proptest::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn accepted_transitions_are_monotonic(
            attempts in proptest::collection::vec(any_state(), 0..32),
        ) {
            let mut state = SessionState::Idle;
            for next in attempts {
                if state.can_transition_to(next) {
                    prop_assert!(next > state);
                    state = next;
                }
            }
        }
    }
}
