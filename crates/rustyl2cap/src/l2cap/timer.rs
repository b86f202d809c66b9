//! Named protocol timers
//!
//! The state machine never sleeps. It asks a [`TimerService`] to arm a named
//! timer and expects [`L2capManager::timer_expired`](super::L2capManager::timer_expired)
//! to be called with the same id once it fires.

use super::types::{BdAddr, ChannelId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity of one protocol timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Per-channel state timer (connect, config, disconnect)
    Channel(ChannelId),
    /// Deferred acknowledgment
    Ack(ChannelId),
    /// ERTM monitor / retransmission timer
    MonitorRetrans(ChannelId),
    /// Link idle timer
    Link(BdAddr),
    /// Extended features Information Request
    Info(BdAddr),
}

/// Timer primitive consumed by the L2CAP core
pub trait TimerService {
    /// Arm `id` to fire after `timeout`, replacing any running instance
    fn start(&mut self, id: TimerId, timeout: Duration);

    /// Disarm `id`; stopping an idle timer is a no-op
    fn stop(&mut self, id: TimerId);

    fn is_running(&self, id: TimerId) -> bool;
}

/// Deadline-ordered in-memory timer set.
///
/// The owner polls it from its event loop and feeds expired ids back into
/// the manager.
#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: HashMap<TimerId, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimerId> {
        let mut expired: Vec<(Instant, TimerId)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        expired.sort_by_key(|(deadline, _)| *deadline);

        for (_, id) in &expired {
            self.deadlines.remove(id);
        }
        expired.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest pending deadline, for sizing the event loop's sleep
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl TimerService for TimerQueue {
    fn start(&mut self, id: TimerId, timeout: Duration) {
        self.deadlines.insert(id, Instant::now() + timeout);
    }

    fn stop(&mut self, id: TimerId) {
        self.deadlines.remove(&id);
    }

    fn is_running(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }
}
