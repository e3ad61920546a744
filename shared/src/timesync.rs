//! Controller-side clock synchronization against the host
//!
//! Controllers periodically send `PING {id, timestamp}` and the host
//! answers `PONG {id, origTimestamp, serverTime}`. From one round trip:
//!
//! ```text
//! rtt    = t1 - t0                       (t0 = origTimestamp, t1 = now)
//! offset = (serverTime + rtt / 2) - t1
//! ```
//!
//! The estimated server clock is then `now + offset`. The estimator keeps
//! a bounded queue of outstanding pings so a host that stops answering
//! cannot grow memory without limit.

use std::collections::VecDeque;

use crate::MAX_PENDING_PINGS;

/// Rolling clock-offset estimator fed by PING/PONG round trips.
///
/// All timestamps are milliseconds. Floats are used throughout because
/// browser controllers produce fractional `performance.now()`-style
/// values.
#[derive(Debug)]
pub struct TimeSync {
    /// Outstanding pings as (id, send time), oldest first.
    pending: VecDeque<(String, f64)>,
    /// Latest offset estimate, if any round trip completed yet.
    offset_ms: Option<f64>,
    max_pending: usize,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(MAX_PENDING_PINGS)
    }
}

impl TimeSync {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            offset_ms: None,
            max_pending,
        }
    }

    /// Records an outgoing ping. When the pending queue is full the
    /// oldest entry is dropped; its PONG will be ignored if it ever
    /// arrives.
    pub fn record_ping(&mut self, id: &str, sent_at_ms: f64) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back((id.to_string(), sent_at_ms));
    }

    /// Feeds a PONG back into the estimator. Returns the new offset when
    /// the PONG matched an outstanding ping, `None` for unknown or
    /// already-evicted IDs.
    pub fn handle_pong(&mut self, id: &str, server_time_ms: f64, now_ms: f64) -> Option<f64> {
        let index = self.pending.iter().position(|(p, _)| p == id)?;
        let (_, t0) = self.pending.remove(index)?;
        let rtt = now_ms - t0;
        let offset = (server_time_ms + rtt / 2.0) - now_ms;
        self.offset_ms = Some(offset);
        Some(offset)
    }

    /// Latest offset estimate in milliseconds, if any.
    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    /// The controller's best estimate of the host clock for a given local
    /// time. Falls back to the local clock before the first round trip.
    pub fn server_time(&self, now_ms: f64) -> f64 {
        now_ms + self.offset_ms.unwrap_or(0.0)
    }

    /// Number of pings still awaiting a PONG.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
