//! Group traffic counters.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Snapshot of the group counters, taken under the group lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Messages accepted from the application.
    pub sent: u64,
    pub sent_bytes: u64,
    /// Messages delivered to the application.
    pub recv: u64,
    pub recv_bytes: u64,
    /// Slots declared lost before the merge could fill them.
    pub recv_drop: u64,
    pub recv_drop_bytes: u64,
    /// Arrivals discarded as already delivered.
    pub recv_discard: u64,
    /// Time since the first data packet crossed the group, if any.
    pub uptime: Option<Duration>,
    /// Time covered by this sample, since the last clearing snapshot.
    pub window: Duration,
}

/// Mutable counter state; lives inside the group core.
#[derive(Debug)]
pub(crate) struct StatsCounters {
    activate_time: Option<Instant>,
    last_sample: Instant,
    sent: u64,
    sent_bytes: u64,
    recv: u64,
    recv_bytes: u64,
    recv_drop: u64,
    recv_drop_bytes: u64,
    recv_discard: u64,
}

impl StatsCounters {
    pub fn new() -> StatsCounters {
        StatsCounters {
            activate_time: None,
            last_sample: Instant::now(),
            sent: 0,
            sent_bytes: 0,
            recv: 0,
            recv_bytes: 0,
            recv_drop: 0,
            recv_drop_bytes: 0,
            recv_discard: 0,
        }
    }

    fn touch_activate(&mut self) {
        if self.activate_time.is_none() {
            self.activate_time = Some(Instant::now());
        }
    }

    pub fn on_sent(&mut self, bytes: usize) {
        self.touch_activate();
        self.sent += 1;
        self.sent_bytes += bytes as u64;
    }

    pub fn on_recv(&mut self, bytes: usize) {
        self.touch_activate();
        self.recv += 1;
        self.recv_bytes += bytes as u64;
    }

    pub fn on_drop(&mut self, slots: u64, est_bytes: usize) {
        self.recv_drop += slots;
        self.recv_drop_bytes += slots * est_bytes as u64;
    }

    pub fn on_discard(&mut self) {
        self.recv_discard += 1;
    }

    pub fn snapshot(&mut self, clear: bool) -> GroupStats {
        let snap = GroupStats {
            sent: self.sent,
            sent_bytes: self.sent_bytes,
            recv: self.recv,
            recv_bytes: self.recv_bytes,
            recv_drop: self.recv_drop,
            recv_drop_bytes: self.recv_drop_bytes,
            recv_discard: self.recv_discard,
            uptime: self.activate_time.map(|t| t.elapsed()),
            window: self.last_sample.elapsed(),
        };
        if clear {
            self.sent = 0;
            self.sent_bytes = 0;
            self.recv = 0;
            self.recv_bytes = 0;
            self.recv_drop = 0;
            self.recv_drop_bytes = 0;
            self.recv_discard = 0;
            self.last_sample = Instant::now();
        }
        snap
    }
}
