//! Abstract member-link transport.
//!
//! The group never talks to sockets directly. Each member wraps one
//! underlying link that already provides reliable, ordered, time-synchronized
//! delivery; the group drives it through this trait. Links own their own
//! locking — the group must not hold its own lock across any call here that
//! may block.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::msg::MsgControl;
use crate::options::ConfigItem;
use crate::seq::SeqNo;

/// Identifier of an underlying link socket.
pub type LinkId = i32;

/// Lifecycle state of an underlying link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Handshake still in progress.
    Connecting,
    Connected,
    Broken,
    Closed,
}

impl LinkStatus {
    /// True once the link can no longer carry traffic.
    pub fn is_dead(self) -> bool {
        matches!(self, LinkStatus::Broken | LinkStatus::Closed)
    }
}

/// Errors reported by a single link operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link send would block")]
    WouldBlock,

    #[error("link is broken")]
    Broken,

    #[error("link is closed")]
    Closed,

    #[error("option rejected by link")]
    InvalidOption,
}

impl LinkError {
    /// A fatal error removes the member from the group on the next wipe.
    pub fn is_fatal(self) -> bool {
        matches!(self, LinkError::Broken | LinkError::Closed)
    }
}

/// One member link, as seen by the group.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    fn status(&self) -> LinkStatus;

    /// Transmit one message under the shared sequence in `ctrl`.
    ///
    /// Returns the number of payload bytes accepted. `WouldBlock` leaves the
    /// member Running but contributes nothing to the group result.
    fn send(&self, ctrl: &MsgControl, data: &[u8]) -> Result<usize, LinkError>;

    /// Force the link's next scheduled sequence number.
    ///
    /// Used when a freshly activated backup link must replay buffered
    /// messages under their originally assigned numbers.
    fn override_next_seq(&self, seq: SeqNo);

    /// Time since the last response (ACK or equivalent) from the peer.
    fn time_since_last_response(&self) -> Duration;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Apply one deferred group option to this link.
    fn apply_option(&self, item: &ConfigItem) -> Result<(), LinkError>;
}
