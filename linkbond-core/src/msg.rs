//! Message control metadata.
//!
//! Every message crossing the group boundary carries a control record: the
//! shared sequence and message numbers assigned by the group, the origin
//! timestamp used for time-stamp-based delivery, and (on the receive side)
//! the member link that provided the payload.

use crate::link::LinkId;
use crate::seq::{MsgNo, SeqNo};

/// Default live-mode payload size in bytes.
pub const LIVE_DEF_PAYLOAD_SIZE: usize = 1316;

/// Hard upper bound on a live-mode payload.
pub const LIVE_MAX_PAYLOAD_SIZE: usize = 1456;

/// Per-message metadata, filled by the group on send and on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgControl {
    /// Shared sequence number. Identical on every link carrying this message.
    pub seqno: SeqNo,
    /// Shared message number, used by the backup sender buffer and ACKs.
    pub msgno: MsgNo,
    /// Origin timestamp in microseconds since the group start time.
    pub src_time_us: u64,
    /// On delivery: the member link the payload was extracted from.
    pub provider: Option<LinkId>,
}

impl MsgControl {
    pub fn new() -> MsgControl {
        MsgControl {
            seqno: SeqNo::NONE,
            msgno: MsgNo::NONE,
            src_time_us: 0,
            provider: None,
        }
    }
}

impl Default for MsgControl {
    fn default() -> Self {
        Self::new()
    }
}
