//! Group membership records.
//!
//! One `Member` per underlying link, tracking per-direction send/receive
//! state, the last observed link status, cached readiness flags and the
//! activation weight used by backup groups.
//!
//! State machine, per direction:
//!
//! ```text
//! Pending ──handshake complete──> Idle ──first send──> Running ──fatal──> Broken
//!                                   ^                     │
//!                                   └────demotion─────────┘   (backup only)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::link::{LinkId, LinkStatus};

/// Per-direction member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Handshake not finished; the member cannot carry traffic yet.
    Pending,
    /// Connected but not selected by any send.
    Idle,
    /// Actively carrying traffic.
    Running,
    /// Terminal; wiped on the next send round.
    Broken,
}

impl MemberState {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Pending => "PENDING",
            MemberState::Idle => "IDLE",
            MemberState::Running => "RUNNING",
            MemberState::Broken => "BROKEN",
        }
    }
}

static TOKEN_GEN: AtomicI32 = AtomicI32::new(0);

/// Generate a member token: monotonically increasing, wrapping to zero on
/// overflow. Tokens disambiguate links across rebinds of the same id.
pub fn gen_token() -> i32 {
    let token = TOKEN_GEN.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    if token < 0 {
        TOKEN_GEN.store(0, Ordering::Relaxed);
        return 0;
    }
    token
}

/// Per-link record inside a group.
#[derive(Debug, Clone)]
pub struct Member {
    pub link_id: LinkId,
    pub token: i32,
    /// Activation priority; backup prefers higher-weight idle links.
    pub weight: u16,
    pub last_status: LinkStatus,
    pub snd_state: MemberState,
    pub rcv_state: MemberState,
    /// Last send outcome: payload bytes accepted, or -1 on failure.
    pub snd_result: i32,
    /// Last receive outcome: payload bytes delivered, or -1 on failure.
    pub rcv_result: i32,
    pub agent_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub ready_read: bool,
    pub ready_write: bool,
    pub ready_error: bool,
    /// Set when a running link first looks unstable; cleared on recovery.
    pub unstable_since: Option<Instant>,
    /// Response clock refreshed by peer keepalives, so an otherwise silent
    /// link does not qualify as unstable.
    pub last_response: Option<Instant>,
}

impl Member {
    pub fn new(link_id: LinkId, token: i32, weight: u16, status: LinkStatus) -> Member {
        let initial = match status {
            LinkStatus::Connected => MemberState::Idle,
            LinkStatus::Connecting => MemberState::Pending,
            LinkStatus::Broken | LinkStatus::Closed => MemberState::Broken,
        };
        Member {
            link_id,
            token,
            weight,
            last_status: status,
            snd_state: initial,
            rcv_state: initial,
            snd_result: 0,
            rcv_result: 0,
            agent_addr: None,
            peer_addr: None,
            ready_read: false,
            ready_write: false,
            ready_error: false,
            unstable_since: None,
            last_response: None,
        }
    }

    /// True if this member could still become or stay a sender.
    pub fn is_alive(&self) -> bool {
        self.snd_state != MemberState::Broken && !self.last_status.is_dead()
    }

    /// Effective time since the peer was last heard from: the link's own
    /// response age, or the keepalive clock if that is fresher.
    pub fn response_age(&self, link_age: Duration, now: Instant) -> Duration {
        match self.last_response {
            Some(at) => link_age.min(now.saturating_duration_since(at)),
            None => link_age,
        }
    }
}

/// Snapshot of one member's metadata, as returned by `Group::group_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberData {
    pub link_id: LinkId,
    pub token: i32,
    pub weight: u16,
    pub agent_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub last_status: LinkStatus,
    pub snd_state: MemberState,
    pub rcv_state: MemberState,
    pub snd_result: i32,
    pub rcv_result: i32,
}

impl MemberData {
    pub(crate) fn from_member(m: &Member) -> MemberData {
        MemberData {
            link_id: m.link_id,
            token: m.token,
            weight: m.weight,
            agent_addr: m.agent_addr,
            peer_addr: m.peer_addr,
            last_status: m.last_status,
            snd_state: m.snd_state,
            rcv_state: m.rcv_state,
            snd_result: m.snd_result,
            rcv_result: m.rcv_result,
        }
    }
}
