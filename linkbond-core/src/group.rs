//! The bonding group.
//!
//! A `Group` aggregates several member links under one identity. It owns the
//! membership list, the shared sequence space, the backup sender buffer and
//! the receive merger that folds packets arriving across members into one
//! deduplicated, in-order stream.
//!
//! Locking: `core` is the group lock serializing members, counters, buffer
//! and positions; the receive condition has its own mutex so providers can
//! wake a blocked `recv` without touching the group lock. When the registry
//! lock and the group lock are both needed, the registry lock comes first —
//! which is why link handles are resolved before `core` is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::buffer::SenderBuffer;
use crate::error::GroupError;
use crate::events::{EventNotifier, NullNotifier};
use crate::link::{LinkId, LinkStatus};
use crate::member::{gen_token, Member, MemberData, MemberState};
use crate::msg::{MsgControl, LIVE_DEF_PAYLOAD_SIZE, LIVE_MAX_PAYLOAD_SIZE};
use crate::options::{self, ConfigItem, GroupOptions, OptId};
use crate::registry::LinkRegistry;
use crate::seq::{generate_isn, MsgNo, SeqNo};
use crate::stats::{GroupStats, StatsCounters};

/// Sentinel for an unassigned group or peer-group id.
pub const GROUP_ID_NONE: i32 = -1;

/// Bound on the backup sender buffer, in messages.
pub(crate) const SENDER_BUFFER_MAX: usize = 1024;

/// Bound on each member's read-ahead queue, in packets.
const READ_AHEAD_MAX: usize = 1024;

/// Gap wait before declaring a receive drop when TSBPD is disabled.
const GAP_WAIT_FALLBACK: Duration = Duration::from_millis(100);

/// Fallback condvar wait when no deadline bounds the receive.
const RCV_WAIT_SLICE: Duration = Duration::from_millis(1000);

/// Group type, chosen at construction and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// Every send fans out to all running members.
    Broadcast,
    /// One active sender; standby links activate on instability or failure.
    Backup,
    /// Declared but without a transmit policy; sends report `NotConnected`.
    Balancing,
    /// Declared but without a transmit policy; sends report `NotConnected`.
    Multicast,
}

impl GroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupType::Broadcast => "broadcast",
            GroupType::Backup => "backup",
            GroupType::Balancing => "balancing",
            GroupType::Multicast => "multicast",
        }
    }
}

/// Group lifecycle, derived from member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Created; no member has ever joined.
    Init,
    /// At least one member is at least pending.
    Opened,
    /// At least one member confirmed connected.
    Connected,
    /// `close()` called while operations are still in flight.
    Closing,
    Closed,
}

/// One packet cached for the merger, not yet claimed by `recv`.
#[derive(Debug)]
pub(crate) struct QueuedPacket {
    pub ctrl: MsgControl,
    pub payload: Vec<u8>,
}

/// Per-member read position: ordered read-ahead of provided packets.
#[derive(Debug, Default)]
pub(crate) struct ReadPos {
    pub packets: std::collections::VecDeque<QueuedPacket>,
}

/// Everything serialized by the group lock.
pub(crate) struct GroupCore {
    pub members: Vec<Member>,
    /// Most recently preferred sender; only meaningful for backup.
    pub last_active: Option<LinkId>,
    /// Next sequence number the group will assign.
    pub last_sched_seq: SeqNo,
    /// Next message number the group will assign.
    pub last_sched_msg: MsgNo,
    /// Largest sequence already delivered to the application.
    pub rcv_base_seq: SeqNo,
    pub positions: HashMap<LinkId, ReadPos>,
    /// Set when `recv` first observes a gap ahead of the base sequence.
    pub gap_since: Option<Instant>,
    pub start_time: Option<Instant>,
    pub rcv_peer_start_time: Option<Instant>,
    pub config: Vec<ConfigItem>,
    pub opts: GroupOptions,
    pub snd_buffer: SenderBuffer,
    pub stats: StatsCounters,
    pub opened: bool,
    pub connected: bool,
    pub managed: bool,
    avg_payload: Option<usize>,
}

impl GroupCore {
    /// Assign the shared numbers for one outbound message.
    pub fn schedule_numbers(&mut self) -> (SeqNo, MsgNo) {
        if self.last_sched_seq.is_none() {
            self.last_sched_seq = generate_isn();
        }
        let seq = self.last_sched_seq;
        self.last_sched_seq = seq.next();
        let msg = self.last_sched_msg;
        self.last_sched_msg = msg.next();
        (seq, msg)
    }

    pub fn member_mut(&mut self, link_id: LinkId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.link_id == link_id)
    }

    pub fn member(&self, link_id: LinkId) -> Option<&Member> {
        self.members.iter().find(|m| m.link_id == link_id)
    }

    /// Microseconds since the group start time, which the first data
    /// packet establishes if no member handshake did.
    pub fn origin_time_us(&mut self) -> u64 {
        let start = *self.start_time.get_or_insert_with(Instant::now);
        start.elapsed().as_micros() as u64
    }

    pub fn update_avg_payload(&mut self, size: usize) {
        self.avg_payload = Some(match self.avg_payload {
            None => size,
            Some(avg) => (avg * 15 + size) / 16,
        });
    }

    pub fn avg_payload(&self) -> usize {
        self.avg_payload.unwrap_or(LIVE_DEF_PAYLOAD_SIZE)
    }

    /// Restart the numbering space. Called under the group lock when the
    /// last member leaves, so a racing first send sees the fresh ISN.
    pub(crate) fn reset_sequence_state(&mut self) {
        self.last_sched_seq = generate_isn();
        self.rcv_base_seq = SeqNo::NONE;
        self.gap_since = None;
    }
}

struct RcvSignal {
    epoch: u64,
}

/// A logical connection aggregating member links.
pub struct Group {
    id: i32,
    peer_id: AtomicI32,
    group_type: GroupType,
    pub(crate) registry: Arc<dyn LinkRegistry>,
    pub(crate) notifier: Arc<dyn EventNotifier>,
    pub(crate) core: Mutex<GroupCore>,
    rcv_signal: Mutex<RcvSignal>,
    rcv_cond: Condvar,
    busy: AtomicI32,
    closing: AtomicBool,
}

impl Group {
    pub fn new(id: i32, group_type: GroupType, registry: Arc<dyn LinkRegistry>) -> Group {
        Self::with_notifier(id, group_type, registry, Arc::new(NullNotifier))
    }

    pub fn with_notifier(
        id: i32,
        group_type: GroupType,
        registry: Arc<dyn LinkRegistry>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Group {
        Group {
            id,
            peer_id: AtomicI32::new(GROUP_ID_NONE),
            group_type,
            registry,
            notifier,
            core: Mutex::new(GroupCore {
                members: Vec::new(),
                last_active: None,
                last_sched_seq: generate_isn(),
                last_sched_msg: MsgNo::new(1),
                rcv_base_seq: SeqNo::NONE,
                positions: HashMap::new(),
                gap_since: None,
                start_time: None,
                rcv_peer_start_time: None,
                config: Vec::new(),
                opts: GroupOptions::default(),
                snd_buffer: SenderBuffer::new(LIVE_MAX_PAYLOAD_SIZE, SENDER_BUFFER_MAX),
                stats: StatsCounters::new(),
                opened: false,
                connected: false,
                managed: true,
                avg_payload: None,
            }),
            rcv_signal: Mutex::new(RcvSignal { epoch: 0 }),
            rcv_cond: Condvar::new(),
            busy: AtomicI32::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    pub fn peer_id(&self) -> i32 {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub fn set_peer_id(&self, peer: i32) {
        self.peer_id.store(peer, Ordering::Relaxed);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// The next sequence number the group will assign.
    pub fn current_sched_seq(&self) -> SeqNo {
        self.lock_core().last_sched_seq
    }

    pub fn is_managed(&self) -> bool {
        self.lock_core().managed
    }

    pub fn set_managed(&self, managed: bool) {
        self.lock_core().managed = managed;
    }

    /// Whether the registry's deletion pass must keep this group alive.
    pub fn is_still_busy(&self) -> bool {
        if self.busy.load(Ordering::SeqCst) > 0 {
            return true;
        }
        !self.lock_core().members.is_empty()
    }

    pub fn status(&self) -> GroupStatus {
        if self.is_closing() {
            if self.busy.load(Ordering::SeqCst) > 0 {
                return GroupStatus::Closing;
            }
            return GroupStatus::Closed;
        }
        let core = self.lock_core();
        if core.connected {
            GroupStatus::Connected
        } else if core.opened {
            GroupStatus::Opened
        } else {
            GroupStatus::Init
        }
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, GroupCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn api_acquire(&self) -> BusyGuard<'_> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard { group: self }
    }

    /// Bump the receive epoch and wake any blocked `recv`.
    pub(crate) fn wake_receivers(&self) {
        let mut sig = self
            .rcv_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sig.epoch = sig.epoch.wrapping_add(1);
        drop(sig);
        self.rcv_cond.notify_all();
    }

    fn current_epoch(&self) -> u64 {
        self.rcv_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    // ---- membership -----------------------------------------------------

    /// Add a member wrapping `link_id`. The deferred option list is applied
    /// to the link, in insertion order, before the member is visible.
    ///
    /// Returns the member token, the stable handle for this membership.
    pub fn add_member(
        &self,
        link_id: LinkId,
        weight: u16,
        token: Option<i32>,
    ) -> Result<i32, GroupError> {
        let _busy = self.api_acquire();
        if self.is_closing() {
            return Err(GroupError::Closed);
        }
        // Registry lock before group lock.
        let link = self
            .registry
            .resolve(link_id)
            .ok_or(GroupError::InvalidParam("link not found in registry"))?;
        let status = link.status();
        if status.is_dead() {
            return Err(GroupError::InvalidParam("cannot add a dead link"));
        }

        let config = {
            let core = self.lock_core();
            if core.member(link_id).is_some() {
                return Err(GroupError::InvalidParam("link is already a member"));
            }
            core.config.clone()
        };
        options::apply_config_to_link(&config, &*link)?;

        let token = token.unwrap_or_else(gen_token);
        let mut member = Member::new(link_id, token, weight, status);
        member.agent_addr = link.local_addr();
        member.peer_addr = link.peer_addr();

        let mut core = self.lock_core();
        if core.member(link_id).is_some() {
            return Err(GroupError::InvalidParam("link is already a member"));
        }
        debug!(
            group = self.id,
            link = link_id,
            token,
            weight,
            state = member.snd_state.as_str(),
            "member joined"
        );
        core.members.push(member);
        core.opened = true;
        if status == LinkStatus::Connected {
            core.connected = true;
        }
        Ok(token)
    }

    /// Remove a member by link id.
    ///
    /// Returns whether any member remains. A not-found id is a soft error:
    /// logged, list untouched, and the actual emptiness still reported.
    pub fn remove_member(&self, link_id: LinkId) -> bool {
        let _busy = self.api_acquire();
        let mut core = self.lock_core();
        match core.members.iter().position(|m| m.link_id == link_id) {
            Some(idx) => {
                core.members.remove(idx);
                debug!(group = self.id, link = link_id, "member removed");
                if core.last_active == Some(link_id) {
                    core.last_active = None;
                }
                if core.members.is_empty() {
                    core.opened = false;
                    core.connected = false;
                    core.reset_sequence_state();
                }
            }
            None => {
                warn!(group = self.id, link = link_id, "remove: link is not a member");
            }
        }
        core.positions.remove(&link_id);
        let remaining = !core.members.is_empty();
        drop(core);
        if !remaining {
            self.wake_receivers();
        }
        remaining
    }

    pub fn contains(&self, link_id: LinkId) -> bool {
        self.lock_core().member(link_id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.lock_core().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_core().members.is_empty()
    }

    /// Mark the group connected; called when the first member handshake
    /// completes on the listener or caller side.
    pub fn set_group_connected(&self) {
        self.lock_core().connected = true;
    }

    /// Mark the group open. The listener side creates groups lazily, just
    /// before accepting a member, so they start open.
    pub fn set_open(&self) {
        self.lock_core().opened = true;
    }

    /// Snapshot of per-member metadata.
    pub fn group_data(&self) -> Vec<MemberData> {
        let core = self.lock_core();
        core.members.iter().map(MemberData::from_member).collect()
    }

    pub fn stats(&self, clear: bool) -> GroupStats {
        self.lock_core().stats.snapshot(clear)
    }

    // ---- options --------------------------------------------------------

    /// Set a group option.
    ///
    /// Recognized ids update the typed view immediately and, for per-link
    /// options, propagate to current members; every id is stored in the
    /// deferred list so later members inherit it on join.
    pub fn set_opt(&self, item: ConfigItem) -> Result<(), GroupError> {
        let _busy = self.api_acquire();
        if self.is_closing() {
            return Err(GroupError::Closed);
        }
        let member_ids: Vec<LinkId> = {
            let mut core = self.lock_core();
            core.opts.apply_item(&item)?;
            options::store_config(&mut core.config, item.clone());
            core.members.iter().map(|m| m.link_id).collect()
        };
        for id in member_ids {
            let Some(link) = self.registry.resolve(id) else {
                continue;
            };
            if let Err(err) = options::apply_item_to_link(&item, &*link) {
                warn!(group = self.id, link = id, ?err, "member link rejected option");
            }
        }
        Ok(())
    }

    /// Read back an option value, encoded the same way `set_opt` takes it.
    pub fn get_opt(&self, opt: OptId) -> Result<Vec<u8>, GroupError> {
        let core = self.lock_core();
        let timeout_ms = |t: Option<Duration>| t.map(|d| d.as_millis() as i32).unwrap_or(-1);
        let encoded = match opt {
            options::OPT_SND_TIMEOUT => {
                ConfigItem::from_i32(opt, timeout_ms(core.opts.snd_timeout))
            }
            options::OPT_RCV_TIMEOUT => {
                ConfigItem::from_i32(opt, timeout_ms(core.opts.rcv_timeout))
            }
            options::OPT_STABILITY_TIMEOUT => {
                ConfigItem::from_i32(opt, core.opts.stability_timeout.as_millis() as i32)
            }
            options::OPT_TSBPD => ConfigItem::from_bool(opt, core.opts.tsbpd),
            options::OPT_TSBPD_DELAY => {
                ConfigItem::from_i32(opt, core.opts.tsbpd_delay.as_millis() as i32)
            }
            options::OPT_PACKET_DROP => ConfigItem::from_bool(opt, core.opts.pkt_drop),
            options::OPT_PAYLOAD_SIZE => {
                ConfigItem::from_i32(opt, core.opts.payload_size as i32)
            }
            options::OPT_SND_SYN => ConfigItem::from_bool(opt, core.opts.snd_syn),
            options::OPT_RCV_SYN => ConfigItem::from_bool(opt, core.opts.rcv_syn),
            other => {
                return core
                    .config
                    .iter()
                    .find(|c| c.opt == other)
                    .map(|c| c.value.clone())
                    .ok_or(GroupError::InvalidParam("option never set"));
            }
        };
        Ok(encoded.value)
    }

    // ---- time and sequence synchronization ------------------------------

    /// Synchronize the group time anchors with a member handshake.
    ///
    /// The first member defines both anchors; later members inherit them.
    /// Returns the anchors the member must use.
    pub fn apply_group_time(&self, start: Instant, peer_start: Instant) -> (Instant, Instant) {
        let mut core = self.lock_core();
        match core.start_time {
            None => {
                core.start_time = Some(start);
                core.rcv_peer_start_time = Some(peer_start);
                (start, peer_start)
            }
            Some(group_start) => {
                let group_peer = match core.rcv_peer_start_time {
                    Some(t) => t,
                    None => {
                        error!(
                            group = self.id,
                            "internal inconsistency: start time set without peer start time"
                        );
                        core.rcv_peer_start_time = Some(peer_start);
                        peer_start
                    }
                };
                (group_start, group_peer)
            }
        }
    }

    /// Synchronize a joining member's sequence bases with the group.
    ///
    /// Before the group is connected, the first member donates its ISNs;
    /// afterwards the group's numbering overrides the member's. Returns the
    /// `(snd_isn, rcv_isn)` pair the member must adopt.
    pub fn apply_group_sequences(
        &self,
        link_id: LinkId,
        snd_isn: SeqNo,
        rcv_isn: SeqNo,
    ) -> (SeqNo, SeqNo) {
        let mut core = self.lock_core();
        if !core.connected {
            core.last_sched_seq = snd_isn;
            debug!(
                group = self.id,
                link = link_id,
                isn = snd_isn.raw(),
                "first member defines the group numbering"
            );
            return (snd_isn, rcv_isn);
        }
        let rcv = if core.rcv_base_seq.is_none() {
            rcv_isn
        } else {
            core.rcv_base_seq.next()
        };
        (core.last_sched_seq, rcv)
    }

    // ---- event surface --------------------------------------------------

    /// Attach an external waiter to this group's readiness events.
    pub fn register_waiter(&self, eid: i32) {
        self.notifier.register(eid, self.id);
    }

    /// Detach an external waiter.
    pub fn unregister_waiter(&self, eid: i32) {
        self.notifier.unregister(eid, self.id);
    }

    // ---- link-thread callbacks ------------------------------------------

    /// A member has data ready at `seq`; reflect read readiness outward.
    pub fn update_read_state(&self, link_id: LinkId, seq: SeqNo) {
        let mut core = self.lock_core();
        let fresh = core.rcv_base_seq.is_none() || core.rcv_base_seq.precedes(seq);
        if let Some(member) = core.member_mut(link_id) {
            member.ready_read = true;
        }
        drop(core);
        if fresh {
            self.notifier.signal_read(self.id);
            self.wake_receivers();
        }
    }

    /// The group can accept another send; reflect write readiness outward.
    pub fn update_write_state(&self) {
        let mut core = self.lock_core();
        for member in &mut core.members {
            if member.snd_state == MemberState::Running {
                member.ready_write = true;
            }
        }
        drop(core);
        self.notifier.signal_write(self.id);
    }

    /// A member link failed. Marks it broken; if no member is left alive,
    /// the group is no longer connected and waiters are signalled.
    pub fn update_failed_link(&self, link_id: LinkId) {
        let mut core = self.lock_core();
        if let Some(member) = core.member_mut(link_id) {
            member.snd_state = MemberState::Broken;
            member.rcv_state = MemberState::Broken;
            member.last_status = LinkStatus::Broken;
            member.ready_error = true;
        }
        let any_alive = core.members.iter().any(|m| m.is_alive());
        if !any_alive {
            core.connected = false;
        }
        drop(core);
        if !any_alive {
            debug!(group = self.id, link = link_id, "last alive member failed");
            self.notifier.signal_error(self.id);
            self.wake_receivers();
        }
    }

    /// Keepalive from the peer on a member link: the link is alive, so its
    /// response clock is refreshed and any instability suspicion withdrawn.
    /// Keeps a silent-but-alive link from qualifying as unstable on the
    /// next send round.
    pub fn handle_keepalive(&self, link_id: LinkId) {
        let mut core = self.lock_core();
        if let Some(member) = core.member_mut(link_id) {
            member.last_response = Some(Instant::now());
            member.unstable_since = None;
        }
    }

    /// ACK from any member advancing the shared message watermark. Trims
    /// the backup sender buffer; one trim per ACK.
    pub fn ack_message(&self, msgno: MsgNo) {
        if self.group_type != GroupType::Backup {
            return;
        }
        let mut core = self.lock_core();
        let trimmed = core.snd_buffer.ack(msgno);
        if trimmed > 0 {
            debug!(group = self.id, msgno = msgno.raw(), trimmed, "sender buffer acked");
        }
    }

    // ---- receive path ---------------------------------------------------

    /// Record a packet arriving on `provider` and report slot occupancy.
    ///
    /// Returns one flag per sequence in `(exp_seq, ctrl.seqno]`: `true` if
    /// that slot was already delivered or is held by any member, `false` if
    /// it is still outstanding everywhere. Arrivals at or below the
    /// delivered base are discarded as duplicates.
    pub fn provide_packet(
        &self,
        provider: LinkId,
        exp_seq: SeqNo,
        ctrl: MsgControl,
        payload: &[u8],
    ) -> Vec<bool> {
        let _busy = self.api_acquire();
        let seq = ctrl.seqno;
        let mut stored = false;
        let bitmap = {
            let mut core = self.lock_core();
            core.update_avg_payload(payload.len());

            let stale = !core.rcv_base_seq.is_none() && !core.rcv_base_seq.precedes(seq);
            if stale {
                core.stats.on_discard();
            } else {
                let pos = core.positions.entry(provider).or_default();
                let dup = pos.packets.iter().any(|q| q.ctrl.seqno == seq);
                if dup {
                    core.stats.on_discard();
                } else {
                    if pos.packets.len() >= READ_AHEAD_MAX {
                        // The merger is not keeping up; shed the oldest.
                        pos.packets.pop_front();
                        let avg = core.avg_payload();
                        core.stats.on_drop(1, avg);
                        warn!(group = self.id, link = provider, "read-ahead overflow");
                    }
                    let pos = core.positions.entry(provider).or_default();
                    pos.packets.push_back(QueuedPacket {
                        ctrl,
                        payload: payload.to_vec(),
                    });
                    stored = true;
                }
            }

            self.slot_bitmap(&core, exp_seq, seq)
        };
        if stored {
            self.notifier.signal_read(self.id);
            self.wake_receivers();
        }
        bitmap
    }

    fn slot_bitmap(&self, core: &GroupCore, exp_seq: SeqNo, seq: SeqNo) -> Vec<bool> {
        if exp_seq.is_none() || seq.is_none() {
            return Vec::new();
        }
        let span = exp_seq.offset_to(seq);
        if span <= 0 {
            return Vec::new();
        }
        let span = (span as usize).min(READ_AHEAD_MAX);
        let mut bitmap = Vec::with_capacity(span);
        for i in 0..span {
            let slot = exp_seq.advance(1 + i as i32);
            let delivered =
                !core.rcv_base_seq.is_none() && !core.rcv_base_seq.precedes(slot);
            let held = delivered
                || core
                    .positions
                    .values()
                    .any(|p| p.packets.iter().any(|q| q.ctrl.seqno == slot));
            bitmap.push(held);
        }
        bitmap
    }

    /// A member's ACK advanced past `ack`: its cached packets below that
    /// sequence are safe to extract. Wakes the merger.
    pub fn ready_packets(&self, provider: LinkId, ack: SeqNo) {
        let mut core = self.lock_core();
        if let Some(member) = core.member_mut(provider) {
            member.ready_read = true;
            if member.rcv_state == MemberState::Idle {
                member.rcv_state = MemberState::Running;
            }
        }
        debug!(group = self.id, link = provider, ack = ack.raw(), "packets ready");
        drop(core);
        self.notifier.signal_read(self.id);
        self.wake_receivers();
    }

    /// Receive the next message in shared-sequence order.
    ///
    /// Blocks up to the receive timeout (unless non-blocking mode is set).
    /// A timeout consumes nothing. A gap ahead of the base sequence is
    /// declared dropped after the configured wait, and delivery resumes
    /// past it.
    pub fn recv(&self, buf: &mut [u8], ctrl: &mut MsgControl) -> Result<usize, GroupError> {
        let _busy = self.api_acquire();
        if buf.is_empty() {
            return Err(GroupError::InvalidParam("zero-length receive buffer"));
        }
        let (rcv_syn, deadline) = {
            let core = self.lock_core();
            let deadline = core.opts.rcv_timeout.map(|t| Instant::now() + t);
            (core.opts.rcv_syn, deadline)
        };

        loop {
            if self.is_closing() {
                return Err(GroupError::Closed);
            }
            let epoch = self.current_epoch();

            let gap_deadline = match self.try_extract(buf, ctrl) {
                Extract::Delivered(len) => return Ok(len),
                Extract::Failed(err) => return Err(err.surface()),
                Extract::Pending(gap_deadline) => gap_deadline,
            };

            if !rcv_syn {
                return Err(GroupError::WouldBlock);
            }
            let now = Instant::now();
            if let Some(d) = deadline {
                if now >= d {
                    return Err(GroupError::Timeout);
                }
            }
            let wait_until = [deadline, gap_deadline]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(now + RCV_WAIT_SLICE);
            let wait = wait_until.saturating_duration_since(now);

            let mut sig = self
                .rcv_signal
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while sig.epoch == epoch {
                let remaining = wait_until.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (guard, _res) = self
                    .rcv_cond
                    .wait_timeout(sig, remaining.min(wait))
                    .unwrap_or_else(PoisonError::into_inner);
                sig = guard;
            }
        }
    }

    /// One pass over the positions under the group lock.
    fn try_extract(&self, buf: &mut [u8], ctrl: &mut MsgControl) -> Extract {
        let mut core = self.lock_core();

        if core.members.is_empty() && !core.opened {
            return Extract::Failed(GroupError::NotConnected);
        }

        // Shed heads that are at or below the delivered base.
        let base = core.rcv_base_seq;
        let mut discarded = 0;
        for pos in core.positions.values_mut() {
            while let Some(front) = pos.packets.front() {
                if base.is_none() || base.precedes(front.ctrl.seqno) {
                    break;
                }
                pos.packets.pop_front();
                discarded += 1;
            }
        }
        for _ in 0..discarded {
            core.stats.on_discard();
        }

        // Candidate: smallest head strictly ahead of the base.
        let best = core
            .positions
            .iter()
            .filter_map(|(&id, pos)| pos.packets.front().map(|q| (id, q.ctrl.seqno)))
            .min_by(|a, b| {
                if a.1 == b.1 {
                    std::cmp::Ordering::Equal
                } else if a.1.precedes(b.1) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            });

        let Some((provider, best_seq)) = best else {
            core.gap_since = None;
            return Extract::Pending(None);
        };

        let contiguous =
            core.rcv_base_seq.is_none() || core.rcv_base_seq.next() == best_seq;

        if !contiguous {
            if !core.opts.pkt_drop {
                // Wait for the missing sequence indefinitely.
                return Extract::Pending(None);
            }
            let gap_wait = if core.opts.tsbpd {
                core.opts.tsbpd_delay
            } else {
                GAP_WAIT_FALLBACK
            };
            let since = *core.gap_since.get_or_insert_with(Instant::now);
            if since.elapsed() < gap_wait {
                return Extract::Pending(Some(since + gap_wait));
            }
            // Declare the missing slots dropped and jump the base forward.
            let skipped = core.rcv_base_seq.offset_to(best_seq) - 1;
            let avg = core.avg_payload();
            core.stats.on_drop(skipped.max(0) as u64, avg);
            debug!(
                group = self.id,
                from = core.rcv_base_seq.raw(),
                to = best_seq.raw(),
                skipped,
                "receive gap declared dropped"
            );
        }

        // Deliver the candidate.
        let pos = match core.positions.get_mut(&provider) {
            Some(pos) => pos,
            None => return Extract::Failed(GroupError::Internal("candidate position vanished")),
        };
        let Some(front) = pos.packets.front() else {
            return Extract::Failed(GroupError::Internal("candidate packet vanished"));
        };
        if front.payload.len() > buf.len() {
            return Extract::Failed(GroupError::InvalidParam("receive buffer too small"));
        }
        let packet = match pos.packets.pop_front() {
            Some(p) => p,
            None => return Extract::Failed(GroupError::Internal("candidate packet vanished")),
        };

        let len = packet.payload.len();
        buf[..len].copy_from_slice(&packet.payload);
        *ctrl = packet.ctrl;
        ctrl.provider = Some(provider);
        core.rcv_base_seq = packet.ctrl.seqno;
        core.gap_since = None;
        core.stats.on_recv(len);
        if let Some(member) = core.member_mut(provider) {
            member.rcv_result = len as i32;
            if member.rcv_state == MemberState::Idle {
                member.rcv_state = MemberState::Running;
            }
        }
        Extract::Delivered(len)
    }

    // ---- close ----------------------------------------------------------

    /// Close the group: sever all members, drain the receive condition and
    /// unblock any waiter with `Closed`. Idempotent.
    pub fn close(&self) {
        let first = !self.closing.swap(true, Ordering::SeqCst);
        {
            let mut core = self.lock_core();
            if first && !core.members.is_empty() {
                debug!(group = self.id, members = core.members.len(), "closing group");
            }
            core.members.clear();
            core.positions.clear();
            core.last_active = None;
            core.opened = false;
            core.connected = false;
            core.reset_sequence_state();
        }
        self.wake_receivers();
    }
}

/// Scoped busy marker; the group cannot be freed while one exists.
pub(crate) struct BusyGuard<'a> {
    group: &'a Group,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.group.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Extract {
    Delivered(usize),
    /// Nothing deliverable yet; optional wakeup for a pending gap drop.
    Pending(Option<Instant>),
    Failed(GroupError),
}
