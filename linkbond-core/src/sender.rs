//! Send paths.
//!
//! Broadcast fans every message out to all running members and succeeds if
//! any link accepted it. Backup keeps one preferred sender, watches its
//! stability, and on trouble activates the best idle standby — replaying
//! the unacknowledged sender buffer through it under the original numbers
//! so the peer can deduplicate.
//!
//! Per-link sends happen with the group lock released; classification and
//! result application re-take it. Link getters (`status`,
//! `time_since_last_response`) are non-blocking and may be called under the
//! group lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::GroupError;
use crate::group::{Group, GroupCore, GroupType};
use crate::link::{Link, LinkError, LinkId, LinkStatus};
use crate::member::MemberState;
use crate::msg::MsgControl;
use crate::seq::{MsgNo, SeqNo};

/// Pause between attempts when a blocking send found every link congested.
const SND_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Member ids bucketed by sendability for one send round.
#[derive(Debug, Default)]
struct Buckets {
    /// Broken members, or members whose link is gone; erased after the round.
    wipeme: Vec<LinkId>,
    /// Connected idle members, best activation candidate first.
    idlers: Vec<LinkId>,
    /// Members whose handshake is still in progress.
    pending: Vec<LinkId>,
    /// Running members currently suspected unstable (subset of sendable).
    unstable: Vec<LinkId>,
    /// All running members, including unstable ones.
    sendable: Vec<LinkId>,
}

/// Outcome of transmitting on one member.
struct SendState {
    id: LinkId,
    result: Result<usize, LinkError>,
}

impl Group {
    /// Send one message over the group.
    ///
    /// The message gets the next shared sequence and message numbers,
    /// recorded in `ctrl`. In blocking mode a fully congested group is
    /// retried until the send timeout. Returns the payload length once at
    /// least one member accepted the message.
    pub fn send(&self, buf: &[u8], ctrl: &mut MsgControl) -> Result<usize, GroupError> {
        let _busy = self.api_acquire();
        if buf.is_empty() {
            return Err(GroupError::InvalidParam("empty payload"));
        }
        let (snd_syn, deadline, payload_max) = {
            let core = self.lock_core();
            (
                core.opts.snd_syn,
                core.opts.snd_timeout.map(|t| Instant::now() + t),
                core.opts.payload_size,
            )
        };
        if buf.len() > payload_max {
            return Err(GroupError::InvalidParam("payload exceeds live maximum"));
        }

        // Keeps the assigned numbers across retries of the same message.
        let mut assigned: Option<(SeqNo, MsgNo)> = None;
        loop {
            if self.is_closing() {
                return Err(GroupError::Closed);
            }
            let res = match self.group_type() {
                GroupType::Broadcast => self.send_broadcast(buf, ctrl, &mut assigned),
                GroupType::Backup => self.send_backup(buf, ctrl, &mut assigned),
                // No transmit policy is defined for these types yet.
                GroupType::Balancing | GroupType::Multicast => Err(GroupError::NotConnected),
            };
            match res {
                Err(GroupError::WouldBlock) if snd_syn => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(GroupError::Timeout);
                        }
                    }
                    std::thread::sleep(SND_RETRY_INTERVAL);
                }
                other => return other.map_err(GroupError::surface),
            }
        }
    }

    /// Resolve the current membership to live link handles.
    ///
    /// Registry lock before group lock, so ids are snapshotted first.
    fn resolve_members(&self) -> HashMap<LinkId, Arc<dyn Link>> {
        let ids: Vec<LinkId> = {
            let core = self.lock_core();
            core.members.iter().map(|m| m.link_id).collect()
        };
        ids.into_iter()
            .filter_map(|id| self.registry.resolve(id).map(|l| (id, l)))
            .collect()
    }

    /// Assign (or re-use, on retry) the shared numbers for this message.
    fn assign_numbers(
        core: &mut GroupCore,
        ctrl: &mut MsgControl,
        assigned: &mut Option<(SeqNo, MsgNo)>,
    ) -> bool {
        match *assigned {
            Some((seq, msgno)) => {
                ctrl.seqno = seq;
                ctrl.msgno = msgno;
                false
            }
            None => {
                let (seq, msgno) = core.schedule_numbers();
                ctrl.seqno = seq;
                ctrl.msgno = msgno;
                ctrl.src_time_us = core.origin_time_us();
                *assigned = Some((seq, msgno));
                true
            }
        }
    }

    // ---- broadcast ------------------------------------------------------

    fn send_broadcast(
        &self,
        buf: &[u8],
        ctrl: &mut MsgControl,
        assigned: &mut Option<(SeqNo, MsgNo)>,
    ) -> Result<usize, GroupError> {
        let links = self.resolve_members();
        let mut wipeme: Vec<LinkId> = Vec::new();
        let mut pending: Vec<LinkId> = Vec::new();

        let targets: Vec<(LinkId, Arc<dyn Link>)> = {
            let mut core = self.lock_core();
            if core.members.is_empty() {
                return Err(GroupError::NotConnected);
            }
            Self::assign_numbers(&mut core, ctrl, assigned);

            let mut targets = Vec::new();
            for member in &mut core.members {
                let id = member.link_id;
                let Some(link) = links.get(&id) else {
                    member.snd_state = MemberState::Broken;
                    wipeme.push(id);
                    continue;
                };
                let status = link.status();
                member.last_status = status;
                if member.snd_state == MemberState::Broken || status.is_dead() {
                    member.snd_state = MemberState::Broken;
                    wipeme.push(id);
                    continue;
                }
                match member.snd_state {
                    MemberState::Pending => {
                        if status == LinkStatus::Connected {
                            // Freshly connected links activate at the
                            // nearest sending operation.
                            member.snd_state = MemberState::Running;
                            targets.push((id, Arc::clone(link)));
                        } else {
                            pending.push(id);
                        }
                    }
                    MemberState::Idle => {
                        member.snd_state = MemberState::Running;
                        targets.push((id, Arc::clone(link)));
                    }
                    MemberState::Running => targets.push((id, Arc::clone(link))),
                    MemberState::Broken => {}
                }
            }
            targets
        };

        let states = transmit(&targets, ctrl, buf);
        self.finish_round(buf, &states, &mut wipeme, &pending, &links)
    }

    // ---- backup ---------------------------------------------------------

    fn send_backup(
        &self,
        buf: &[u8],
        ctrl: &mut MsgControl,
        assigned: &mut Option<(SeqNo, MsgNo)>,
    ) -> Result<usize, GroupError> {
        let links = self.resolve_members();
        let now = Instant::now();

        let (mut buckets, targets) = {
            let mut core = self.lock_core();
            if core.members.is_empty() {
                return Err(GroupError::NotConnected);
            }
            if Self::assign_numbers(&mut core, ctrl, assigned) {
                // Buffer before transmitting, so a failure mid-round still
                // leaves the message replayable on activation.
                core.snd_buffer.trim(true);
                core.snd_buffer.push(*ctrl, buf)?;
            }
            let buckets = self.qualify_members(&mut core, &links, now);
            let targets: Vec<(LinkId, Arc<dyn Link>)> = buckets
                .sendable
                .iter()
                .filter_map(|id| links.get(id).map(|l| (*id, Arc::clone(l))))
                .collect();
            (buckets, targets)
        };

        let states = transmit(&targets, ctrl, buf);

        // Apply results, then decide whether a standby must take over.
        let (need_activation, max_sendable_weight, mut parallel) = {
            let mut core = self.lock_core();
            let mut parallel: Vec<LinkId> = Vec::new();
            let mut max_weight: u16 = 0;
            for state in &states {
                let Some(member) = core.member_mut(state.id) else {
                    continue;
                };
                match state.result {
                    Ok(n) => {
                        member.snd_result = n as i32;
                        max_weight = max_weight.max(member.weight);
                        parallel.push(state.id);
                    }
                    Err(LinkError::WouldBlock) => {
                        member.snd_result = -1;
                        if member.unstable_since.is_none() {
                            member.unstable_since = Some(now);
                        }
                        if !buckets.unstable.contains(&state.id) {
                            buckets.unstable.push(state.id);
                        }
                    }
                    Err(err) => {
                        member.snd_result = -1;
                        member.snd_state = MemberState::Broken;
                        debug!(group = self.id(), link = state.id, ?err, "member send failed");
                        buckets.wipeme.push(state.id);
                    }
                }
            }
            buckets.sendable.retain(|id| !buckets.wipeme.contains(id));
            buckets.unstable.retain(|id| buckets.sendable.contains(id));

            let all_unstable = !buckets.sendable.is_empty()
                && buckets
                    .sendable
                    .iter()
                    .all(|id| buckets.unstable.contains(id));
            let top_idler_weight = buckets
                .idlers
                .first()
                .and_then(|id| core.member(*id).map(|m| m.weight));
            let need = !buckets.idlers.is_empty()
                && (buckets.sendable.is_empty()
                    || all_unstable
                    || top_idler_weight.is_some_and(|w| w > max_weight));
            (need, max_weight, parallel)
        };

        let mut max_weight = max_sendable_weight;
        let mut congested = false;
        if need_activation {
            congested =
                self.try_activate_idlers(&buckets.idlers, &links, &mut parallel, &mut max_weight);
        }

        // Reconcile, wipe, and settle the round outcome.
        let pending = std::mem::take(&mut buckets.pending);
        let mut wipeme = std::mem::take(&mut buckets.wipeme);
        {
            let mut core = self.lock_core();
            self.reconcile_parallel(&mut core, &parallel);
        }
        let merged = states_with_activation(&states, &parallel, buf.len());
        let result = self.finish_round(buf, &merged, &mut wipeme, &pending, &links);
        // An activation that only hit congestion leaves the round retriable.
        if congested && result == Err(GroupError::NotConnected) {
            return Err(GroupError::WouldBlock);
        }
        result
    }

    /// Bucket every member for one backup round. Runs under the group lock.
    fn qualify_members(
        &self,
        core: &mut GroupCore,
        links: &HashMap<LinkId, Arc<dyn Link>>,
        now: Instant,
    ) -> Buckets {
        let mut buckets = Buckets::default();
        let stability_timeout = core.opts.stability_timeout;
        let mut idlers: Vec<(usize, LinkId, u16)> = Vec::new();

        for (insertion, member) in core.members.iter_mut().enumerate() {
            let id = member.link_id;
            let Some(link) = links.get(&id) else {
                member.snd_state = MemberState::Broken;
                buckets.wipeme.push(id);
                continue;
            };
            let status = link.status();
            member.last_status = status;
            if member.snd_state == MemberState::Broken || status.is_dead() {
                member.snd_state = MemberState::Broken;
                buckets.wipeme.push(id);
                continue;
            }
            match member.snd_state {
                MemberState::Pending => {
                    if status == LinkStatus::Connected {
                        member.snd_state = MemberState::Idle;
                        idlers.push((insertion, id, member.weight));
                    } else {
                        buckets.pending.push(id);
                    }
                }
                MemberState::Idle => idlers.push((insertion, id, member.weight)),
                MemberState::Running => {
                    // Keepalives count as responses too.
                    let age = member.response_age(link.time_since_last_response(), now);
                    let fresh = age <= stability_timeout;
                    if fresh {
                        if member.unstable_since.is_some() {
                            debug!(group = self.id(), link = id, "member stabilized");
                            member.unstable_since = None;
                        }
                    } else if member.unstable_since.is_none() {
                        debug!(group = self.id(), link = id, "member turned unstable");
                        member.unstable_since = Some(now);
                    }
                    if member.unstable_since.is_some() {
                        buckets.unstable.push(id);
                    }
                    buckets.sendable.push(id);
                }
                MemberState::Broken => {}
            }
        }

        // Best activation candidate first: weight, then join order.
        idlers.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        buckets.idlers = idlers.into_iter().map(|(_, id, _)| id).collect();
        buckets
    }

    /// Promote idle standbys until one carries the buffered tail.
    ///
    /// Each candidate gets the sender buffer replayed under the original
    /// numbers (the current message is already buffered, so it goes along).
    /// Stops at the first fully successful link. Returns whether any
    /// attempt failed only with congestion.
    fn try_activate_idlers(
        &self,
        idlers: &[LinkId],
        links: &HashMap<LinkId, Arc<dyn Link>>,
        parallel: &mut Vec<LinkId>,
        max_weight: &mut u16,
    ) -> bool {
        let mut congested = false;
        // Snapshot the replayable tail; sends happen without the lock.
        let replay: Vec<(MsgControl, Vec<u8>)> = {
            let core = self.lock_core();
            core.snd_buffer
                .replay()
                .map(|m| (m.ctrl, m.payload().to_vec()))
                .collect()
        };
        if replay.is_empty() {
            return congested;
        }

        for &id in idlers {
            let Some(link) = links.get(&id) else {
                continue;
            };
            debug!(
                group = self.id(),
                link = id,
                backlog = replay.len(),
                "activating idle member"
            );
            link.override_next_seq(replay[0].0.seqno);
            let mut failed = None;
            for (mc, payload) in &replay {
                if let Err(err) = link.send(mc, payload) {
                    failed = Some(err);
                    break;
                }
            }
            let mut core = self.lock_core();
            let Some(member) = core.member_mut(id) else {
                continue;
            };
            if member.snd_state != MemberState::Idle {
                continue;
            }
            match failed {
                None => {
                    member.snd_state = MemberState::Running;
                    member.unstable_since = None;
                    *max_weight = (*max_weight).max(member.weight);
                    parallel.push(id);
                    return congested;
                }
                Some(err) => {
                    warn!(group = self.id(), link = id, ?err, "activation failed");
                    if err.is_fatal() {
                        member.snd_state = MemberState::Broken;
                    } else {
                        congested = true;
                    }
                }
            }
        }
        congested
    }

    /// Keep at most one preferred sender after a round that used several.
    ///
    /// The highest-weight parallel link wins; the rest drop back to idle
    /// once the winner is currently stable.
    fn reconcile_parallel(&self, core: &mut GroupCore, parallel: &[LinkId]) {
        let preferred = parallel
            .iter()
            .filter_map(|id| core.member(*id).map(|m| (*id, m.weight)))
            .max_by_key(|&(_, w)| w)
            .map(|(id, _)| id);
        let Some(preferred) = preferred else {
            return;
        };
        core.last_active = Some(preferred);
        if parallel.len() < 2 {
            return;
        }
        let winner_stable = core
            .member(preferred)
            .is_some_and(|m| m.unstable_since.is_none());
        if !winner_stable {
            return;
        }
        for &id in parallel {
            if id == preferred {
                continue;
            }
            if let Some(member) = core.member_mut(id) {
                if member.snd_state == MemberState::Running {
                    member.snd_state = MemberState::Idle;
                    debug!(group = self.id(), link = id, "parallel member demoted to idle");
                }
            }
        }
    }

    /// Common round epilogue: wipe broken members, account, and map the
    /// per-link outcomes to the group result.
    fn finish_round(
        &self,
        buf: &[u8],
        states: &[SendState],
        wipeme: &mut Vec<LinkId>,
        pending: &[LinkId],
        links: &HashMap<LinkId, Arc<dyn Link>>,
    ) -> Result<usize, GroupError> {
        let mut successes = 0usize;
        let mut would_block = 0usize;
        for state in states {
            match state.result {
                Ok(_) => successes += 1,
                Err(LinkError::WouldBlock) => would_block += 1,
                Err(_) => {
                    if !wipeme.contains(&state.id) {
                        wipeme.push(state.id);
                    }
                }
            }
        }
        // A pending link whose handshake died since classification is wiped
        // with the rest.
        for &id in pending {
            let dead = links.get(&id).map(|l| l.status().is_dead()).unwrap_or(true);
            if dead && !wipeme.contains(&id) {
                wipeme.push(id);
            }
        }

        let mut core = self.lock_core();
        for state in states {
            if let Some(member) = core.member_mut(state.id) {
                if let Ok(n) = state.result {
                    member.snd_result = n as i32;
                    if member.snd_state == MemberState::Idle {
                        // Activated during this round.
                        member.snd_state = MemberState::Running;
                    }
                } else {
                    member.snd_result = -1;
                    if let Err(err) = state.result {
                        if err.is_fatal() {
                            member.snd_state = MemberState::Broken;
                        }
                    }
                }
            }
        }
        self.close_broken(&mut core, wipeme);

        if successes > 0 {
            core.connected = true;
            core.stats.on_sent(buf.len());
            core.update_avg_payload(buf.len());
            drop(core);
            self.notifier.signal_write(self.id());
            return Ok(buf.len());
        }
        if would_block > 0 || !pending.is_empty() {
            return Err(GroupError::WouldBlock);
        }
        Err(GroupError::NotConnected)
    }

    /// Erase every wiped member, emitting a link-lost event; the last one
    /// leaving marks the group disconnected.
    pub(crate) fn close_broken(&self, core: &mut GroupCore, wipeme: &[LinkId]) {
        let mut lost_any = false;
        for &id in wipeme {
            let Some(idx) = core.members.iter().position(|m| m.link_id == id) else {
                continue;
            };
            core.members.remove(idx);
            core.positions.remove(&id);
            if core.last_active == Some(id) {
                core.last_active = None;
            }
            lost_any = true;
            debug!(group = self.id(), link = id, "broken member erased");
        }
        if !lost_any {
            return;
        }
        self.notifier.signal_error(self.id());
        if core.members.is_empty() {
            core.opened = false;
            core.connected = false;
            core.reset_sequence_state();
        }
    }
}

/// Issue the per-link sends for one round, lock released.
fn transmit(targets: &[(LinkId, Arc<dyn Link>)], ctrl: &MsgControl, buf: &[u8]) -> Vec<SendState> {
    targets
        .iter()
        .map(|(id, link)| SendState {
            id: *id,
            result: link.send(ctrl, buf),
        })
        .collect()
}

/// Fold activation successes into the round outcome so the epilogue sees
/// them as successful sends.
fn states_with_activation(states: &[SendState], parallel: &[LinkId], len: usize) -> Vec<SendState> {
    let mut merged: Vec<SendState> = states
        .iter()
        .map(|s| SendState {
            id: s.id,
            result: s.result,
        })
        .collect();
    for &id in parallel {
        if !merged.iter().any(|s| s.id == id && s.result.is_ok()) {
            merged.retain(|s| s.id != id);
            merged.push(SendState {
                id,
                result: Ok(len),
            });
        }
    }
    merged
}
