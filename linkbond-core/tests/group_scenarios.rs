//! End-to-end group scenarios against a mock link transport.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use linkbond_core::options::{OPT_RCV_TIMEOUT, OPT_SND_SYN, OPT_TSBPD, OPT_TSBPD_DELAY};
use linkbond_core::{
    ConfigItem, EventNotifier, Group, GroupError, GroupStatus, GroupType, Link, LinkError, LinkId,
    LinkStatus, MemberState, MemoryRegistry, MsgControl, MsgNo, SeqNo,
};

/// Scriptable in-memory link.
struct MockLink {
    id: LinkId,
    status: Mutex<LinkStatus>,
    response_age: Mutex<Duration>,
    send_error: Mutex<Option<LinkError>>,
    sent: Mutex<Vec<(MsgControl, Vec<u8>)>>,
    seq_overrides: Mutex<Vec<SeqNo>>,
    applied: Mutex<Vec<ConfigItem>>,
}

impl MockLink {
    fn connected(id: LinkId) -> Arc<MockLink> {
        Arc::new(MockLink {
            id,
            status: Mutex::new(LinkStatus::Connected),
            response_age: Mutex::new(Duration::ZERO),
            send_error: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            seq_overrides: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
        })
    }

    fn set_status(&self, status: LinkStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn set_send_error(&self, err: Option<LinkError>) {
        *self.send_error.lock().unwrap() = err;
    }

    fn set_response_age(&self, age: Duration) {
        *self.response_age.lock().unwrap() = age;
    }

    fn sent(&self) -> Vec<(MsgControl, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent().into_iter().map(|(_, p)| p).collect()
    }

    fn sent_seqs(&self) -> Vec<SeqNo> {
        self.sent().into_iter().map(|(mc, _)| mc.seqno).collect()
    }

    fn overrides(&self) -> Vec<SeqNo> {
        self.seq_overrides.lock().unwrap().clone()
    }

    fn applied(&self) -> Vec<ConfigItem> {
        self.applied.lock().unwrap().clone()
    }
}

impl Link for MockLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap()
    }

    fn send(&self, ctrl: &MsgControl, data: &[u8]) -> Result<usize, LinkError> {
        if self.status().is_dead() {
            return Err(LinkError::Broken);
        }
        if let Some(err) = *self.send_error.lock().unwrap() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((*ctrl, data.to_vec()));
        Ok(data.len())
    }

    fn override_next_seq(&self, seq: SeqNo) {
        self.seq_overrides.lock().unwrap().push(seq);
    }

    fn time_since_last_response(&self) -> Duration {
        *self.response_age.lock().unwrap()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        format!("127.0.0.1:{}", 5000 + self.id).parse().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        format!("10.0.0.{}:7000", self.id).parse().ok()
    }

    fn apply_option(&self, item: &ConfigItem) -> Result<(), LinkError> {
        self.applied.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// Notifier that records every signal it receives.
#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(kind))
            .count()
    }
}

impl EventNotifier for RecordingNotifier {
    fn register(&self, eid: i32, group_id: i32) {
        self.events.lock().unwrap().push(format!("register:{eid}:{group_id}"));
    }

    fn unregister(&self, eid: i32, group_id: i32) {
        self.events.lock().unwrap().push(format!("unregister:{eid}:{group_id}"));
    }

    fn signal_read(&self, group_id: i32) {
        self.events.lock().unwrap().push(format!("read:{group_id}"));
    }

    fn signal_write(&self, group_id: i32) {
        self.events.lock().unwrap().push(format!("write:{group_id}"));
    }

    fn signal_error(&self, group_id: i32) {
        self.events.lock().unwrap().push(format!("error:{group_id}"));
    }
}

fn setup(gtype: GroupType) -> (Arc<MemoryRegistry>, Group) {
    let registry = Arc::new(MemoryRegistry::new());
    let group = Group::new(100, gtype, registry.clone());
    (registry, group)
}

fn setup_with_notifier(
    gtype: GroupType,
) -> (Arc<MemoryRegistry>, Arc<RecordingNotifier>, Group) {
    let registry = Arc::new(MemoryRegistry::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let group = Group::with_notifier(100, gtype, registry.clone(), notifier.clone());
    (registry, notifier, group)
}

fn pctrl(seq: i32) -> MsgControl {
    MsgControl {
        seqno: SeqNo::new(seq),
        msgno: MsgNo::new(seq),
        src_time_us: 0,
        provider: None,
    }
}

fn member_state(group: &Group, id: LinkId) -> MemberState {
    group
        .group_data()
        .into_iter()
        .find(|m| m.link_id == id)
        .expect("member present")
        .snd_state
}

// S1: broadcast delivers to every running member under one sequence.
#[test]
fn broadcast_two_members_share_sequence() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1.clone());
    registry.register(m2.clone());
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");

    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"hello", &mut mc), Ok(5));

    assert_eq!(m1.sent_payloads(), vec![b"hello".to_vec()]);
    assert_eq!(m2.sent_payloads(), vec![b"hello".to_vec()]);
    let s1 = m1.sent_seqs()[0];
    assert_eq!(s1, m2.sent_seqs()[0]);
    assert_eq!(s1, mc.seqno);

    // The shared counter advances by exactly one per message.
    let mut mc2 = MsgControl::default();
    group.send(b"again", &mut mc2).expect("second send");
    assert_eq!(mc2.seqno, s1.next());
    assert_eq!(m1.sent_seqs()[1], m2.sent_seqs()[1]);
}

// Property 4: broadcast succeeds iff at least one member send succeeded.
#[test]
fn broadcast_succeeds_on_partial_failure() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1.clone());
    registry.register(m2.clone());
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");

    m1.set_status(LinkStatus::Broken);
    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"x", &mut mc), Ok(1));
    assert!(m1.sent().is_empty());
    assert_eq!(m2.sent_payloads(), vec![b"x".to_vec()]);

    // The broken member was wiped during the round.
    assert!(!group.contains(1));

    m2.set_status(LinkStatus::Broken);
    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"y", &mut mc), Err(GroupError::NotConnected));
    assert!(group.is_empty());
}

#[test]
fn broadcast_all_would_block_is_retriable() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1.clone());
    group.add_member(1, 1, None).expect("add m1");
    group
        .set_opt(ConfigItem::from_bool(OPT_SND_SYN, false))
        .expect("non-blocking send");

    m1.set_send_error(Some(LinkError::WouldBlock));
    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"z", &mut mc), Err(GroupError::WouldBlock));
    // The member survives a congested round.
    assert!(group.contains(1));
}

// S2: backup failover replays the unacknowledged tail through the standby.
#[test]
fn backup_failover_replays_buffered_messages() {
    let (registry, group) = setup(GroupType::Backup);
    let p = MockLink::connected(1);
    let b = MockLink::connected(2);
    registry.register(p.clone());
    registry.register(b.clone());
    group.add_member(1, 10, None).expect("add primary");
    group.add_member(2, 5, None).expect("add backup");

    let mut mc_a = MsgControl::default();
    group.send(b"a", &mut mc_a).expect("send a");
    let mut mc_b = MsgControl::default();
    group.send(b"b", &mut mc_b).expect("send b");

    // The higher-weight link carries the traffic; the standby stays idle.
    assert_eq!(p.sent_payloads(), vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(b.sent().is_empty());
    assert_eq!(member_state(&group, 2), MemberState::Idle);

    group.ack_message(mc_a.msgno);
    p.set_status(LinkStatus::Broken);

    let mut mc_c = MsgControl::default();
    assert_eq!(group.send(b"c", &mut mc_c), Ok(1));

    // "b" replayed under its original sequence, then "c" under a fresh one.
    assert_eq!(b.sent_payloads(), vec![b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(b.sent_seqs(), vec![mc_b.seqno, mc_c.seqno]);
    assert_eq!(mc_c.seqno, mc_b.seqno.next());
    assert_eq!(b.overrides(), vec![mc_b.seqno]);

    // The broken primary is gone; the standby is the running sender now.
    assert!(!group.contains(1));
    assert_eq!(member_state(&group, 2), MemberState::Running);
}

// S3: an unstable primary runs in parallel with the activated standby and
// the standby is demoted once the primary stabilizes.
#[test]
fn backup_stability_demotion() {
    let (registry, group) = setup(GroupType::Backup);
    let p = MockLink::connected(1);
    let b = MockLink::connected(2);
    registry.register(p.clone());
    registry.register(b.clone());
    group.add_member(1, 10, None).expect("add primary");
    group.add_member(2, 5, None).expect("add backup");

    let mut mc = MsgControl::default();
    group.send(b"m1", &mut mc).expect("send m1");
    assert_eq!(member_state(&group, 1), MemberState::Running);

    // Primary stops hearing from the peer: next send activates the standby
    // and keeps both links transmitting.
    p.set_response_age(Duration::from_millis(500));
    let mut mc = MsgControl::default();
    group.send(b"m2", &mut mc).expect("send m2");
    assert_eq!(member_state(&group, 2), MemberState::Running);
    assert!(b.sent_payloads().contains(&b"m2".to_vec()));

    // Primary recovers: both transmit once more, then the lower-weight
    // parallel link drops back to idle.
    p.set_response_age(Duration::ZERO);
    let mut mc3 = MsgControl::default();
    group.send(b"m3", &mut mc3).expect("send m3");

    let p_m3 = p.sent().into_iter().find(|(_, d)| d == b"m3").expect("p sent m3");
    let b_m3 = b.sent().into_iter().find(|(_, d)| d == b"m3").expect("b sent m3");
    assert_eq!(p_m3.0.seqno, b_m3.0.seqno);

    assert_eq!(member_state(&group, 1), MemberState::Running);
    assert_eq!(member_state(&group, 2), MemberState::Idle);
}

// Property 1 + 2: deduplicated, strictly increasing delivery.
#[test]
fn recv_merges_and_deduplicates_across_members() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1);
    registry.register(m2);
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");
    group
        .set_opt(ConfigItem::from_i32(OPT_RCV_TIMEOUT, 2000))
        .expect("rcv timeout");

    // Both members provide overlapping sequences.
    group.provide_packet(1, SeqNo::NONE, pctrl(10), b"ten");
    group.provide_packet(2, SeqNo::NONE, pctrl(10), b"ten");
    group.provide_packet(2, SeqNo::new(10), pctrl(11), b"eleven");

    let mut buf = [0u8; 64];
    let mut mc = MsgControl::default();
    let n = group.recv(&mut buf, &mut mc).expect("recv 10");
    assert_eq!(&buf[..n], b"ten");
    assert_eq!(mc.seqno, SeqNo::new(10));

    let n = group.recv(&mut buf, &mut mc).expect("recv 11");
    assert_eq!(&buf[..n], b"eleven");
    assert_eq!(mc.seqno, SeqNo::new(11));
    assert_eq!(mc.provider, Some(2));

    // The duplicate of 10 was discarded, not delivered twice.
    let stats = group.stats(false);
    assert_eq!(stats.recv, 2);
    assert_eq!(stats.recv_discard, 1);

    // A late arrival below the base is discarded too.
    group.provide_packet(1, SeqNo::NONE, pctrl(11), b"late");
    assert_eq!(group.stats(false).recv_discard, 2);
}

// S4: a gap is declared dropped after the configured wait.
#[test]
fn recv_gap_drop_advances_past_missing_sequence() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");
    group
        .set_opt(ConfigItem::from_i32(OPT_RCV_TIMEOUT, 2000))
        .expect("rcv timeout");
    group
        .set_opt(ConfigItem::from_i32(OPT_TSBPD_DELAY, 25))
        .expect("tsbpd delay");

    group.provide_packet(1, SeqNo::NONE, pctrl(1), b"one");
    group.provide_packet(1, SeqNo::new(1), pctrl(2), b"two");
    group.provide_packet(1, SeqNo::new(2), pctrl(4), b"four");

    let mut buf = [0u8; 64];
    let mut mc = MsgControl::default();
    assert_eq!(group.recv(&mut buf, &mut mc), Ok(3));
    assert_eq!(mc.seqno, SeqNo::new(1));
    assert_eq!(group.recv(&mut buf, &mut mc), Ok(3));
    assert_eq!(mc.seqno, SeqNo::new(2));

    // Sequence 3 never arrives; after the wait, 4 is delivered and the
    // missing slot is accounted as a receive drop.
    let n = group.recv(&mut buf, &mut mc).expect("recv 4");
    assert_eq!(&buf[..n], b"four");
    assert_eq!(mc.seqno, SeqNo::new(4));
    assert_eq!(group.stats(false).recv_drop, 1);
}

// Property 7: a receive timeout consumes nothing.
#[test]
fn recv_timeout_is_idempotent() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");
    group
        .set_opt(ConfigItem::from_i32(OPT_RCV_TIMEOUT, 20))
        .expect("rcv timeout");

    let mut buf = [0u8; 64];
    let mut mc = MsgControl::default();
    assert_eq!(group.recv(&mut buf, &mut mc), Err(GroupError::Timeout));

    // A packet provided afterwards is still delivered in full.
    group.provide_packet(1, SeqNo::NONE, pctrl(5), b"five");
    let n = group.recv(&mut buf, &mut mc).expect("recv 5");
    assert_eq!(&buf[..n], b"five");
}

#[test]
fn recv_nonblocking_reports_would_block() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");
    group
        .set_opt(ConfigItem::from_bool(
            linkbond_core::options::OPT_RCV_SYN,
            false,
        ))
        .expect("non-blocking recv");

    let mut buf = [0u8; 64];
    let mut mc = MsgControl::default();
    assert_eq!(group.recv(&mut buf, &mut mc), Err(GroupError::WouldBlock));
}

#[test]
fn provide_packet_reports_slot_occupancy() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1);
    registry.register(m2);
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");

    // Member 1 already holds sequence 2; member 2 then reports 4 while it
    // last saw 1. Slots 2..=4: held, missing, held-by-this-call.
    group.provide_packet(1, SeqNo::NONE, pctrl(2), b"two");
    let bitmap = group.provide_packet(2, SeqNo::new(1), pctrl(4), b"four");
    assert_eq!(bitmap, vec![true, false, true]);
}

// S5: removing the last member resets the numbering space.
#[test]
fn empty_removal_resets_sequence_state() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");

    let mut mc = MsgControl::default();
    group.send(b"x", &mut mc).expect("send");
    let sched_before = group.current_sched_seq();
    assert_eq!(group.status(), GroupStatus::Connected);

    assert!(!group.remove_member(1));
    assert_eq!(group.status(), GroupStatus::Init);
    assert!(group.is_empty());
    // A new numbering space, not a continuation of the old one.
    assert_ne!(group.current_sched_seq(), sched_before);

    // Removing an unknown link is a soft error and reports real emptiness.
    assert!(!group.remove_member(42));
}

// S6 / property 8: options set before a member joins are replayed on join.
#[test]
fn option_carryover_applies_to_later_members() {
    let (registry, group) = setup(GroupType::Backup);
    group
        .set_opt(ConfigItem::from_bool(OPT_TSBPD, true))
        .expect("tsbpd");
    group
        .set_opt(ConfigItem::from_i32(OPT_TSBPD_DELAY, 200))
        .expect("tsbpd delay");

    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1.clone());
    registry.register(m2.clone());
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");

    for link in [&m1, &m2] {
        let applied = link.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].opt, OPT_TSBPD);
        assert_eq!(applied[1].opt, OPT_TSBPD_DELAY);
        assert_eq!(applied[1].as_i32(), Some(200));
    }
}

// Property 6: the group stays busy while members remain.
#[test]
fn busy_safety_tracks_membership() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);

    assert!(!group.is_still_busy());
    group.add_member(1, 1, None).expect("add m1");
    assert!(group.is_still_busy());
    group.remove_member(1);
    assert!(!group.is_still_busy());
}

#[test]
fn close_unblocks_blocked_recv() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");

    let group = Arc::new(group);
    let waiter = {
        let group = Arc::clone(&group);
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            let mut mc = MsgControl::default();
            group.recv(&mut buf, &mut mc)
        })
    };
    thread::sleep(Duration::from_millis(50));
    group.close();
    assert_eq!(waiter.join().expect("join"), Err(GroupError::Closed));

    // Close is idempotent and terminal.
    group.close();
    assert_eq!(group.status(), GroupStatus::Closed);
    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"x", &mut mc), Err(GroupError::Closed));
}

#[test]
fn unsupported_group_types_reject_send() {
    let (registry, group) = setup(GroupType::Balancing);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");

    let mut mc = MsgControl::default();
    assert_eq!(group.send(b"x", &mut mc), Err(GroupError::NotConnected));
}

#[test]
fn oversize_payload_rejected() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");

    let payload = vec![0u8; linkbond_core::LIVE_MAX_PAYLOAD_SIZE + 1];
    let mut mc = MsgControl::default();
    assert_eq!(
        group.send(&payload, &mut mc),
        Err(GroupError::InvalidParam("payload exceeds live maximum"))
    );
}

// SPEC_FULL S-E: the member snapshot carries addresses, status and both
// per-direction results.
#[test]
fn group_data_reports_member_metadata() {
    let (registry, group) = setup(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1.clone());
    registry.register(m2.clone());
    group.add_member(1, 3, Some(77)).expect("add m1");
    group.add_member(2, 4, None).expect("add m2");
    group
        .set_opt(ConfigItem::from_i32(OPT_RCV_TIMEOUT, 2000))
        .expect("rcv timeout");

    let mut mc = MsgControl::default();
    group.send(b"hello", &mut mc).expect("send");
    group.provide_packet(1, SeqNo::NONE, pctrl(30), b"abc");
    let mut buf = [0u8; 64];
    group.recv(&mut buf, &mut mc).expect("recv");

    let data = group.group_data();
    assert_eq!(data.len(), 2);

    let first = &data[0];
    assert_eq!(first.link_id, 1);
    assert_eq!(first.token, 77);
    assert_eq!(first.weight, 3);
    assert_eq!(first.agent_addr, m1.local_addr());
    assert_eq!(first.peer_addr, m1.peer_addr());
    assert_eq!(first.last_status, LinkStatus::Connected);
    assert_eq!(first.snd_state, MemberState::Running);
    assert_eq!(first.snd_result, 5);
    assert_eq!(first.rcv_result, 3);

    let second = &data[1];
    assert_eq!(second.link_id, 2);
    assert_eq!(second.weight, 4);
    assert_eq!(second.snd_result, 5);
    // Nothing was ever delivered from the second member.
    assert_eq!(second.rcv_result, 0);
}

// SPEC_FULL S-C: a keepalive counts as a peer response, so a silent link
// does not qualify as unstable and trigger activation of the standby.
#[test]
fn keepalive_keeps_silent_link_stable() {
    let (registry, group) = setup(GroupType::Backup);
    let p = MockLink::connected(1);
    let b = MockLink::connected(2);
    registry.register(p.clone());
    registry.register(b.clone());
    group.add_member(1, 10, None).expect("add primary");
    group.add_member(2, 5, None).expect("add backup");

    let mut mc = MsgControl::default();
    group.send(b"m1", &mut mc).expect("send m1");
    assert_eq!(member_state(&group, 1), MemberState::Running);

    // The link itself has been silent far past the stability timeout, but
    // a keepalive just arrived: the next send must not activate the standby.
    p.set_response_age(Duration::from_millis(500));
    group.handle_keepalive(1);
    group.send(b"m2", &mut mc).expect("send m2");
    assert_eq!(member_state(&group, 2), MemberState::Idle);
    assert!(b.sent().is_empty());

    // Once the keepalive itself is stale, instability kicks in again.
    thread::sleep(Duration::from_millis(80));
    group.send(b"m3", &mut mc).expect("send m3");
    assert_eq!(member_state(&group, 2), MemberState::Running);
    assert!(!b.sent().is_empty());
}

// SPEC_FULL S-H: waiter registration and readiness propagation reach the
// notification primitive.
#[test]
fn waiter_registration_reaches_notifier() {
    let (_registry, notifier, group) = setup_with_notifier(GroupType::Broadcast);

    group.register_waiter(5);
    group.unregister_waiter(5);

    assert_eq!(
        notifier.events(),
        vec!["register:5:100".to_string(), "unregister:5:100".to_string()]
    );
}

#[test]
fn update_read_state_signals_fresh_data_only() {
    let (registry, notifier, group) = setup_with_notifier(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");
    group
        .set_opt(ConfigItem::from_i32(OPT_RCV_TIMEOUT, 2000))
        .expect("rcv timeout");

    group.provide_packet(1, SeqNo::NONE, pctrl(5), b"five");
    let mut buf = [0u8; 64];
    let mut mc = MsgControl::default();
    group.recv(&mut buf, &mut mc).expect("recv 5");

    // Data at or below the delivered base is not news.
    let reads = notifier.count("read:");
    group.update_read_state(1, SeqNo::new(4));
    assert_eq!(notifier.count("read:"), reads);

    group.update_read_state(1, SeqNo::new(6));
    assert_eq!(notifier.count("read:"), reads + 1);
}

#[test]
fn update_write_state_signals_writability() {
    let (registry, notifier, group) = setup_with_notifier(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    registry.register(m1);
    group.add_member(1, 1, None).expect("add m1");

    let mut mc = MsgControl::default();
    group.send(b"x", &mut mc).expect("send");
    let writes = notifier.count("write:");

    group.update_write_state();
    assert_eq!(notifier.count("write:"), writes + 1);
}

#[test]
fn update_failed_link_signals_when_last_member_dies() {
    let (registry, notifier, group) = setup_with_notifier(GroupType::Broadcast);
    let m1 = MockLink::connected(1);
    let m2 = MockLink::connected(2);
    registry.register(m1);
    registry.register(m2);
    group.add_member(1, 1, None).expect("add m1");
    group.add_member(2, 1, None).expect("add m2");
    assert_eq!(group.status(), GroupStatus::Connected);

    // One member down: the group still has a live link, no error event.
    group.update_failed_link(1);
    assert_eq!(notifier.count("error:"), 0);
    assert_eq!(group.status(), GroupStatus::Connected);
    let failed = group
        .group_data()
        .into_iter()
        .find(|m| m.link_id == 1)
        .expect("member present");
    assert_eq!(failed.snd_state, MemberState::Broken);
    assert_eq!(failed.last_status, LinkStatus::Broken);

    // Last member down: error event and the group is no longer connected.
    group.update_failed_link(2);
    assert_eq!(notifier.count("error:"), 1);
    assert_eq!(group.status(), GroupStatus::Opened);
}
