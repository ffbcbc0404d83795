//! Multi-peer simulations over an in-memory bus

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::audio::testing::{EngineCall, FakeEngine};
use crate::audio::AudioError;
use crate::clock::{Clock, ManualClock};
use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::*;

const START: i64 = 1_700_000_000_000;

struct Peer {
    session: PeerSession<FakeEngine>,
    engine: FakeEngine,
    observer: Arc<RecordingObserver>,
}

fn id(name: &str) -> PeerId {
    PeerId::parse(&format!("peer_{:0>10}", name)).unwrap()
}

fn make_peer(name: &str, clock: &ManualClock) -> Peer {
    let engine = FakeEngine::default();
    let observer = Arc::new(RecordingObserver::new());
    let identity = PeerIdentity::new(id(name), Some(name.to_string())).unwrap();
    let session = PeerSession::new(
        identity,
        engine.clone(),
        Arc::new(clock.clone()),
        observer.clone(),
    );
    Peer {
        session,
        engine,
        observer,
    }
}

/// Delivery of one frame to one recipient
struct Delivery {
    to: usize,
    text: String,
}

struct Bus {
    peers: Vec<Peer>,
    clock: ManualClock,
    pending: VecDeque<Delivery>,
}

impl Bus {
    fn new(names: &[&str]) -> Self {
        let clock = ManualClock::new(START);
        let peers = names.iter().map(|name| make_peer(name, &clock)).collect();
        Self {
            peers,
            clock,
            pending: VecDeque::new(),
        }
    }

    /// Queue an outbox for every peer except the sender, like the relay does
    fn send(&mut self, from: usize, outbox: Outbox) {
        for message in outbox {
            let text = message.to_json().unwrap();
            for to in 0..self.peers.len() {
                if to != from {
                    self.pending.push_back(Delivery {
                        to,
                        text: text.clone(),
                    });
                }
            }
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let received = self.peers[delivery.to]
            .session
            .handle_text(&delivery.text)
            .unwrap();
        self.send(delivery.to, received.outbox);
    }

    /// Deliver in FIFO order until nothing is in flight
    fn settle(&mut self) {
        while let Some(delivery) = self.pending.pop_front() {
            self.deliver(delivery);
        }
    }

    /// Deliver in random order until nothing is in flight
    fn settle_shuffled(&mut self, rng: &mut StdRng) {
        let mut steps = 0;
        while !self.pending.is_empty() {
            steps += 1;
            assert!(steps < 100_000, "messages never settled");
            let index = rng.gen_range(0..self.pending.len());
            if let Some(delivery) = self.pending.remove(index) {
                self.deliver(delivery);
            }
        }
    }

    fn play(&mut self, peer: usize, track_id: TrackId, position: f64) {
        let outbox = self.peers[peer].session.play(track_id, position).unwrap();
        self.send(peer, outbox);
    }

    fn leaders(&self) -> Vec<usize> {
        (0..self.peers.len())
            .filter(|&i| self.peers[i].session.role() == Role::Leading)
            .collect()
    }
}

#[test]
fn test_first_play_claims_leadership() {
    let mut bus = Bus::new(&["a", "b", "c"]);
    bus.play(0, 7, 0.0);
    bus.settle();

    assert_eq!(bus.leaders(), vec![0]);
    assert!(bus.peers[0].engine.playing());
    assert!(!bus.peers[0].engine.muted());
    for follower in &bus.peers[1..] {
        assert_eq!(follower.session.role(), Role::Following);
        assert_eq!(follower.session.master_peer_id(), Some(&id("a")));
        assert_eq!(follower.session.playback().current_track_id, Some(7));
        assert!(follower.session.playback().is_playing_locally);
        assert!(follower.engine.muted());
        assert!(!follower.engine.playing());
    }
}

#[test]
fn test_follower_play_is_remote_control() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 0.0);
    bus.settle();
    let outbox = bus.peers[0].session.pause().unwrap();
    bus.send(0, outbox);
    bus.settle();
    assert!(!bus.peers[0].engine.playing());
    assert!(!bus.peers[1].session.playback().is_playing_locally);

    // B presses play: no claim, the leader resumes
    let outbox = bus.peers[1].session.play(7, 30.0).unwrap();
    let CoordinationMessage::Play(claim) = &outbox[0] else {
        panic!("expected play");
    };
    assert_eq!(claim.master_peer_id, Some(id("a")));
    bus.send(1, outbox);
    bus.settle();

    assert_eq!(bus.leaders(), vec![0]);
    assert_eq!(bus.peers[1].session.role(), Role::Following);
    assert!(bus.peers[0].engine.playing());
    assert_eq!(bus.peers[0].engine.calls().last(), Some(&EngineCall::Play(7, 30.0)));
}

#[test]
fn test_two_simultaneous_claims_converge() {
    let mut bus = Bus::new(&["a", "b"]);
    // Both press play before either hears the other
    bus.play(1, 3, 0.0);
    bus.play(0, 4, 0.0);
    bus.settle();

    assert_eq!(bus.leaders().len(), 1);
    let leader = bus.leaders()[0];
    let follower = 1 - leader;
    assert_eq!(
        bus.peers[follower].session.master_peer_id(),
        Some(bus.peers[leader].session.peer_id())
    );
    assert!(bus.peers[follower].engine.muted());
    assert!(!bus.peers[follower].engine.playing());
    // Same instant, so the smaller id wins
    assert_eq!(leader, 0);
    assert!(bus.peers[1]
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::LeadershipYielded { .. })));
}

#[test]
fn test_earlier_claim_wins_over_smaller_id() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(1, 3, 0.0);
    bus.clock.advance(Duration::from_millis(40));
    bus.play(0, 4, 0.0);
    bus.settle();

    assert_eq!(bus.leaders(), vec![1]);
    assert_eq!(bus.peers[0].session.master_peer_id(), Some(&id("b")));
    assert_eq!(bus.peers[0].session.playback().current_track_id, Some(3));
}

#[test]
fn test_random_claims_elect_one_leader() {
    for seed in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let names: Vec<String> = (0..5).map(|i| format!("p{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut bus = Bus::new(&names);

        let mut claims = Vec::new();
        for peer in 0..bus.peers.len() {
            if rng.gen_bool(0.6) || claims.is_empty() {
                bus.clock.advance(Duration::from_millis(rng.gen_range(0..3)));
                claims.push((bus.clock.now_ms(), bus.peers[peer].session.peer_id().clone()));
                bus.play(peer, 1 + peer as TrackId, 0.0);
            }
        }
        bus.settle_shuffled(&mut rng);

        let expected = claims.iter().min().map(|(_, id)| id.clone()).unwrap();
        let leaders = bus.leaders();
        assert_eq!(leaders.len(), 1, "seed {}", seed);
        assert_eq!(bus.peers[leaders[0]].session.peer_id(), &expected, "seed {}", seed);
        for peer in &bus.peers {
            assert_eq!(peer.session.master_peer_id(), Some(&expected), "seed {}", seed);
            assert_eq!(peer.engine.playing(), peer.session.role().is_leading());
        }
    }
}

#[test]
fn test_departure_and_reelection() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 0.0);
    bus.settle();

    let outbox = bus.peers[0].session.depart();
    let kinds: Vec<_> = outbox.iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, vec![MessageKind::Pause, MessageKind::MasterDeparted]);
    bus.send(0, outbox);
    bus.settle();

    assert_eq!(bus.peers[0].session.role(), Role::Unbound);
    assert!(!bus.peers[0].engine.playing());
    assert_eq!(bus.peers[1].session.role(), Role::Unbound);
    assert!(!bus.peers[1].session.playback().is_playing_locally);

    let outbox = bus.peers[1].session.play(7, 10.0).unwrap();
    assert_eq!(bus.peers[1].session.role(), Role::Leading);
    let CoordinationMessage::Play(claim) = &outbox[0] else {
        panic!("expected play");
    };
    assert_eq!(claim.sender_peer_id, id("b"));
    assert_eq!(claim.master_peer_id, Some(id("b")));
    assert!(bus.peers[1].engine.playing());
}

#[test]
fn test_departure_of_other_peer_is_ignored() {
    let mut bus = Bus::new(&["a", "b", "c"]);
    bus.play(0, 7, 0.0);
    bus.settle();

    let departed = CoordinationMessage::MasterDeparted(MasterDepartedMessage {
        sender_peer_id: Some(id("c")),
        ..Default::default()
    });
    assert!(bus.peers[1].session.receive(departed).is_empty());
    let anonymous = CoordinationMessage::MasterDeparted(MasterDepartedMessage::default());
    assert!(bus.peers[1].session.receive(anonymous).is_empty());
    assert_eq!(bus.peers[1].session.role(), Role::Following);
}

#[test]
fn test_late_play_for_departed_master_does_not_block_reelection() {
    let mut bus = Bus::new(&["a", "b", "c"]);
    bus.play(0, 7, 0.0);
    bus.settle();

    // b hears the departure right away, c only later
    let outbox = bus.peers[0].session.depart();
    bus.send(0, outbox);
    let (to_b, to_c): (Vec<_>, Vec<_>) = bus.pending.drain(..).partition(|d| d.to == 1);
    for delivery in to_b {
        bus.deliver(delivery);
    }
    assert_eq!(bus.peers[1].session.role(), Role::Unbound);

    // c still follows a, so its remote-control play names a as master
    let outbox = bus.peers[2].session.play(7, 12.0).unwrap();
    let CoordinationMessage::Play(claim) = &outbox[0] else {
        panic!("expected play");
    };
    assert_eq!(claim.master_peer_id, Some(id("a")));
    bus.send(2, outbox);
    bus.settle();

    assert_eq!(bus.peers[1].session.role(), Role::Unbound);
    assert!(bus.peers[1]
        .observer
        .events()
        .contains(&SyncEvent::DepartedClaimIgnored { claimant: id("a") }));

    for delivery in to_c {
        bus.deliver(delivery);
    }
    assert_eq!(bus.peers[2].session.role(), Role::Unbound);

    bus.play(1, 7, 20.0);
    bus.settle();

    assert_eq!(bus.leaders(), vec![1]);
    assert!(bus.peers[1].engine.playing());
    assert_eq!(bus.peers[2].session.master_peer_id(), Some(&id("b")));
}

#[test]
fn test_departure_is_forgotten_after_staleness_window() {
    let mut bus = Bus::new(&["a", "b"]);
    let departed = CoordinationMessage::MasterDeparted(MasterDepartedMessage {
        sender_peer_id: Some(id("a")),
        ..Default::default()
    });
    bus.peers[1].session.receive(departed);

    bus.clock.advance(Duration::from_secs(2 * 60 * 60));
    bus.play(0, 7, 0.0);
    bus.settle();
    assert_eq!(bus.peers[1].session.master_peer_id(), Some(&id("a")));
}

fn leader_snapshot(bus: &mut Bus, engine_position: f64) -> String {
    bus.peers[0].engine.set_position(engine_position);
    bus.peers[0].session.snapshot().unwrap().to_json().unwrap()
}

#[test]
fn test_drift_beyond_threshold_is_corrected() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 100.0);
    bus.settle();
    assert_eq!(bus.peers[1].session.local_position(), 100.0);

    let text = leader_snapshot(&mut bus, 101.4);
    bus.peers[1].session.handle_text(&text).unwrap();
    assert_eq!(bus.peers[1].session.local_position(), 101.4);
    assert!(bus.peers[1]
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::DriftCorrected { .. })));
}

#[test]
fn test_small_drift_is_left_alone() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 100.0);
    bus.settle();

    let text = leader_snapshot(&mut bus, 100.3);
    bus.peers[1].session.handle_text(&text).unwrap();
    assert_eq!(bus.peers[1].session.local_position(), 100.0);
}

#[test]
fn test_snapshot_reapplication_is_idempotent() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("b", &clock);
    let snapshot = CoordinationMessage::StateSnapshot(StateSnapshotMessage {
        track_id: 9,
        sender_peer_id: id("a"),
        timestamp: START,
        is_playing: true,
        position_seconds: Some(42.0),
        track_payload: None,
        master_peer_id: Some(id("a")),
        master_since: Some(START - 1_000),
    });

    peer.session.receive(snapshot.clone());
    let once = peer.session.playback().clone();
    assert_eq!(once.role, Role::Following);
    assert_eq!(once.position_seconds, 42.0);

    peer.session.receive(snapshot);
    assert_eq!(peer.session.playback(), &once);
}

#[test]
fn test_paused_snapshot_is_accepted_wholesale() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("b", &clock);
    let mut payload = TrackPayload::new();
    payload.insert("title".into(), "Night Drive".into());

    let text = serde_json::json!({
        "type": "stateSnapshot",
        "trackId": 12,
        "senderPeerId": id("a").as_str(),
        "timestamp": START,
        "isPlaying": false,
        "trackPayload": payload,
    })
    .to_string();
    peer.session.handle_text(&text).unwrap();

    assert_eq!(peer.session.role(), Role::Following);
    assert_eq!(peer.session.playback().current_track_id, Some(12));
    assert!(!peer.session.playback().is_playing_locally);
    assert_eq!(peer.session.track_payload(), Some(&payload));
    assert!(!peer.engine.playing());
}

#[test]
fn test_only_leader_answers_state_requests() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 5.0);
    bus.settle();

    let from_leader = bus.peers[0]
        .session
        .receive(CoordinationMessage::RequestState);
    assert_eq!(from_leader.len(), 1);
    let CoordinationMessage::StateSnapshot(snapshot) = &from_leader[0] else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.master_peer_id, Some(id("a")));
    assert!(snapshot.is_playing);

    let from_follower = bus.peers[1]
        .session
        .receive(CoordinationMessage::RequestState);
    assert!(from_follower.is_empty());
}

#[test]
fn test_echo_is_ignored() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("a", &clock);
    let outbox = peer.session.play(7, 0.0).unwrap();
    let before = peer.session.playback().clone();
    let calls = peer.engine.calls().len();

    let echo = outbox[0].to_json().unwrap();
    let received = peer.session.handle_text(&echo).unwrap();
    assert!(received.outbox.is_empty());
    assert_eq!(peer.session.playback(), &before);
    assert_eq!(peer.engine.calls().len(), calls);
}

#[test]
fn test_invalid_frame_is_reported() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("a", &clock);
    let stale = serde_json::json!({
        "type": "seek",
        "trackId": 1,
        "timestamp": START - 2 * 60 * 60 * 1000,
        "positionSeconds": 3,
    })
    .to_string();

    assert!(matches!(
        peer.session.handle_text(&stale),
        Err(ValidationError::Stale { .. })
    ));
    assert!(matches!(
        peer.observer.events().last(),
        Some(SyncEvent::MessageRejected { .. })
    ));
    assert_eq!(peer.session.role(), Role::Unbound);
}

#[test]
fn test_playback_failure_keeps_play_state() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("a", &clock);
    peer.engine.fail_next_play(AudioError::Blocked("autoplay".into()));

    let outbox = peer.session.play(7, 0.0).unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(peer.session.role(), Role::Leading);
    assert!(peer.session.playback().is_playing_locally);
    assert!(!peer.engine.playing());
    assert!(peer
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, SyncEvent::PlaybackStartFailed { track_id: 7, .. })));
}

#[test]
fn test_remote_pause_and_seek_drive_leader_engine() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 0.0);
    bus.settle();

    let outbox = bus.peers[1].session.seek(60.0).unwrap();
    bus.send(1, outbox);
    bus.settle();
    assert!(bus.peers[0].engine.calls().contains(&EngineCall::Seek(60.0)));

    let outbox = bus.peers[1].session.pause().unwrap();
    bus.send(1, outbox);
    bus.settle();
    assert!(!bus.peers[0].engine.playing());
    assert!(!bus.peers[0].session.playback().is_playing_locally);
}

#[test]
fn test_track_change_restarts_leader() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 50.0);
    bus.settle();

    let outbox = bus.peers[1].session.change_track(8, None).unwrap();
    bus.send(1, outbox);
    bus.settle();

    assert_eq!(bus.peers[0].engine.calls().last(), Some(&EngineCall::Play(8, 0.0)));
    assert_eq!(bus.peers[0].session.playback().current_track_id, Some(8));
}

#[test]
fn test_seek_for_other_track_is_ignored() {
    let mut bus = Bus::new(&["a", "b"]);
    bus.play(0, 7, 10.0);
    bus.settle();

    let stray = CoordinationMessage::Seek(SeekMessage {
        track_id: 99,
        timestamp: START,
        position_seconds: 500.0,
        sender_peer_id: None,
    });
    bus.peers[1].session.receive(stray);
    assert_eq!(bus.peers[1].session.local_position(), 10.0);
}

#[test]
fn test_connection_loss_unbinds_leader() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("a", &clock);
    peer.session.play(7, 0.0).unwrap();
    peer.session.connection_lost();

    assert_eq!(peer.session.role(), Role::Unbound);
    assert!(!peer.engine.playing());
    assert!(peer.engine.muted());
    assert!(peer.session.master_state().is_none());
}

#[test]
fn test_local_action_preconditions() {
    let clock = ManualClock::new(START);
    let mut peer = make_peer("a", &clock);
    assert_eq!(peer.session.play(0, 0.0), Err(SyncError::InvalidTrackId));
    assert_eq!(
        peer.session.play(1, 86_400.0),
        Err(SyncError::PositionOutOfRange(86_400.0))
    );
    assert_eq!(peer.session.pause(), Err(SyncError::NoTrack));
    assert!(peer.session.seek(f64::NAN).is_err());
    assert_eq!(peer.session.role(), Role::Unbound);
}
