//! Peer Session
//!
//! Owns one peer's local playback state and its belief about who the session
//! master is. Local actions and inbound messages both go through here, and
//! every operation returns the messages this peer wants broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::observer::{SyncEvent, SyncObserver};
use super::state::{
    claim_precedes, clamp_position, LocalPlaybackState, MasterBelief, MasterState, Role,
};
use crate::audio::AudioEngine;
use crate::clock::Clock;
use crate::identity::{PeerId, PeerIdentity};
use crate::protocol::*;

/// Followers snap to the leader once they drift further than this
pub const DEFAULT_DRIFT_THRESHOLD_SECONDS: f64 = 1.0;

/// Messages queued for broadcast
pub type Outbox = Vec<CoordinationMessage>;

/// Preconditions of local actions
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("track id must be positive")]
    InvalidTrackId,
    #[error("position {0}s is outside [0, 86400)")]
    PositionOutOfRange(f64),
    #[error("no track selected")]
    NoTrack,
}

/// Result of handling one inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub kind: MessageKind,
    pub outbox: Outbox,
}

pub struct PeerSession<A> {
    identity: PeerIdentity,
    playback: LocalPlaybackState,
    master: Option<MasterBelief>,
    track_payload: Option<TrackPayload>,
    /// Masters that announced their departure, with when we heard it
    departed: HashMap<PeerId, i64>,
    audio: A,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SyncObserver>,
    drift_threshold: f64,
}

impl<A: AudioEngine> PeerSession<A> {
    /// Create an unbound session. The engine starts muted.
    pub fn new(
        identity: PeerIdentity,
        mut audio: A,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        audio.set_muted(true);
        let now = clock.now_ms();
        Self {
            identity,
            playback: LocalPlaybackState::new(now),
            master: None,
            track_payload: None,
            departed: HashMap::new(),
            audio,
            clock,
            observer,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD_SECONDS,
        }
    }

    pub fn with_drift_threshold(mut self, seconds: f64) -> Self {
        self.drift_threshold = seconds;
        self
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn role(&self) -> Role {
        self.playback.role
    }

    pub fn playback(&self) -> &LocalPlaybackState {
        &self.playback
    }

    pub fn master_peer_id(&self) -> Option<&PeerId> {
        self.master.as_ref().map(|m| &m.peer_id)
    }

    pub fn master_belief(&self) -> Option<&MasterBelief> {
        self.master.as_ref()
    }

    pub fn track_payload(&self) -> Option<&TrackPayload> {
        self.track_payload.as_ref()
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    /// Current position: the engine's on the leader, extrapolated elsewhere
    pub fn local_position(&self) -> f64 {
        if self.playback.role.is_leading() {
            clamp_position(self.audio.position_seconds())
        } else {
            self.playback.position_at(self.now())
        }
    }

    pub fn master_state(&self) -> Option<MasterState> {
        self.master.as_ref().map(|master| MasterState {
            master_peer_id: master.peer_id.clone(),
            track_id: self.playback.current_track_id,
            is_playing: self.playback.is_playing_locally,
            position_seconds: self.local_position(),
            last_updated_at: master.last_updated_at,
        })
    }

    // === Local actions ===

    /// Start playback. Claims leadership when no master is recorded.
    pub fn play(&mut self, track_id: TrackId, position_seconds: f64) -> Result<Outbox, SyncError> {
        check_track_id(track_id)?;
        check_position(position_seconds)?;
        let now = self.now();

        if self.master.is_none() {
            info!("No master recorded, claiming leadership");
            self.set_master(Some(MasterBelief {
                peer_id: self.peer_id().clone(),
                since_ms: now,
                last_updated_at: now,
            }));
        }

        self.select_track(track_id);
        self.playback.is_playing_locally = true;
        self.playback.set_position(position_seconds, now);
        if self.playback.role.is_leading() {
            self.start_engine(track_id, position_seconds);
        }

        let master = self.master.as_ref();
        Ok(vec![CoordinationMessage::Play(PlayMessage {
            track_id,
            sender_peer_id: self.peer_id().clone(),
            timestamp: now,
            position_seconds,
            display_name: self.identity.display_name().map(str::to_string),
            master_peer_id: master.map(|m| m.peer_id.clone()),
            master_since: master.map(|m| m.since_ms),
        })])
    }

    pub fn pause(&mut self) -> Result<Outbox, SyncError> {
        let track_id = self.playback.current_track_id.ok_or(SyncError::NoTrack)?;
        let now = self.now();
        let position = self.local_position();

        if self.playback.role.is_leading() {
            self.audio.pause();
        }
        self.playback.is_playing_locally = false;
        self.playback.set_position(position, now);

        Ok(vec![CoordinationMessage::Pause(PauseMessage {
            track_id,
            timestamp: now,
            position_seconds: position,
            sender_peer_id: Some(self.peer_id().clone()),
        })])
    }

    pub fn seek(&mut self, position_seconds: f64) -> Result<Outbox, SyncError> {
        check_position(position_seconds)?;
        let track_id = self.playback.current_track_id.ok_or(SyncError::NoTrack)?;
        let now = self.now();

        if self.playback.role.is_leading() {
            self.audio.seek(position_seconds);
        }
        self.playback.set_position(position_seconds, now);

        Ok(vec![CoordinationMessage::Seek(SeekMessage {
            track_id,
            timestamp: now,
            position_seconds,
            sender_peer_id: Some(self.peer_id().clone()),
        })])
    }

    /// Switch to another track, keeping the play state
    pub fn change_track(
        &mut self,
        track_id: TrackId,
        payload: Option<TrackPayload>,
    ) -> Result<Outbox, SyncError> {
        check_track_id(track_id)?;
        let now = self.now();

        self.playback.current_track_id = Some(track_id);
        self.track_payload = payload.clone();
        self.playback.set_position(0.0, now);
        if self.playback.role.is_leading() && self.playback.is_playing_locally {
            self.start_engine(track_id, 0.0);
        }

        Ok(vec![CoordinationMessage::TrackChanged(TrackChangedMessage {
            track_id,
            timestamp: now,
            track_payload: payload,
            sender_peer_id: Some(self.peer_id().clone()),
        })])
    }

    pub fn request_state(&self) -> CoordinationMessage {
        CoordinationMessage::RequestState
    }

    /// Full state, only available while leading with a track selected
    pub fn snapshot(&self) -> Option<CoordinationMessage> {
        let master = self.master.as_ref().filter(|_| self.playback.role.is_leading())?;
        let track_id = self.playback.current_track_id?;

        self.observer.on_event(&SyncEvent::SnapshotBroadcast);
        Some(CoordinationMessage::StateSnapshot(StateSnapshotMessage {
            track_id,
            sender_peer_id: self.peer_id().clone(),
            timestamp: self.now(),
            is_playing: self.playback.is_playing_locally,
            position_seconds: Some(self.local_position()),
            track_payload: self.track_payload.clone(),
            master_peer_id: Some(master.peer_id.clone()),
            master_since: Some(master.since_ms),
        }))
    }

    /// Graceful handover before this peer goes away
    pub fn depart(&mut self) -> Outbox {
        let mut outbox = Vec::new();

        if self.playback.role.is_leading() {
            info!("Handing over master role before leaving");
            let now = self.now();
            let position = self.local_position();
            self.audio.pause();
            self.playback.is_playing_locally = false;
            self.playback.set_position(position, now);

            if let Some(track_id) = self.playback.current_track_id {
                outbox.push(CoordinationMessage::Pause(PauseMessage {
                    track_id,
                    timestamp: now,
                    position_seconds: position,
                    sender_peer_id: Some(self.peer_id().clone()),
                }));
            }
            outbox.push(CoordinationMessage::MasterDeparted(MasterDepartedMessage {
                sender_peer_id: Some(self.peer_id().clone()),
                track_id: self.playback.current_track_id,
                position_seconds: Some(position),
                timestamp: Some(now),
            }));
        }

        self.set_master(None);
        outbox
    }

    /// Relay unreachable for too long: forget the master, stop producing sound
    pub fn connection_lost(&mut self) {
        if self.master.is_none() {
            return;
        }
        warn!("Relay unreachable, dropping master belief");
        let now = self.now();
        self.anchor_position(now);
        self.playback.is_playing_locally = false;
        self.set_master(None);
    }

    // === Inbound messages ===

    /// Validate a raw frame and apply it
    pub fn handle_text(&mut self, text: &str) -> Result<Received, ValidationError> {
        let message = match validate_str(text, self.now()) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping invalid message: {}", e);
                self.observer.on_event(&SyncEvent::MessageRejected {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let kind = message.kind();
        let outbox = self.receive(message);
        Ok(Received { kind, outbox })
    }

    /// Apply an already validated message
    pub fn receive(&mut self, message: CoordinationMessage) -> Outbox {
        if message.sender() == Some(self.peer_id()) {
            debug!("Ignoring echo of our own {}", message.kind());
            return Vec::new();
        }

        match message {
            CoordinationMessage::Play(msg) => self.on_play(msg),
            CoordinationMessage::Pause(msg) => {
                self.on_pause(msg);
                Vec::new()
            }
            CoordinationMessage::Seek(msg) => {
                self.on_seek(msg);
                Vec::new()
            }
            CoordinationMessage::TrackChanged(msg) => {
                self.on_track_changed(msg);
                Vec::new()
            }
            CoordinationMessage::RequestState => {
                self.observer.on_event(&SyncEvent::StateRequested);
                self.snapshot().into_iter().collect()
            }
            CoordinationMessage::StateSnapshot(msg) => self.on_snapshot(msg),
            CoordinationMessage::MasterDeparted(msg) => {
                self.on_master_departed(msg);
                Vec::new()
            }
        }
    }

    fn on_play(&mut self, msg: PlayMessage) -> Outbox {
        let now = self.now();
        let claimed = msg.claimed_master().clone();
        if self.has_departed(&claimed, now) {
            // Sent by a peer that had not yet heard the departure
            debug!("Ignoring play naming departed master {}", claimed);
            self.observer.on_event(&SyncEvent::DepartedClaimIgnored { claimant: claimed });
            return Vec::new();
        }
        let known = self.master_peer_id().cloned();

        match known {
            None => {
                if &claimed == self.peer_id() {
                    // Someone still believes in us after we dropped the role
                    debug!("Ignoring play naming us as master while unbound");
                    return Vec::new();
                }
                info!("Adopting {} as master from play", claimed);
                self.set_master(Some(MasterBelief {
                    peer_id: claimed,
                    since_ms: msg.claimed_since(),
                    last_updated_at: now,
                }));
                self.mirror_play(msg.track_id, msg.position_seconds, now);
                Vec::new()
            }
            Some(current) if current == claimed => {
                self.touch_master(now);
                self.mirror_play(msg.track_id, msg.position_seconds, now);
                Vec::new()
            }
            Some(current) => {
                debug!("Ignoring play claim from {} (master is {})", claimed, current);
                self.observer.on_event(&SyncEvent::ClaimIgnored {
                    claimant: claimed,
                    current_master: current,
                });
                // Tell the competitor about us so it can yield right away
                self.snapshot().into_iter().collect()
            }
        }
    }

    fn on_pause(&mut self, msg: PauseMessage) {
        let now = self.now();
        self.touch_master(now);

        let same_track = self.playback.current_track_id == Some(msg.track_id);
        self.anchor_position(now);
        self.playback.is_playing_locally = false;
        if self.playback.role.is_leading() {
            self.audio.pause();
        }

        // A late pause for an earlier track still stops us, but must not move us
        if same_track || self.playback.current_track_id.is_none() {
            self.playback.current_track_id = Some(msg.track_id);
            self.playback.set_position(msg.position_seconds, now);
            if self.playback.role.is_leading() {
                self.audio.seek(msg.position_seconds);
            }
        }
    }

    fn on_seek(&mut self, msg: SeekMessage) {
        let now = self.now();
        if let Some(current) = self.playback.current_track_id {
            if current != msg.track_id {
                debug!("Ignoring seek for track {} (current {})", msg.track_id, current);
                return;
            }
        }
        self.touch_master(now);
        self.playback.current_track_id = Some(msg.track_id);
        self.playback.set_position(msg.position_seconds, now);
        if self.playback.role.is_leading() {
            self.audio.seek(msg.position_seconds);
        }
    }

    fn on_track_changed(&mut self, msg: TrackChangedMessage) {
        let now = self.now();
        self.touch_master(now);
        self.playback.current_track_id = Some(msg.track_id);
        self.track_payload = msg.track_payload;
        self.playback.set_position(0.0, now);
        if self.playback.role.is_leading() && self.playback.is_playing_locally {
            self.start_engine(msg.track_id, 0.0);
        }
    }

    fn on_snapshot(&mut self, msg: StateSnapshotMessage) -> Outbox {
        let now = self.now();
        let claimed = msg.claimed_master().clone();
        let since = msg.claimed_since();

        if &claimed == self.peer_id() {
            debug!("Ignoring snapshot naming us as master");
            return Vec::new();
        }
        if self.has_departed(&claimed, now) {
            debug!("Ignoring snapshot naming departed master {}", claimed);
            self.observer.on_event(&SyncEvent::DepartedClaimIgnored { claimant: claimed });
            return Vec::new();
        }

        let known = self.master.as_ref().map(|m| (m.peer_id.clone(), m.since_ms));
        match known {
            Some((current, _)) if current == claimed => {
                let drift_only = msg.is_playing
                    && self.playback.is_playing_locally
                    && self.playback.current_track_id == Some(msg.track_id);
                match msg.position_seconds.filter(|_| drift_only) {
                    Some(target) => {
                        self.touch_master(now);
                        self.correct_drift(target, now);
                    }
                    None => self.accept_snapshot(msg, claimed, since, now),
                }
                Vec::new()
            }
            Some((current, current_since)) => {
                if claim_precedes((since, &claimed), (current_since, &current)) {
                    if self.playback.role.is_leading() {
                        info!("Yielding leadership to {}", claimed);
                        self.observer.on_event(&SyncEvent::LeadershipYielded {
                            to: claimed.clone(),
                        });
                    } else {
                        info!("Switching master from {} to {}", current, claimed);
                    }
                    self.accept_snapshot(msg, claimed, since, now);
                    Vec::new()
                } else {
                    debug!("Ignoring snapshot from competing master {}", claimed);
                    self.observer.on_event(&SyncEvent::ClaimIgnored {
                        claimant: claimed,
                        current_master: current,
                    });
                    self.snapshot().into_iter().collect()
                }
            }
            None => {
                self.accept_snapshot(msg, claimed, since, now);
                Vec::new()
            }
        }
    }

    fn on_master_departed(&mut self, msg: MasterDepartedMessage) {
        let Some(departed) = msg.sender_peer_id else {
            debug!("Ignoring masterDeparted without sender");
            return;
        };
        let now = self.now();
        self.remember_departure(departed.clone(), now);
        if self.master_peer_id() != Some(&departed) {
            debug!("Ignoring departure of {} (not our master)", departed);
            return;
        }

        info!("Master {} departed", departed);
        self.anchor_position(now);
        self.playback.is_playing_locally = false;
        if let Some(track_id) = msg.track_id {
            self.playback.current_track_id = Some(track_id);
        }
        if let Some(position) = msg.position_seconds {
            self.playback.set_position(position, now);
        }
        self.set_master(None);
    }

    /// Take the snapshot wholesale
    fn accept_snapshot(&mut self, msg: StateSnapshotMessage, master: PeerId, since: i64, now: i64) {
        self.set_master(Some(MasterBelief {
            peer_id: master.clone(),
            since_ms: since,
            last_updated_at: now,
        }));

        self.select_track(msg.track_id);
        if msg.track_payload.is_some() {
            self.track_payload = msg.track_payload;
        }

        // Anchor before flipping the flag so a pause keeps elapsed time
        self.anchor_position(now);
        self.playback.is_playing_locally = msg.is_playing;
        if let Some(position) = msg.position_seconds.filter(|_| msg.is_playing) {
            self.playback.set_position(position, now);
        }

        self.observer.on_event(&SyncEvent::SnapshotApplied {
            master_peer_id: master,
        });
    }

    fn correct_drift(&mut self, target: f64, now: i64) {
        let local = self.playback.position_at(now);
        let drift = (local - target).abs();
        if drift > self.drift_threshold {
            info!("Drift {:.2}s exceeds threshold, jumping to {:.2}s", drift, target);
            self.playback.set_position(target, now);
            self.observer.on_event(&SyncEvent::DriftCorrected {
                from_seconds: local,
                to_seconds: target,
            });
        } else {
            debug!("Drift {:.2}s within threshold", drift);
        }
    }

    fn mirror_play(&mut self, track_id: TrackId, position_seconds: f64, now: i64) {
        self.select_track(track_id);
        self.playback.is_playing_locally = true;
        self.playback.set_position(position_seconds, now);
        if self.playback.role.is_leading() {
            self.start_engine(track_id, position_seconds);
        }
    }

    /// Switching tracks invalidates the payload of the previous one
    fn select_track(&mut self, track_id: TrackId) {
        if self.playback.current_track_id != Some(track_id) {
            self.track_payload = None;
        }
        self.playback.current_track_id = Some(track_id);
    }

    fn start_engine(&mut self, track_id: TrackId, position_seconds: f64) {
        if let Err(e) = self.audio.play(track_id, position_seconds) {
            // UI keeps showing play; the user can retry by hand
            warn!("Failed to start playback of track {}: {}", track_id, e);
            self.observer.on_event(&SyncEvent::PlaybackStartFailed {
                track_id,
                reason: e.to_string(),
            });
        }
    }

    /// Re-anchor at the current position so later flag changes keep it
    fn anchor_position(&mut self, now: i64) {
        if self.playback.role.is_leading() {
            let position = self.audio.position_seconds();
            self.playback.set_position(position, now);
        } else {
            self.playback.freeze(now);
        }
    }

    /// Late claims for a departed master stay valid on the wire for the
    /// staleness window, so remember the departure at least that long
    fn remember_departure(&mut self, peer_id: PeerId, now: i64) {
        self.departed.retain(|_, at| now - *at <= MAX_PAST_SKEW_MS);
        self.departed.insert(peer_id, now);
    }

    fn has_departed(&self, peer_id: &PeerId, now: i64) -> bool {
        self.departed
            .get(peer_id)
            .is_some_and(|at| now - *at <= MAX_PAST_SKEW_MS)
    }

    fn touch_master(&mut self, now: i64) {
        if let Some(master) = self.master.as_mut() {
            master.last_updated_at = now;
        }
    }

    /// Record a new master and derive the role from it
    fn set_master(&mut self, master: Option<MasterBelief>) {
        let previous_role = self.playback.role;
        let previous_master = self.master.as_ref().map(|m| m.peer_id.clone());
        let role = match &master {
            None => Role::Unbound,
            Some(m) if &m.peer_id == self.identity.peer_id() => Role::Leading,
            Some(_) => Role::Following,
        };

        match (&master, previous_master) {
            (Some(m), previous) if previous.as_ref() != Some(&m.peer_id) && role == Role::Following => {
                self.observer.on_event(&SyncEvent::MasterAdopted {
                    master_peer_id: m.peer_id.clone(),
                });
            }
            (None, Some(previous)) => {
                self.observer.on_event(&SyncEvent::MasterCleared {
                    previous_master: previous,
                });
            }
            _ => {}
        }
        self.master = master;

        if role == previous_role {
            return;
        }
        if previous_role.is_leading() {
            // Carry the engine position over as the anchor before going quiet
            let now = self.now();
            let position = self.audio.position_seconds();
            self.audio.pause();
            self.playback.set_position(position, now);
        }
        self.audio.set_muted(!role.is_leading());
        self.playback.role = role;

        info!("Role changed: {} -> {}", previous_role, role);
        self.observer.on_event(&SyncEvent::RoleChanged {
            from: previous_role,
            to: role,
        });
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }
}

fn check_track_id(track_id: TrackId) -> Result<(), SyncError> {
    if track_id == 0 {
        return Err(SyncError::InvalidTrackId);
    }
    Ok(())
}

fn check_position(position_seconds: f64) -> Result<(), SyncError> {
    if !(0.0..MAX_POSITION_SECONDS).contains(&position_seconds) {
        return Err(SyncError::PositionOutOfRange(position_seconds));
    }
    Ok(())
}
