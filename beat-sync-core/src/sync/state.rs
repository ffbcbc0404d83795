//! Local Playback State

use crate::identity::PeerId;
use crate::protocol::{TrackId, MAX_POSITION_SECONDS};
use std::fmt;

/// Largest position we ever hold internally, just below one day
const POSITION_CEILING: f64 = MAX_POSITION_SECONDS - 0.001;

/// Keep a position inside `[0, 86400)`
pub fn clamp_position(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return 0.0;
    }
    seconds.clamp(0.0, POSITION_CEILING)
}

/// Where this peer stands relative to the session master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// No master recorded
    Unbound,
    /// Mirroring another peer, muted
    Following,
    /// We are the master: unmuted and authoritative
    Leading,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unbound => "unbound",
            Role::Following => "following",
            Role::Leading => "leading",
        }
    }

    pub fn is_leading(&self) -> bool {
        matches!(self, Role::Leading)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-peer view of playback. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPlaybackState {
    /// Derived from the recorded master, see [`Role`]
    pub role: Role,
    /// Track currently selected in the session
    pub current_track_id: Option<TrackId>,
    /// Whether the session is playing (the engine only runs on the leader)
    pub is_playing_locally: bool,
    /// Position anchor in seconds
    pub position_seconds: f64,
    /// Wall-clock ms at which the anchor was taken
    pub position_updated_at: i64,
}

impl LocalPlaybackState {
    pub fn new(now_ms: i64) -> Self {
        Self {
            role: Role::Unbound,
            current_track_id: None,
            is_playing_locally: false,
            position_seconds: 0.0,
            position_updated_at: now_ms,
        }
    }

    /// Position extrapolated to `now_ms` while playing
    pub fn position_at(&self, now_ms: i64) -> f64 {
        if !self.is_playing_locally {
            return self.position_seconds;
        }
        let elapsed = (now_ms - self.position_updated_at).max(0) as f64 / 1000.0;
        clamp_position(self.position_seconds + elapsed)
    }

    pub fn set_position(&mut self, seconds: f64, now_ms: i64) {
        self.position_seconds = clamp_position(seconds);
        self.position_updated_at = now_ms;
    }

    /// Re-anchor at the current extrapolated position
    pub fn freeze(&mut self, now_ms: i64) {
        let position = self.position_at(now_ms);
        self.set_position(position, now_ms);
    }
}

/// What we believe about the current master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterBelief {
    /// Peer that holds the master role
    pub peer_id: PeerId,
    /// When that peer claimed leadership (Unix ms)
    pub since_ms: i64,
    /// Last time we heard anything from or about the master
    pub last_updated_at: i64,
}

impl MasterBelief {
    /// Whether a competing claim wins over this one
    pub fn is_superseded_by(&self, since_ms: i64, peer_id: &PeerId) -> bool {
        claim_precedes((since_ms, peer_id), (self.since_ms, &self.peer_id))
    }
}

/// Claims are totally ordered by `(since, peer id)`; the smaller pair wins
pub fn claim_precedes(candidate: (i64, &PeerId), current: (i64, &PeerId)) -> bool {
    candidate < current
}

/// The agreed session state as seen by one peer
#[derive(Debug, Clone, PartialEq)]
pub struct MasterState {
    pub master_peer_id: PeerId,
    pub track_id: Option<TrackId>,
    pub is_playing: bool,
    pub position_seconds: f64,
    pub last_updated_at: i64,
}
