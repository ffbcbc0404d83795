//! Coordination Messages

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::identity::PeerId;

/// Catalogue id of a track. Always positive on the wire.
pub type TrackId = u64;

/// Opaque track metadata carried alongside a track change
pub type TrackPayload = Map<String, Value>;

/// Discriminator of a coordination message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Play,
    Pause,
    Seek,
    TrackChanged,
    RequestState,
    StateSnapshot,
    MasterDeparted,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Play => "play",
            MessageKind::Pause => "pause",
            MessageKind::Seek => "seek",
            MessageKind::TrackChanged => "trackChanged",
            MessageKind::RequestState => "requestState",
            MessageKind::StateSnapshot => "stateSnapshot",
            MessageKind::MasterDeparted => "masterDeparted",
        }
    }

    pub fn from_wire(kind: &str) -> Option<Self> {
        Some(match kind {
            "play" => MessageKind::Play,
            "pause" => MessageKind::Pause,
            "seek" => MessageKind::Seek,
            "trackChanged" => MessageKind::TrackChanged,
            "requestState" => MessageKind::RequestState,
            "stateSnapshot" => MessageKind::StateSnapshot,
            "masterDeparted" => MessageKind::MasterDeparted,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start or resume playback. Doubles as a leadership claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayMessage {
    pub track_id: TrackId,
    pub sender_peer_id: PeerId,
    pub timestamp: i64,
    pub position_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Master the sender believes in. Absent means the sender itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_since: Option<i64>,
}

impl PlayMessage {
    pub fn claimed_master(&self) -> &PeerId {
        self.master_peer_id.as_ref().unwrap_or(&self.sender_peer_id)
    }

    pub fn claimed_since(&self) -> i64 {
        self.master_since.unwrap_or(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseMessage {
    pub track_id: TrackId,
    pub timestamp: i64,
    pub position_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekMessage {
    pub track_id: TrackId,
    pub timestamp: i64,
    pub position_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackChangedMessage {
    pub track_id: TrackId,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_payload: Option<TrackPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
}

/// Full state broadcast by the leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshotMessage {
    pub track_id: TrackId,
    pub sender_peer_id: PeerId,
    pub timestamp: i64,
    pub is_playing: bool,
    /// Only meaningful while `is_playing`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_payload: Option<TrackPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_since: Option<i64>,
}

impl StateSnapshotMessage {
    pub fn claimed_master(&self) -> &PeerId {
        self.master_peer_id.as_ref().unwrap_or(&self.sender_peer_id)
    }

    pub fn claimed_since(&self) -> i64 {
        self.master_since.unwrap_or(self.timestamp)
    }
}

/// Sent by a leader that is about to go away
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterDepartedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Messages exchanged between peers of one listening session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinationMessage {
    Play(PlayMessage),
    Pause(PauseMessage),
    Seek(SeekMessage),
    TrackChanged(TrackChangedMessage),
    RequestState,
    StateSnapshot(StateSnapshotMessage),
    MasterDeparted(MasterDepartedMessage),
}

impl CoordinationMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            CoordinationMessage::Play(_) => MessageKind::Play,
            CoordinationMessage::Pause(_) => MessageKind::Pause,
            CoordinationMessage::Seek(_) => MessageKind::Seek,
            CoordinationMessage::TrackChanged(_) => MessageKind::TrackChanged,
            CoordinationMessage::RequestState => MessageKind::RequestState,
            CoordinationMessage::StateSnapshot(_) => MessageKind::StateSnapshot,
            CoordinationMessage::MasterDeparted(_) => MessageKind::MasterDeparted,
        }
    }

    /// Peer that sent this message, when the message says so
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            CoordinationMessage::Play(m) => Some(&m.sender_peer_id),
            CoordinationMessage::Pause(m) => m.sender_peer_id.as_ref(),
            CoordinationMessage::Seek(m) => m.sender_peer_id.as_ref(),
            CoordinationMessage::TrackChanged(m) => m.sender_peer_id.as_ref(),
            CoordinationMessage::RequestState => None,
            CoordinationMessage::StateSnapshot(m) => Some(&m.sender_peer_id),
            CoordinationMessage::MasterDeparted(m) => m.sender_peer_id.as_ref(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages the relay itself originates. Never fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayNotice {
    RelayError { reason: String },
}

impl RelayNotice {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
