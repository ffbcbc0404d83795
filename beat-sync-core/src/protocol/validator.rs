//! Message Validator
//!
//! Every inbound message passes through here before any peer state is
//! touched, at the relay and again at the client. Validation is
//! all-or-nothing: a message is either fully accepted or dropped with a
//! reason.

use serde_json::{Map, Value};
use thiserror::Error;

use super::message::*;
use crate::identity::{InvalidPeerId, PeerId, DISPLAY_NAME_MAX_LEN};

/// Oldest accepted timestamp, relative to now
pub const MAX_PAST_SKEW_MS: i64 = 60 * 60 * 1000;
/// Furthest accepted timestamp into the future
pub const MAX_FUTURE_SKEW_MS: i64 = 5_000;
/// Positions are seconds into a track, capped at one day
pub const MAX_POSITION_SECONDS: f64 = 86_400.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("missing `type` field")]
    MissingKind,
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{field}` out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
    #[error("field `{field}` is not a valid peer id: {source}")]
    MalformedPeerId {
        field: &'static str,
        source: InvalidPeerId,
    },
    #[error("timestamp {timestamp} is {skew_ms}ms away from now")]
    Stale { timestamp: i64, skew_ms: i64 },
}

/// Parse and validate a text frame
pub fn validate_str(text: &str, now_ms: i64) -> Result<CoordinationMessage, ValidationError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    validate_value(&value, now_ms)
}

/// Validate an already parsed JSON value. `now_ms` anchors the staleness window.
pub fn validate_value(value: &Value, now_ms: i64) -> Result<CoordinationMessage, ValidationError> {
    let map = value.as_object().ok_or(ValidationError::NotAnObject)?;
    let kind = match map.get("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "type",
                expected: "a string",
            })
        }
        None => return Err(ValidationError::MissingKind),
    };
    let kind =
        MessageKind::from_wire(kind).ok_or_else(|| ValidationError::UnknownKind(kind.clone()))?;

    let fields = Fields { map, now_ms };
    let message = match kind {
        MessageKind::Play => CoordinationMessage::Play(PlayMessage {
            track_id: fields.track_id()?,
            sender_peer_id: fields.peer_id("senderPeerId")?,
            timestamp: fields.timestamp()?,
            position_seconds: fields.position()?,
            display_name: fields.optional("displayName", display_name)?,
            master_peer_id: fields.optional_peer_id("masterPeerId")?,
            master_since: fields.master_since()?,
        }),
        MessageKind::Pause => CoordinationMessage::Pause(PauseMessage {
            track_id: fields.track_id()?,
            timestamp: fields.timestamp()?,
            position_seconds: fields.position()?,
            sender_peer_id: fields.optional_peer_id("senderPeerId")?,
        }),
        MessageKind::Seek => CoordinationMessage::Seek(SeekMessage {
            track_id: fields.track_id()?,
            timestamp: fields.timestamp()?,
            position_seconds: fields.position()?,
            sender_peer_id: fields.optional_peer_id("senderPeerId")?,
        }),
        MessageKind::TrackChanged => CoordinationMessage::TrackChanged(TrackChangedMessage {
            track_id: fields.track_id()?,
            timestamp: fields.timestamp()?,
            track_payload: fields.optional("trackPayload", track_payload)?,
            sender_peer_id: fields.optional_peer_id("senderPeerId")?,
        }),
        MessageKind::RequestState => CoordinationMessage::RequestState,
        MessageKind::StateSnapshot => {
            let is_playing = fields.required("isPlaying", boolean)?;
            // A paused snapshot carries no meaningful position
            let position_seconds = if is_playing {
                Some(fields.position()?)
            } else {
                None
            };
            CoordinationMessage::StateSnapshot(StateSnapshotMessage {
                track_id: fields.track_id()?,
                sender_peer_id: fields.peer_id("senderPeerId")?,
                timestamp: fields.timestamp()?,
                is_playing,
                position_seconds,
                track_payload: fields.optional("trackPayload", track_payload)?,
                master_peer_id: fields.optional_peer_id("masterPeerId")?,
                master_since: fields.master_since()?,
            })
        }
        MessageKind::MasterDeparted => CoordinationMessage::MasterDeparted(MasterDepartedMessage {
            sender_peer_id: fields.optional_peer_id("senderPeerId")?,
            track_id: fields.optional("trackId", track_id)?,
            position_seconds: fields.optional("positionSeconds", position)?,
            timestamp: match fields.get("timestamp") {
                Some(value) => Some(timestamp("timestamp", value, now_ms)?),
                None => None,
            },
        }),
    };
    Ok(message)
}

/// Field access over one message object. `null` counts as absent.
struct Fields<'a> {
    map: &'a Map<String, Value>,
    now_ms: i64,
}

type FieldParser<T> = fn(&'static str, &Value) -> Result<T, ValidationError>;

impl<'a> Fields<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|value| !value.is_null())
    }

    fn required<T>(&self, name: &'static str, parse: FieldParser<T>) -> Result<T, ValidationError> {
        let value = self.get(name).ok_or(ValidationError::MissingField(name))?;
        parse(name, value)
    }

    fn optional<T>(
        &self,
        name: &'static str,
        parse: FieldParser<T>,
    ) -> Result<Option<T>, ValidationError> {
        self.get(name).map(|value| parse(name, value)).transpose()
    }

    fn track_id(&self) -> Result<TrackId, ValidationError> {
        self.required("trackId", track_id)
    }

    fn position(&self) -> Result<f64, ValidationError> {
        self.required("positionSeconds", position)
    }

    fn peer_id(&self, name: &'static str) -> Result<PeerId, ValidationError> {
        self.required(name, peer_id)
    }

    fn optional_peer_id(&self, name: &'static str) -> Result<Option<PeerId>, ValidationError> {
        self.optional(name, peer_id)
    }

    fn timestamp(&self) -> Result<i64, ValidationError> {
        let value = self
            .get("timestamp")
            .ok_or(ValidationError::MissingField("timestamp"))?;
        timestamp("timestamp", value, self.now_ms)
    }

    fn master_since(&self) -> Result<Option<i64>, ValidationError> {
        let Some(value) = self.get("masterSince") else {
            return Ok(None);
        };
        let since = integer("masterSince", value)?;
        if since < 0 || since > self.now_ms + MAX_FUTURE_SKEW_MS {
            return Err(ValidationError::OutOfRange {
                field: "masterSince",
                detail: format!("{} is negative or in the future", since),
            });
        }
        Ok(Some(since))
    }
}

fn integer(field: &'static str, value: &Value) -> Result<i64, ValidationError> {
    let Value::Number(number) = value else {
        return Err(ValidationError::WrongType {
            field,
            expected: "an integer",
        });
    };
    if let Some(n) = number.as_i64() {
        Ok(n)
    } else if number.is_u64() {
        Err(ValidationError::OutOfRange {
            field,
            detail: format!("{} does not fit in 64 bits", number),
        })
    } else {
        Err(ValidationError::WrongType {
            field,
            expected: "an integer",
        })
    }
}

fn track_id(field: &'static str, value: &Value) -> Result<TrackId, ValidationError> {
    let id = integer(field, value)?;
    if id <= 0 {
        return Err(ValidationError::OutOfRange {
            field,
            detail: format!("{} is not positive", id),
        });
    }
    Ok(id as TrackId)
}

fn timestamp(field: &'static str, value: &Value, now_ms: i64) -> Result<i64, ValidationError> {
    let timestamp = integer(field, value)?;
    let skew_ms = timestamp.saturating_sub(now_ms);
    if skew_ms < -MAX_PAST_SKEW_MS || skew_ms > MAX_FUTURE_SKEW_MS {
        return Err(ValidationError::Stale { timestamp, skew_ms });
    }
    Ok(timestamp)
}

fn position(field: &'static str, value: &Value) -> Result<f64, ValidationError> {
    let seconds = value.as_f64().ok_or(ValidationError::WrongType {
        field,
        expected: "a number",
    })?;
    if !(0.0..=MAX_POSITION_SECONDS).contains(&seconds) {
        return Err(ValidationError::OutOfRange {
            field,
            detail: format!("{} is outside [0, 86400]", seconds),
        });
    }
    Ok(seconds)
}

fn boolean(field: &'static str, value: &Value) -> Result<bool, ValidationError> {
    value.as_bool().ok_or(ValidationError::WrongType {
        field,
        expected: "a boolean",
    })
}

fn peer_id(field: &'static str, value: &Value) -> Result<PeerId, ValidationError> {
    let raw = value.as_str().ok_or(ValidationError::WrongType {
        field,
        expected: "a string",
    })?;
    PeerId::parse(raw).map_err(|source| ValidationError::MalformedPeerId { field, source })
}

fn display_name(field: &'static str, value: &Value) -> Result<String, ValidationError> {
    let name = value.as_str().ok_or(ValidationError::WrongType {
        field,
        expected: "a string",
    })?;
    let length = name.chars().count();
    if length > DISPLAY_NAME_MAX_LEN {
        return Err(ValidationError::OutOfRange {
            field,
            detail: format!("{} characters, at most {} allowed", length, DISPLAY_NAME_MAX_LEN),
        });
    }
    Ok(name.to_string())
}

fn track_payload(field: &'static str, value: &Value) -> Result<TrackPayload, ValidationError> {
    value
        .as_object()
        .cloned()
        .ok_or(ValidationError::WrongType {
            field,
            expected: "an object",
        })
}
