//! Audio engine seam
//!
//! The host application owns decoding and output. Only the leading peer
//! ever unmutes and drives its engine; followers keep theirs muted.

use thiserror::Error;

use crate::protocol::TrackId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AudioError {
    /// The platform refused to start audio (e.g. autoplay policy)
    #[error("playback blocked: {0}")]
    Blocked(String),
    #[error("track {0} is unavailable")]
    TrackUnavailable(TrackId),
    #[error("audio engine error: {0}")]
    Engine(String),
}

pub trait AudioEngine: Send {
    /// Load `track_id` if needed and start playing from `position_seconds`
    fn play(&mut self, track_id: TrackId, position_seconds: f64) -> Result<(), AudioError>;
    fn pause(&mut self);
    fn seek(&mut self, position_seconds: f64);
    fn is_playing(&self) -> bool;
    fn position_seconds(&self) -> f64;
    fn set_muted(&mut self, muted: bool);
}
