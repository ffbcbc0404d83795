//! Session types

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::ConfigError;
use crate::identity::{DisplayNameTooLong, PeerId};
use crate::protocol::{TrackId, TrackPayload};
use crate::sync::{LocalPlaybackState, MasterState, Role, SyncError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid identity: {0}")]
    Identity(#[from] DisplayNameTooLong),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Session has ended")]
    Closed,
}

/// Point-in-time view of a session for UI
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub playback: LocalPlaybackState,
    pub master: Option<MasterState>,
    /// Current position, extrapolated or read from the engine
    pub position_seconds: f64,
    pub connected: bool,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Commands handled by the session actor
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Play {
        track_id: TrackId,
        position_seconds: f64,
        reply: Reply<Result<(), SyncError>>,
    },
    Pause {
        reply: Reply<Result<(), SyncError>>,
    },
    Seek {
        position_seconds: f64,
        reply: Reply<Result<(), SyncError>>,
    },
    ChangeTrack {
        track_id: TrackId,
        payload: Option<TrackPayload>,
        reply: Reply<Result<(), SyncError>>,
    },
    SetVisible {
        visible: bool,
    },
    State {
        reply: Reply<SessionSnapshot>,
    },
    Leave {
        reply: Reply<()>,
    },
}
