//! Session
//!
//! Async handle around one peer session. All state lives in a single actor
//! task; the handle only sends commands to it.

mod actor;
mod types;


pub use types::{SessionError, SessionSnapshot};

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use self::actor::SessionActor;
use self::types::SessionCommand;
use crate::audio::AudioEngine;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::identity::{PeerId, PeerIdentity};
use crate::network::{NetworkEvent, NetworkHandle, RelayClient, RelayClientConfig};
use crate::protocol::{TrackId, TrackPayload};
use crate::sync::{PeerSession, SyncObserver};

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    peer_id: PeerId,
}

impl SessionHandle {
    /// Join a session through the configured relay. Must be called inside a
    /// tokio runtime.
    pub fn connect<A>(
        config: SessionConfig,
        audio: A,
        observer: Arc<dyn SyncObserver>,
    ) -> Result<Self, SessionError>
    where
        A: AudioEngine + 'static,
    {
        config.validate()?;
        let identity = PeerIdentity::generate(config.display_name.clone())?;
        info!(
            "Joining session {} via {} as {}",
            config.session_id,
            config.relay_url,
            identity.peer_id()
        );

        let (network, events) = RelayClient::new(RelayClientConfig::from(&config)).start();
        Ok(Self::spawn(
            config,
            identity,
            audio,
            observer,
            Arc::new(SystemClock),
            network,
            events,
        ))
    }

    /// Run a session over any transport that speaks [`NetworkEvent`]s
    pub fn spawn<A>(
        config: SessionConfig,
        identity: PeerIdentity,
        audio: A,
        observer: Arc<dyn SyncObserver>,
        clock: Arc<dyn Clock>,
        network: NetworkHandle,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Self
    where
        A: AudioEngine + 'static,
    {
        let peer_id = identity.peer_id().clone();
        let peer = PeerSession::new(identity, audio, clock, Arc::clone(&observer))
            .with_drift_threshold(config.drift_threshold_seconds);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let actor = SessionActor::new(peer, config, network, observer);
        tokio::spawn(actor.run(command_rx, events));

        Self {
            command_tx,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub async fn play(&self, track_id: TrackId, position_seconds: f64) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Play {
            track_id,
            position_seconds,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Pause { reply }).await??;
        Ok(())
    }

    pub async fn seek(&self, position_seconds: f64) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Seek {
            position_seconds,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn change_track(
        &self,
        track_id: TrackId,
        payload: Option<TrackPayload>,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ChangeTrack {
            track_id,
            payload,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Report that the host UI became visible or hidden
    pub fn set_visible(&self, visible: bool) -> Result<(), SessionError> {
        self.command_tx
            .send(SessionCommand::SetVisible { visible })
            .map_err(|_| SessionError::Closed)
    }

    pub async fn state(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    /// Hand over leadership if we hold it, then stop the session
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Leave { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)
    }
}
