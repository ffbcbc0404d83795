//! Session actor
//!
//! One task owns the peer session and multiplexes local commands, relay
//! events and the lifecycle timers.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::types::{SessionCommand, SessionSnapshot};
use crate::audio::AudioEngine;
use crate::config::SessionConfig;
use crate::network::{NetworkEvent, NetworkHandle};
use crate::protocol::{CoordinationMessage, MessageKind, RelayNotice};
use crate::sync::{Outbox, PeerSession, SyncError, SyncEvent, SyncObserver};

pub(crate) struct SessionActor<A> {
    peer: PeerSession<A>,
    config: SessionConfig,
    network: NetworkHandle,
    observer: Arc<dyn SyncObserver>,
    connected: bool,
    transport_open: bool,
    /// Next periodic snapshot, armed only while leading
    rebroadcast_at: Option<Instant>,
    /// Pending retry of the state request
    resync_at: Option<Instant>,
    /// When an ongoing disconnect becomes a lost connection
    disconnect_at: Option<Instant>,
}

/// Resolves at `deadline`, or never when there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<A: AudioEngine> SessionActor<A> {
    pub(crate) fn new(
        peer: PeerSession<A>,
        config: SessionConfig,
        network: NetworkHandle,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            peer,
            config,
            network,
            observer,
            connected: false,
            transport_open: true,
            rebroadcast_at: None,
            resync_at: None,
            disconnect_at: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) {
        info!("Session actor started for {}", self.peer.peer_id());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Leave { reply }) => {
                        self.leave();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.leave();
                        break;
                    }
                },
                event = events.recv(), if self.transport_open => match event {
                    Some(event) => self.handle_network_event(event),
                    None => {
                        warn!("Relay transport task ended");
                        self.transport_open = false;
                        self.handle_network_event(NetworkEvent::Disconnected {
                            reason: "transport closed".to_string(),
                        });
                    }
                },
                _ = wait_until(self.rebroadcast_at) => self.on_rebroadcast(),
                _ = wait_until(self.resync_at) => self.on_resync_retry(),
                _ = wait_until(self.disconnect_at) => self.on_disconnect_timeout(),
            }
            self.sync_rebroadcast_timer();
        }

        info!("Session actor stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Play {
                track_id,
                position_seconds,
                reply,
            } => {
                let result = self.peer.play(track_id, position_seconds);
                let _ = reply.send(self.flush(result));
            }
            SessionCommand::Pause { reply } => {
                let result = self.peer.pause();
                let _ = reply.send(self.flush(result));
            }
            SessionCommand::Seek {
                position_seconds,
                reply,
            } => {
                let result = self.peer.seek(position_seconds);
                let _ = reply.send(self.flush(result));
            }
            SessionCommand::ChangeTrack {
                track_id,
                payload,
                reply,
            } => {
                let result = self.peer.change_track(track_id, payload);
                let _ = reply.send(self.flush(result));
            }
            SessionCommand::SetVisible { visible } => self.set_visible(visible),
            SessionCommand::State { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            SessionCommand::Leave { .. } => {}
        }
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected => {
                self.connected = true;
                self.disconnect_at = None;
                self.observer.on_event(&SyncEvent::RelayConnected);
                // Whatever we knew may be stale; ask for the current state
                self.request_state();
                if let Some(snapshot) = self.peer.snapshot() {
                    self.send(snapshot);
                }
            }
            NetworkEvent::Disconnected { reason } => {
                self.connected = false;
                self.resync_at = None;
                self.observer
                    .on_event(&SyncEvent::RelayDisconnected { reason });
                if self.disconnect_at.is_none() {
                    self.disconnect_at = Some(Instant::now() + self.config.disconnect_timeout);
                }
            }
            NetworkEvent::Message { text } => self.handle_inbound(&text),
        }
    }

    fn handle_inbound(&mut self, text: &str) {
        if let Some(RelayNotice::RelayError { reason }) = RelayNotice::parse(text) {
            warn!("Relay rejected one of our messages: {}", reason);
            self.observer.on_event(&SyncEvent::RelayDiagnostic { reason });
            return;
        }

        // Rejections are already reported through the observer
        if let Ok(received) = self.peer.handle_text(text) {
            if received.kind == MessageKind::StateSnapshot && self.resync_at.take().is_some() {
                debug!("State received, cancelling resync retry");
            }
            self.send_all(received.outbox);
        }
    }

    fn set_visible(&mut self, visible: bool) {
        if !visible {
            debug!("Hidden");
            return;
        }
        match self.peer.snapshot() {
            Some(snapshot) => self.send(snapshot),
            None if !self.peer.role().is_leading() => self.request_state(),
            None => debug!("Leading without a track, nothing to rebroadcast"),
        }
    }

    /// Ask the leader for its state and arm the single retry
    fn request_state(&mut self) {
        self.send(self.peer.request_state());
        self.resync_at = Some(Instant::now() + self.config.resync_retry_delay);
    }

    fn on_resync_retry(&mut self) {
        self.resync_at = None;
        debug!("No state received yet, retrying request");
        self.send(self.peer.request_state());
    }

    fn on_rebroadcast(&mut self) {
        self.rebroadcast_at = Some(Instant::now() + self.config.rebroadcast_interval);
        if let Some(snapshot) = self.peer.snapshot() {
            self.send(snapshot);
        }
    }

    fn on_disconnect_timeout(&mut self) {
        self.disconnect_at = None;
        warn!(
            "Relay unreachable for {:?}, giving up on the current master",
            self.config.disconnect_timeout
        );
        self.observer.on_event(&SyncEvent::ConnectionLost);
        self.peer.connection_lost();
    }

    /// Keep the rebroadcast timer armed exactly while leading
    fn sync_rebroadcast_timer(&mut self) {
        let leading = self.peer.role().is_leading();
        match (leading, self.rebroadcast_at) {
            (true, None) => {
                self.rebroadcast_at = Some(Instant::now() + self.config.rebroadcast_interval);
            }
            (false, Some(_)) => {
                debug!("No longer leading, stopping rebroadcast");
                self.rebroadcast_at = None;
            }
            _ => {}
        }
    }

    fn leave(&mut self) {
        info!("Leaving session");
        let outbox = self.peer.depart();
        self.send_all(outbox);
        self.resync_at = None;
        self.disconnect_at = None;
        self.rebroadcast_at = None;
        // Queued behind the handover messages
        self.network.shutdown();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer_id: self.peer.peer_id().clone(),
            role: self.peer.role(),
            playback: self.peer.playback().clone(),
            master: self.peer.master_state(),
            position_seconds: self.peer.local_position(),
            connected: self.connected,
        }
    }

    fn flush(&mut self, result: Result<Outbox, SyncError>) -> Result<(), SyncError> {
        let outbox = result?;
        self.send_all(outbox);
        Ok(())
    }

    fn send_all(&self, outbox: Outbox) {
        for message in outbox {
            self.send(message);
        }
    }

    fn send(&self, message: CoordinationMessage) {
        let kind = message.kind();
        if let Err(e) = self.network.broadcast(message) {
            debug!("Dropping {}: {}", kind, e);
        }
    }
}
