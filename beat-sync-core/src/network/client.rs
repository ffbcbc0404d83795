//! Relay Client
//!
//! Keeps one WebSocket connection to the relay open in a background task:
//! - JSON text frames in both directions
//! - reconnect with exponential backoff when the connection drops
//! - messages sent while disconnected are dropped (fire and forget)

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::protocol::CoordinationMessage;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Full URL including the session query
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&SessionConfig> for RelayClientConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            url: config.connect_url(),
            initial_backoff: config.reconnect_initial_backoff,
            max_backoff: config.reconnect_max_backoff,
        }
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Relay task closed")]
    Closed,
}

/// Events emitted by the relay client
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Connection (re)established
    Connected,
    /// Connection dropped; a reconnect is scheduled
    Disconnected { reason: String },
    /// Inbound text frame, not yet validated
    Message { text: String },
}

/// Commands sent to the relay client
#[derive(Debug)]
pub enum NetworkCommand {
    Send { message: CoordinationMessage },
    Shutdown,
}

/// Handle to control the relay client
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
    /// Handle wired to a caller-owned command receiver instead of a socket
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self { command_tx }, command_rx)
    }

    pub fn broadcast(&self, message: CoordinationMessage) -> Result<(), NetworkError> {
        self.command_tx
            .send(NetworkCommand::Send { message })
            .map_err(|_| NetworkError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(NetworkCommand::Shutdown);
    }
}

/// Outcome of one connected period
enum Pump {
    Shutdown,
    Closed(String),
}

pub struct RelayClient {
    config: RelayClientConfig,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self { config }
    }

    /// Spawn the connection task
    pub fn start(self) -> (NetworkHandle, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (handle, command_rx) = NetworkHandle::channel();

        tokio::spawn(async move {
            self.run(event_tx, command_rx).await;
        });

        (handle, event_rx)
    }

    async fn run(
        self,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        mut command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    ) {
        let mut backoff = self.config.initial_backoff;

        loop {
            debug!("Connecting to relay");
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!("Connected to relay");
                    backoff = self.config.initial_backoff;
                    let _ = event_tx.send(NetworkEvent::Connected);

                    match pump(stream, &event_tx, &mut command_rx).await {
                        Pump::Shutdown => {
                            info!("Relay client shut down");
                            return;
                        }
                        Pump::Closed(reason) => {
                            warn!("Relay connection lost: {}", reason);
                            let _ = event_tx.send(NetworkEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to relay: {}", e);
                }
            }

            debug!("Reconnecting in {:?}", backoff);
            if !wait_backoff(backoff, &mut command_rx).await {
                info!("Relay client shut down while disconnected");
                return;
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Shuttle frames until the connection ends or we are told to stop
async fn pump(
    stream: RelayStream,
    event_tx: &mpsc::UnboundedSender<NetworkEvent>,
    command_rx: &mut mpsc::UnboundedReceiver<NetworkCommand>,
) -> Pump {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(NetworkEvent::Message { text });
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        let _ = event_tx.send(NetworkEvent::Message { text });
                    }
                    Err(_) => debug!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by relay".to_string());
                    return Pump::Closed(reason);
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => return Pump::Closed(e.to_string()),
                None => return Pump::Closed("stream ended".to_string()),
            },
            command = command_rx.recv() => match command {
                Some(NetworkCommand::Send { message }) => match serde_json::to_string(&message) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            return Pump::Closed(e.to_string());
                        }
                    }
                    Err(e) => warn!("Failed to encode {}: {}", message.kind(), e),
                },
                Some(NetworkCommand::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Pump::Shutdown;
                }
            },
        }
    }
}

/// Sleep out a backoff period, dropping sends. Returns false on shutdown.
async fn wait_backoff(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<NetworkCommand>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            command = command_rx.recv() => match command {
                Some(NetworkCommand::Send { message }) => {
                    debug!("Not connected, dropping {}", message.kind());
                }
                Some(NetworkCommand::Shutdown) | None => return false,
            },
        }
    }
}
