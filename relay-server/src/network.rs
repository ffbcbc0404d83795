//! Network handling for the relay server
//!
//! One task per WebSocket connection: authenticate the upgrade, then
//! validate every inbound frame and fan it out to the rest of the session.

use crate::auth::{self, AuthError, StaticTokens, TokenVerifier};
use crate::config::RelayConfig;
use crate::hub::{ConnectionId, Hub};
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use beat_sync_core::clock::current_time_ms;
use beat_sync_core::protocol::{validate_str, RelayNotice};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Events sent from network to dashboard
#[derive(Debug)]
pub enum NetworkEvent {
    Ready { addr: String },
}

/// Shared by every connection task
pub struct RelayState {
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Arc<RwLock<Metrics>>,
    pub max_message_bytes: usize,
}

impl RelayState {
    /// Validate one inbound frame and fan it out. Returns a diagnostic for
    /// the sender when the frame is rejected.
    pub fn relay_text(&self, session_id: &str, from: ConnectionId, text: &str) -> Option<String> {
        if text.len() > self.max_message_bytes {
            let reason = format!("message exceeds {} bytes", self.max_message_bytes);
            self.metrics.write().message_rejected(&reason);
            return Some(diagnostic(reason));
        }

        let message = match validate_str(text, current_time_ms()) {
            Ok(message) => message,
            Err(e) => {
                debug!("Rejected frame in {}: {}", session_id, e);
                self.metrics.write().message_rejected(&e.to_string());
                return Some(diagnostic(e.to_string()));
            }
        };

        // Forward the validated form so unknown fields never reach peers
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode validated {}: {}", message.kind(), e);
                return None;
            }
        };
        let outcome = self.hub.fan_out(session_id, from, &payload);
        debug!("Relayed {} in {} to {} peer(s)", message.kind(), session_id, outcome.delivered);
        if outcome.dropped > 0 {
            warn!(
                "{} lagging peer(s) in {} missed a {}",
                outcome.dropped,
                session_id,
                message.kind()
            );
        }
        self.metrics.write().message_relayed(
            message.kind().as_str(),
            payload.len(),
            outcome.delivered,
            outcome.dropped,
        );
        None
    }

    /// Frames above the limit are refused by the transport before they are buffered
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_bytes);
        config.max_frame_size = Some(self.max_message_bytes);
        config
    }
}

fn diagnostic(reason: String) -> String {
    serde_json::to_string(&RelayNotice::RelayError { reason })
        .unwrap_or_else(|_| r#"{"type":"relayError","reason":"invalid message"}"#.to_string())
}

fn refusal(error: &AuthError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Accept connections forever
pub async fn serve(listener: TcpListener, state: Arc<RelayState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New connection from {}", peer_addr);
                tokio::spawn(handle_connection(stream, peer_addr, Arc::clone(&state)));
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<RelayState>) {
    let mut outcome = None;
    let callback = |request: &Request, response: Response| {
        let result = auth::authenticate(request.uri().query(), state.verifier.as_ref());
        let reply = match &result {
            Ok(_) => Ok(response),
            Err(e) => Err(refusal(e)),
        };
        outcome = Some(result);
        reply
    };
    let ws_config = state.websocket_config();
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;

    let (ws_stream, session_id) = match (handshake, outcome) {
        (Ok(ws), Some(Ok(session_id))) => (ws, session_id),
        (_, Some(Err(e))) => {
            warn!("Refused handshake from {}: {}", peer_addr, e);
            state
                .metrics
                .write()
                .handshake_refused(&peer_addr.to_string(), &e.to_string());
            return;
        }
        (Err(e), _) => {
            debug!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
        (Ok(_), None) => return,
    };

    let (guard, mut outbound_rx) = state.hub.register(&session_id);
    let connection_id = guard.id();
    info!("Peer {} joined session {}", peer_addr, session_id);
    state.metrics.write().connection_established(
        connection_id,
        &session_id,
        peer_addr.to_string(),
        state.hub.session_count(),
    );

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => {
                let reply = match frame {
                    Some(Ok(Message::Text(text))) => state.relay_text(&session_id, connection_id, &text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => state.relay_text(&session_id, connection_id, &text),
                        Err(_) => Some(diagnostic("binary frames must be UTF-8 JSON".to_string())),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(tungstenite::Error::Capacity(e))) => {
                        warn!("Closing {}: {}", peer_addr, e);
                        state.metrics.write().message_rejected(&e.to_string());
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Receive error for {}: {}", peer_addr, e);
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if let Err(e) = write.send(Message::Text(reply)).await {
                        debug!("Send error for {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
            Some(outbound) = outbound_rx.recv() => {
                if let Err(e) = write.send(Message::Text(outbound)).await {
                    debug!("Send error for {}: {}", peer_addr, e);
                    break;
                }
            }
        }
    }

    drop(guard);
    info!("Peer {} left session {}", peer_addr, session_id);
    state
        .metrics
        .write()
        .connection_closed(connection_id, state.hub.session_count());
}

/// Run the relay with dashboard integration
pub async fn run_with_dashboard(
    metrics: Arc<RwLock<Metrics>>,
    config: RelayConfig,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
) -> Result<(), Box<dyn Error>> {
    info!("Beat Sync Relay starting...");

    let verifier = StaticTokens::new(config.tokens.clone());
    if verifier.is_empty() {
        warn!("RELAY_TOKENS is empty, every handshake will be refused");
        metrics
            .write()
            .log(LogLevel::Warning, "RELAY_TOKENS is empty, every handshake will be refused");
    }

    let listener = match TcpListener::bind(config.socket_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Failed to bind {}: {}", config.socket_addr(), e));
            return Err(e.into());
        }
    };
    let local_addr = listener.local_addr()?;

    {
        let mut m = metrics.write();
        m.listen_addr = Some(local_addr.to_string());
        m.token_count = verifier.len();
        m.max_message_bytes = config.max_message_bytes;
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on ws://{}", local_addr));
    }
    info!("Listening on ws://{}", local_addr);

    // Notify ready
    let _ = event_tx.send(NetworkEvent::Ready {
        addr: local_addr.to_string(),
    });

    let state = Arc::new(RelayState {
        hub: Arc::new(Hub::new()),
        verifier: Arc::new(verifier),
        metrics,
        max_message_bytes: config.max_message_bytes,
    });
    serve(listener, state).await;
    Ok(())
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    metrics: Arc<RwLock<Metrics>>,
    config: RelayConfig,
) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("beat_sync_relay=info".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .init();

    let (tx, _rx) = mpsc::unbounded_channel();
    run_with_dashboard(metrics, config, tx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    fn state(max_message_bytes: usize) -> RelayState {
        RelayState {
            hub: Arc::new(Hub::new()),
            verifier: Arc::new(StaticTokens::new(vec!["secret".to_string()])),
            metrics: Arc::new(RwLock::new(Metrics::new())),
            max_message_bytes,
        }
    }

    fn play_frame() -> String {
        json!({
            "type": "play",
            "trackId": 7,
            "senderPeerId": "peer_aaaaaaaaaaaa",
            "timestamp": current_time_ms(),
            "positionSeconds": 1.5,
            "smuggled": "field",
        })
        .to_string()
    }

    #[test]
    fn test_valid_frame_is_reserialized_and_fanned_out() {
        let state = state(64 * 1024);
        let (a, _a_rx) = state.hub.register("lounge");
        let (_b, mut b_rx) = state.hub.register("lounge");

        assert_eq!(state.relay_text("lounge", a.id(), &play_frame()), None);
        let forwarded: serde_json::Value =
            serde_json::from_str(&b_rx.try_recv().unwrap()).unwrap();
        assert_eq!(forwarded["type"], "play");
        assert!(forwarded.get("smuggled").is_none());
        assert_eq!(state.metrics.read().messages_relayed, 1);
    }

    #[test]
    fn test_invalid_frame_only_answers_sender() {
        let state = state(64 * 1024);
        let (a, _a_rx) = state.hub.register("lounge");
        let (_b, mut b_rx) = state.hub.register("lounge");

        let bad = json!({"type": "seek", "trackId": -1, "timestamp": current_time_ms(), "positionSeconds": 1});
        let reply = state.relay_text("lounge", a.id(), &bad.to_string()).unwrap();
        assert!(matches!(
            RelayNotice::parse(&reply),
            Some(RelayNotice::RelayError { reason }) if reason.contains("trackId")
        ));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(state.metrics.read().messages_rejected, 1);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let state = state(32);
        let (a, _a_rx) = state.hub.register("lounge");
        let (_b, mut b_rx) = state.hub.register("lounge");

        let reply = state.relay_text("lounge", a.id(), &play_frame());
        assert!(reply.unwrap().contains("exceeds 32 bytes"));
        assert!(b_rx.try_recv().is_err());
    }

    async fn start_relay() -> SocketAddr {
        start_relay_with(Arc::new(state(64 * 1024))).await
    }

    async fn start_relay_with(state: Arc<RelayState>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state));
        addr
    }

    #[tokio::test]
    async fn test_end_to_end_fan_out() {
        let addr = start_relay().await;
        let url = |session: &str, token: &str| format!("ws://{}/?session={}&token={}", addr, session, token);

        let (mut alice, _) = connect_async(url("lounge", "secret")).await.unwrap();
        let (mut bob, _) = connect_async(url("lounge", "secret")).await.unwrap();
        let (mut carol, _) = connect_async(url("kitchen", "secret")).await.unwrap();
        // Let the server register every connection before sending
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.send(Message::Text(play_frame())).await.unwrap();
        let received = timeout(Duration::from_secs(5), bob.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = received else {
            panic!("expected text frame");
        };
        assert!(text.contains(r#""type":"play""#));

        assert!(timeout(Duration::from_millis(200), carol.next()).await.is_err());
        assert!(timeout(Duration::from_millis(200), alice.next()).await.is_err());

        alice.send(Message::Text("{\"type\":\"dance\"}".into())).await.unwrap();
        let Some(Ok(Message::Text(reply))) = timeout(Duration::from_secs(5), alice.next()).await.unwrap() else {
            panic!("expected diagnostic");
        };
        assert!(matches!(RelayNotice::parse(&reply), Some(RelayNotice::RelayError { .. })));
        assert!(timeout(Duration::from_millis(200), bob.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_unauthenticated_handshake_is_refused() {
        let addr = start_relay().await;
        let bad_token = connect_async(format!("ws://{}/?session=lounge&token=guess", addr)).await;
        assert!(bad_token.is_err());
        let no_query = connect_async(format!("ws://{}/", addr)).await;
        assert!(no_query.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused_by_transport() {
        let state = Arc::new(state(512));
        let addr = start_relay_with(Arc::clone(&state)).await;
        let url = format!("ws://{}/?session=lounge&token=secret", addr);
        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _ = alice.send(Message::Text("x".repeat(4096))).await;
        let closed = timeout(Duration::from_secs(5), alice.next()).await.unwrap();
        assert!(matches!(closed, None | Some(Err(_)) | Some(Ok(Message::Close(_)))));
        assert!(timeout(Duration::from_millis(200), bob.next()).await.is_err());
        assert_eq!(state.metrics.read().messages_rejected, 1);
        assert_eq!(state.metrics.read().messages_relayed, 0);
    }

    #[tokio::test]
    async fn test_session_count_follows_connections() {
        let state = Arc::new(state(64 * 1024));
        let addr = start_relay_with(Arc::clone(&state)).await;
        let url = |session: &str| format!("ws://{}/?session={}&token=secret", addr, session);

        let (a, _) = connect_async(url("lounge")).await.unwrap();
        let (_b, _) = connect_async(url("kitchen")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.metrics.read().active_sessions, 2);

        drop(a);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state.metrics.read().active_sessions, 1);
        assert_eq!(state.metrics.read().active_connections, 1);
    }
}
