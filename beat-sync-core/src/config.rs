//! Session configuration

use std::time::Duration;
use thiserror::Error;

use crate::identity::DISPLAY_NAME_MAX_LEN;
use crate::protocol::{HandshakeError, HandshakeQuery};
use crate::sync::DEFAULT_DRIFT_THRESHOLD_SECONDS;

/// Default relay URL for local development
const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:4455/";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("relay URL must start with ws:// or wss://: {0}")]
    InvalidRelayUrl(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("display name is {0} characters, at most 50 allowed")]
    DisplayNameTooLong(usize),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Everything a peer needs to join a listening session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL, without the session query
    pub relay_url: String,
    /// Logical session every peer of a listening group shares
    pub session_id: String,
    /// Token presented to the relay
    pub auth_token: String,
    /// Shown to other peers in play claims
    pub display_name: Option<String>,
    /// How often the leader rebroadcasts its full state
    pub rebroadcast_interval: Duration,
    /// Delay before the single retry of the startup state request
    pub resync_retry_delay: Duration,
    /// How long the relay may stay unreachable before we drop the master
    pub disconnect_timeout: Duration,
    /// Followers jump to the leader's position beyond this drift
    pub drift_threshold_seconds: f64,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            session_id: String::new(),
            auth_token: String::new(),
            display_name: None,
            rebroadcast_interval: Duration::from_secs(10),
            resync_retry_delay: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(15),
            drift_threshold_seconds: DEFAULT_DRIFT_THRESHOLD_SECONDS,
            reconnect_initial_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn new(relay_url: &str, session_id: &str, auth_token: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            session_id: session_id.to_string(),
            auth_token: auth_token.to_string(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = Some(display_name.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidRelayUrl(self.relay_url.clone()));
        }
        self.handshake()?;
        if let Some(name) = &self.display_name {
            let length = name.chars().count();
            if length > DISPLAY_NAME_MAX_LEN {
                return Err(ConfigError::DisplayNameTooLong(length));
            }
        }
        for (name, value) in [
            ("rebroadcast_interval", self.rebroadcast_interval),
            ("resync_retry_delay", self.resync_retry_delay),
            ("disconnect_timeout", self.disconnect_timeout),
            ("reconnect_initial_backoff", self.reconnect_initial_backoff),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    fn handshake(&self) -> Result<HandshakeQuery, HandshakeError> {
        HandshakeQuery::new(&self.session_id, &self.auth_token)
    }

    /// Relay URL with the session query appended
    pub fn connect_url(&self) -> String {
        self.handshake()
            .and_then(|query| query.apply_to(&self.relay_url))
            .unwrap_or_else(|_| self.relay_url.clone())
    }
}
