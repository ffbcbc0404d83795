//! Relay configuration from environment variables

use beat_sync_core::protocol::is_valid_token;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::warn;

/// Default listen port
const DEFAULT_PORT: u16 = 4455;

/// Largest frame we accept from a peer
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Tokens accepted during the handshake
    pub tokens: Vec<String>,
    pub max_message_bytes: usize,
}

impl RelayConfig {
    /// Read `RELAY_BIND`, `RELAY_PORT`, `RELAY_TOKENS` and `RELAY_MAX_MESSAGE_BYTES`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = lookup("RELAY_BIND")
            .and_then(|a| a.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = lookup("RELAY_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let max_message_bytes = lookup("RELAY_MAX_MESSAGE_BYTES")
            .and_then(|b| b.parse().ok())
            .filter(|&b: &usize| b > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let tokens = lookup("RELAY_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .filter(|t| {
                let ok = is_valid_token(t);
                if !ok {
                    warn!("Ignoring token that is not printable ASCII");
                }
                ok
            })
            .map(str::to_string)
            .collect();

        Self {
            bind_addr,
            port,
            tokens,
            max_message_bytes,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
