//! Relay handshake query
//!
//! Peers join a session by connecting to `<relay>?session=<id>&token=<token>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::is_safe_identifier;

pub const SESSION_ID_MAX_LEN: usize = 64;
pub const TOKEN_MAX_LEN: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed query string: {0}")]
    Malformed(String),
    #[error("missing `{0}` query parameter")]
    Missing(&'static str),
    #[error("session id must be 1-64 characters of [A-Za-z0-9_-]")]
    InvalidSessionId,
    #[error("token must be 1-4096 printable ASCII characters")]
    InvalidToken,
    #[error("failed to encode query: {0}")]
    Encode(String),
}

/// Query parameters as they appear on the wire, before validation
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireQuery {
    #[serde(rename = "session")]
    session_id: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeQuery {
    pub session_id: String,
    pub token: String,
}

impl HandshakeQuery {
    pub fn new(session_id: &str, token: &str) -> Result<Self, HandshakeError> {
        if session_id.len() > SESSION_ID_MAX_LEN || !is_safe_identifier(session_id) {
            return Err(HandshakeError::InvalidSessionId);
        }
        if !is_valid_token(token) {
            return Err(HandshakeError::InvalidToken);
        }
        Ok(Self {
            session_id: session_id.to_string(),
            token: token.to_string(),
        })
    }

    /// Decode the raw query string of an upgrade request. Unknown keys are ignored.
    pub fn parse(query: &str) -> Result<Self, HandshakeError> {
        let wire: WireQuery = serde_urlencoded::from_str(query)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        Self::new(
            &wire.session_id.ok_or(HandshakeError::Missing("session"))?,
            &wire.token.ok_or(HandshakeError::Missing("token"))?,
        )
    }

    /// Percent-encoded `session=..&token=..`
    pub fn to_query(&self) -> Result<String, HandshakeError> {
        let wire = WireQuery {
            session_id: Some(self.session_id.clone()),
            token: Some(self.token.clone()),
        };
        serde_urlencoded::to_string(&wire).map_err(|e| HandshakeError::Encode(e.to_string()))
    }

    /// Append this query to a relay URL
    pub fn apply_to(&self, relay_url: &str) -> Result<String, HandshakeError> {
        let separator = if relay_url.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", relay_url, separator, self.to_query()?))
    }
}

/// Tokens are opaque printable ASCII (base64 and friends included)
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && token.len() <= TOKEN_MAX_LEN && token.bytes().all(|b| b.is_ascii_graphic())
}
