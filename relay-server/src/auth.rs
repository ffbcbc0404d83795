//! Handshake authentication

use beat_sync_core::protocol::{HandshakeError, HandshakeQuery};
use std::collections::HashSet;
use std::fmt;

/// Decides whether a token may join a session
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, session_id: &str, token: &str) -> bool;
}

/// Fixed set of tokens, each valid for every session
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, _session_id: &str, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

#[derive(Debug, PartialEq)]
pub enum AuthError {
    MissingQuery,
    Malformed(HandshakeError),
    Rejected,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingQuery => write!(f, "missing session query"),
            AuthError::Malformed(e) => write!(f, "{}", e),
            AuthError::Rejected => write!(f, "token rejected"),
        }
    }
}

/// Check the upgrade request query. Returns the session id on success.
pub fn authenticate(query: Option<&str>, verifier: &dyn TokenVerifier) -> Result<String, AuthError> {
    let query = query.ok_or(AuthError::MissingQuery)?;
    let handshake = HandshakeQuery::parse(query).map_err(AuthError::Malformed)?;
    if !verifier.verify(&handshake.session_id, &handshake.token) {
        return Err(AuthError::Rejected);
    }
    Ok(handshake.session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> StaticTokens {
        StaticTokens::new(vec!["secret".to_string()])
    }

    #[test]
    fn test_accepts_known_token() {
        assert_eq!(
            authenticate(Some("session=lounge&token=secret"), &verifier()),
            Ok("lounge".to_string())
        );
    }

    #[test]
    fn test_refuses_bad_handshakes() {
        let verifier = verifier();
        assert_eq!(authenticate(None, &verifier), Err(AuthError::MissingQuery));
        assert_eq!(
            authenticate(Some("session=lounge&token=guess"), &verifier),
            Err(AuthError::Rejected)
        );
        assert_eq!(
            authenticate(Some("token=secret"), &verifier),
            Err(AuthError::Malformed(HandshakeError::Missing("session")))
        );
    }

    #[test]
    fn test_empty_verifier_refuses_everything() {
        let verifier = StaticTokens::new(Vec::new());
        assert!(verifier.is_empty());
        assert_eq!(
            authenticate(Some("session=lounge&token=secret"), &verifier),
            Err(AuthError::Rejected)
        );
    }
}
