//! Peer Identity
//!
//! Ids are generated once per peer lifetime and never change.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Characters used for the random part of generated ids
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

const GENERATED_PREFIX: &str = "peer_";
const GENERATED_SUFFIX_LENGTH: usize = 16;

pub const PEER_ID_MIN_LEN: usize = 10;
pub const PEER_ID_MAX_LEN: usize = 100;
pub const DISPLAY_NAME_MAX_LEN: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidPeerId {
    #[error("length {0} is outside 10..=100")]
    Length(usize),
    #[error("contains characters outside [A-Za-z0-9_-]")]
    Charset,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("display name is {0} characters, at most 50 allowed")]
pub struct DisplayNameTooLong(pub usize);

/// `[A-Za-z0-9_-]+`, shared by peer ids, session ids and tokens
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Opaque id of one peer within a session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh id like `peer_Xk3...`
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..GENERATED_SUFFIX_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        PeerId(format!("{}{}", GENERATED_PREFIX, suffix))
    }

    pub fn parse(input: &str) -> Result<Self, InvalidPeerId> {
        let len = input.len();
        if !(PEER_ID_MIN_LEN..=PEER_ID_MAX_LEN).contains(&len) {
            return Err(InvalidPeerId::Length(len));
        }
        if !is_safe_identifier(input) {
            return Err(InvalidPeerId::Charset);
        }
        Ok(PeerId(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidPeerId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who this peer is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    peer_id: PeerId,
    display_name: Option<String>,
}

impl PeerIdentity {
    pub fn new(peer_id: PeerId, display_name: Option<String>) -> Result<Self, DisplayNameTooLong> {
        if let Some(name) = &display_name {
            let count = name.chars().count();
            if count > DISPLAY_NAME_MAX_LEN {
                return Err(DisplayNameTooLong(count));
            }
        }
        Ok(Self {
            peer_id,
            display_name,
        })
    }

    pub fn generate(display_name: Option<String>) -> Result<Self, DisplayNameTooLong> {
        Self::new(PeerId::random(), display_name)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}
