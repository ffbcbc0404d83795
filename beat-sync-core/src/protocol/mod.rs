//! Coordination Protocol
//!
//! Wire messages exchanged through the relay and the validator that guards
//! both sides of it.

mod handshake;
mod message;
mod validator;

pub use handshake::*;
pub use message::*;
pub use validator::*;
