//! Relay Networking
//!
//! WebSocket transport between a peer and the session relay.

mod client;

pub use client::{NetworkCommand, NetworkError, NetworkEvent, NetworkHandle, RelayClient, RelayClientConfig};
