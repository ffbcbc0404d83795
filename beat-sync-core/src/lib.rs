//! Beat Sync - Core Library
//!
//! Coordinates playback across the peers of a listening session: exactly one
//! peer (the master) produces sound while the others mirror its track,
//! position and play state over an untrusted relay.

pub mod audio;
pub mod clock;
pub mod config;
pub mod identity;
pub mod network;
pub mod protocol;
pub mod session;
pub mod sync;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

// Re-exports for convenience
pub use audio::{AudioEngine, AudioError};
pub use config::SessionConfig;
pub use identity::{PeerId, PeerIdentity};
pub use protocol::{validate_str, CoordinationMessage, ValidationError};
pub use session::{SessionError, SessionHandle, SessionSnapshot};
pub use sync::{PeerSession, Role, SyncEvent, SyncObserver, TracingObserver};

static TRACING_INIT: Once = Once::new();

/// Install a stderr `tracing` subscriber once. `RUST_LOG` overrides the
/// default directives.
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("beat_sync_core=debug,tungstenite=info,tokio_tungstenite=info")
        });
        // Another subscriber may already be installed by the host
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
