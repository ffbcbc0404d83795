//! Sync Observer
//!
//! Hosts subscribe to coordination events (for UI or diagnostics) through
//! [`SyncObserver`].

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::state::Role;
use crate::identity::PeerId;
use crate::protocol::TrackId;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    RoleChanged { from: Role, to: Role },
    /// A remote peer became our recorded master
    MasterAdopted { master_peer_id: PeerId },
    MasterCleared { previous_master: PeerId },
    /// We were leading and a preceding claim took over
    LeadershipYielded { to: PeerId },
    ClaimIgnored {
        claimant: PeerId,
        current_master: PeerId,
    },
    /// A claim named a master that already announced its departure
    DepartedClaimIgnored { claimant: PeerId },
    SnapshotApplied { master_peer_id: PeerId },
    DriftCorrected { from_seconds: f64, to_seconds: f64 },
    PlaybackStartFailed { track_id: TrackId, reason: String },
    MessageRejected { reason: String },
    StateRequested,
    SnapshotBroadcast,
    RelayConnected,
    RelayDisconnected { reason: String },
    /// Disconnected for longer than the timeout, master belief dropped
    ConnectionLost,
    /// Diagnostic sent back by the relay for one of our messages
    RelayDiagnostic { reason: String },
}

pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Default observer: forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::PlaybackStartFailed { .. }
            | SyncEvent::MessageRejected { .. }
            | SyncEvent::RelayDisconnected { .. }
            | SyncEvent::ConnectionLost
            | SyncEvent::RelayDiagnostic { .. } => warn!(?event, "sync event"),
            SyncEvent::StateRequested
            | SyncEvent::SnapshotBroadcast
            | SyncEvent::ClaimIgnored { .. }
            | SyncEvent::DepartedClaimIgnored { .. }
            | SyncEvent::SnapshotApplied { .. } => debug!(?event, "sync event"),
            _ => info!(?event, "sync event"),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl SyncObserver for RecordingObserver {
    fn on_event(&self, event: &SyncEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_drains() {
        let observer = RecordingObserver::new();
        observer.on_event(&SyncEvent::StateRequested);
        observer.on_event(&SyncEvent::SnapshotBroadcast);
        assert_eq!(observer.events().len(), 2);
        assert_eq!(
            observer.take(),
            vec![SyncEvent::StateRequested, SyncEvent::SnapshotBroadcast]
        );
        assert!(observer.events().is_empty());
    }
}
