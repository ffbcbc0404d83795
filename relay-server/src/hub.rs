//! Session registry
//!
//! Maps each session id to the outbound queues of its connections. The lock
//! only guards the map; sending happens after it is released.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type ConnectionId = u64;

/// Frames queued per connection before new ones are dropped for it
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

type Outbound = mpsc::Sender<String>;

/// Outcome of one fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    /// Recipients whose queue was full
    pub dropped: usize,
}

pub struct Hub {
    sessions: RwLock<HashMap<String, HashMap<ConnectionId, Outbound>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_queue_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a connection to a session. It stays registered until the guard drops.
    pub fn register(self: &Arc<Self>, session_id: &str) -> (ConnectionGuard, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(id, tx);

        let guard = ConnectionGuard {
            id,
            session_id: session_id.to_string(),
            hub: Arc::clone(self),
        };
        (guard, rx)
    }

    fn unregister(&self, session_id: &str, id: ConnectionId) {
        let mut sessions = self.sessions.write();
        if let Some(connections) = sessions.get_mut(session_id) {
            connections.remove(&id);
            if connections.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Queue `payload` for every other connection of the session without
    /// waiting. A connection whose queue is full misses this frame.
    pub fn fan_out(&self, session_id: &str, from: ConnectionId, payload: &str) -> FanOut {
        let targets: Vec<Outbound> = match self.sessions.read().get(session_id) {
            Some(connections) => connections
                .iter()
                .filter(|(id, _)| **id != from)
                .map(|(_, tx)| tx.clone())
                .collect(),
            None => return FanOut::default(),
        };

        let mut outcome = FanOut::default();
        for tx in targets {
            match tx.try_send(payload.to_string()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => outcome.dropped += 1,
                Err(TrySendError::Closed(_)) => {}
            }
        }
        outcome
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters its connection when dropped
pub struct ConnectionGuard {
    id: ConnectionId,
    session_id: String,
    hub: Arc<Hub>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.session_id, self.id);
    }
}
