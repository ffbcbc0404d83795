//! Metrics tracking for the relay server

use chrono::{DateTime, Local};
use std::collections::{BTreeMap, VecDeque};

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Relay,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Relay => "RELAY",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address we are listening on
    pub listen_addr: Option<String>,

    /// Number of configured auth tokens
    pub token_count: usize,

    /// Largest accepted frame in bytes
    pub max_message_bytes: usize,

    /// Current number of open connections
    pub active_connections: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Sessions with at least one connection
    pub active_sessions: usize,

    /// Messages validated and fanned out
    pub messages_relayed: u64,

    /// Messages dropped by validation
    pub messages_rejected: u64,

    /// Relayed messages per kind
    pub relayed_by_kind: BTreeMap<&'static str, u64>,

    /// Frames a lagging recipient missed because its queue was full
    pub messages_dropped: u64,

    /// Bytes written to other peers
    pub bytes_relayed: u64,

    /// Upgrades refused for missing or bad credentials
    pub refused_handshakes: u64,

    /// Open connections (for display)
    pub connection_list: Vec<ConnectionInfo>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone)]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub session_id: String,
    pub remote_addr: String,
    pub connected_at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            listen_addr: None,
            token_count: 0,
            max_message_bytes: 0,
            active_connections: 0,
            total_connections: 0,
            peak_connections: 0,
            active_sessions: 0,
            messages_relayed: 0,
            messages_rejected: 0,
            relayed_by_kind: BTreeMap::new(),
            messages_dropped: 0,
            bytes_relayed: 0,
            refused_handshakes: 0,
            connection_list: Vec::new(),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record an authenticated connection
    pub fn connection_established(
        &mut self,
        connection_id: u64,
        session_id: &str,
        remote_addr: String,
        active_sessions: usize,
    ) {
        if self.connection_list.iter().any(|c| c.connection_id == connection_id) {
            return;
        }

        self.active_connections += 1;
        self.total_connections += 1;
        if self.active_connections > self.peak_connections {
            self.peak_connections = self.active_connections;
        }

        self.connection_list.push(ConnectionInfo {
            connection_id,
            session_id: session_id.to_string(),
            remote_addr: remote_addr.clone(),
            connected_at: Local::now(),
        });
        self.active_sessions = active_sessions;

        self.log(
            LogLevel::Connection,
            format!("Joined {}: {}", truncate_id(session_id), remote_addr),
        );
    }

    /// Record a disconnection (only if the connection was tracked)
    pub fn connection_closed(&mut self, connection_id: u64, active_sessions: usize) {
        self.active_sessions = active_sessions;
        let Some(index) = self
            .connection_list
            .iter()
            .position(|c| c.connection_id == connection_id)
        else {
            return;
        };

        let info = self.connection_list.remove(index);
        self.active_connections = self.active_connections.saturating_sub(1);

        self.log(
            LogLevel::Connection,
            format!("Left {}: {}", truncate_id(&info.session_id), info.remote_addr),
        );
    }

    /// Record a validated message queued for `recipients` peers and
    /// skipped for `dropped` lagging ones
    pub fn message_relayed(&mut self, kind: &'static str, bytes: usize, recipients: usize, dropped: usize) {
        self.messages_relayed += 1;
        *self.relayed_by_kind.entry(kind).or_default() += 1;
        self.bytes_relayed += (bytes * recipients) as u64;
        if dropped > 0 {
            self.messages_dropped += dropped as u64;
            self.log(
                LogLevel::Warning,
                format!("{} -> {} peer(s), {} lagging peer(s) skipped", kind, recipients, dropped),
            );
        } else {
            self.log(LogLevel::Relay, format!("{} -> {} peer(s)", kind, recipients));
        }
    }

    pub fn message_rejected(&mut self, reason: &str) {
        self.messages_rejected += 1;
        self.log(LogLevel::Warning, format!("Rejected: {}", reason));
    }

    pub fn handshake_refused(&mut self, remote_addr: &str, reason: &str) {
        self.refused_handshakes += 1;
        self.log(LogLevel::Warning, format!("Refused {}: {}", remote_addr, reason));
    }

    /// Open connections grouped by session, busiest first
    pub fn sessions(&self) -> Vec<(&str, Vec<&ConnectionInfo>)> {
        let mut grouped: BTreeMap<&str, Vec<&ConnectionInfo>> = BTreeMap::new();
        for info in &self.connection_list {
            grouped.entry(info.session_id.as_str()).or_default().push(info);
        }
        let mut sessions: Vec<_> = grouped.into_iter().collect();
        sessions.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
        sessions
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Truncate an id for display (show first and last few chars)
pub fn truncate_id(id: &str) -> String {
    if id.len() > 16 && id.is_ascii() {
        format!("{}...{}", &id[..8], &id[id.len() - 4..])
    } else {
        id.to_string()
    }
}
