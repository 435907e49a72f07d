use crate::config::Mode;
use crate::pool::BufferPool;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of relay statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    /// Relay mode
    pub mode: Mode,
    /// Forward address
    pub forward_addr: String,
    /// Connections accepted by the listener
    pub accepted_connections: u64,
    /// Sessions currently relaying
    pub active_sessions: u64,
    /// Sessions that have finished
    pub completed_sessions: u64,
    /// TLS handshakes that failed or timed out
    pub handshake_failures: u64,
    /// Outbound dials that failed or timed out
    pub dial_failures: u64,
    /// Bytes copied inbound → outbound
    pub bytes_upstream: u64,
    /// Bytes copied outbound → inbound
    pub bytes_downstream: u64,
    /// Tracked buffers currently checked out of the pool
    pub buffers_outstanding: usize,
    /// Overflow buffers currently checked out of the pool
    pub buffers_overflow: usize,
    /// Buffers idle in the pool
    pub buffers_idle: usize,
    /// Start timestamp (Unix seconds)
    pub start_time: u64,
}

/// Statistics tracker shared by the listener loop and all sessions
#[derive(Debug, Clone)]
pub struct RelayStats {
    mode: Mode,
    forward_addr: String,
    accepted_connections: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
    completed_sessions: Arc<AtomicU64>,
    handshake_failures: Arc<AtomicU64>,
    dial_failures: Arc<AtomicU64>,
    bytes_upstream: Arc<AtomicU64>,
    bytes_downstream: Arc<AtomicU64>,
    start_time: u64,
}

impl RelayStats {
    pub fn new(mode: Mode, forward_addr: impl Into<String>) -> Self {
        Self {
            mode,
            forward_addr: forward_addr.into(),
            accepted_connections: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            completed_sessions: Arc::new(AtomicU64::new(0)),
            handshake_failures: Arc::new(AtomicU64::new(0)),
            dial_failures: Arc::new(AtomicU64::new(0)),
            bytes_upstream: Arc::new(AtomicU64::new(0)),
            bytes_downstream: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Record an accepted connection, returning its sequence number
    pub fn connection_accepted(&self) -> u64 {
        self.accepted_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment active sessions (called when a pair is established)
    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Move a session from active to completed
    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.completed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self, pool: &BufferPool) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            mode: self.mode,
            forward_addr: self.forward_addr.clone(),
            accepted_connections: self.accepted_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            completed_sessions: self.completed_sessions.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            buffers_outstanding: pool.outstanding(),
            buffers_overflow: pool.overflow_outstanding(),
            buffers_idle: pool.idle(),
            start_time: self.start_time,
        }
    }
}

/// Guard that marks a session as ended when dropped
pub struct SessionGuard {
    stats: RelayStats,
}

impl SessionGuard {
    pub fn new(stats: RelayStats) -> Self {
        stats.session_started();
        Self { stats }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.session_ended();
    }
}
