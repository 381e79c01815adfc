//! Logical backend servers
//!
//! A `ServerDescriptor` is the shared, monitor-owned view of one backend.
//! The monitor derives and writes the replication role flags; routing workers
//! read each field atomically. Readers never see a cross-field snapshot.

mod connection;

pub use connection::{BackendAuth, BackendConnection, BackendError, ResultSet};

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replication role and liveness flags
#[allow(dead_code)]
pub mod status_flags {
    pub const RUNNING: u32 = 1;
    pub const MASTER: u32 = 1 << 1;
    pub const SLAVE: u32 = 1 << 2;
    pub const RELAY: u32 = 1 << 3;
    pub const MAINTENANCE: u32 = 1 << 4;
    pub const DRAINING: u32 = 1 << 5;
    pub const AUTH_ERROR: u32 = 1 << 6;
    pub const DOWN: u32 = 1 << 7;
}

/// Replication lag value meaning "not measured"
pub const RLAG_UNKNOWN: i64 = -1;

/// One backend database server
#[derive(Debug)]
pub struct ServerDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    status: AtomicU32,
    rank: AtomicI64,
    /// server_id reported by the backend, -1 until probed
    node_id: AtomicI64,
    /// Replication lag in seconds, RLAG_UNKNOWN until measured
    replication_lag: AtomicI64,
    /// Decaying average response time in microseconds
    response_time_us: AtomicU64,
    /// Global connection count across every session
    connections: AtomicU32,
    /// Commands currently in flight
    current_ops: AtomicU32,
}

impl ServerDescriptor {
    pub fn new(name: &str, host: &str, port: u16, rank: i64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            status: AtomicU32::new(status_flags::DOWN),
            rank: AtomicI64::new(rank),
            node_id: AtomicI64::new(-1),
            replication_lag: AtomicI64::new(RLAG_UNKNOWN),
            response_time_us: AtomicU64::new(0),
            connections: AtomicU32::new(0),
            current_ops: AtomicU32::new(0),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Relaxed)
    }

    /// Replace the whole status word; monitor only
    pub fn assign_status(&self, status: u32) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn set_status(&self, flags: u32) {
        self.status.fetch_or(flags, Ordering::Relaxed);
    }

    pub fn clear_status(&self, flags: u32) {
        self.status.fetch_and(!flags, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        let s = self.status();
        s & status_flags::RUNNING != 0 && s & status_flags::DOWN == 0
    }

    pub fn is_master(&self) -> bool {
        self.is_running() && self.status() & status_flags::MASTER != 0
    }

    pub fn is_slave(&self) -> bool {
        self.is_running() && self.status() & status_flags::SLAVE != 0
    }

    /// Usable for new traffic: running and neither in maintenance nor
    /// draining nor failing authentication
    pub fn is_usable(&self) -> bool {
        self.is_running()
            && self.status()
                & (status_flags::MAINTENANCE | status_flags::DRAINING | status_flags::AUTH_ERROR)
                == 0
    }

    pub fn rank(&self) -> i64 {
        self.rank.load(Ordering::Relaxed)
    }

    pub fn set_rank(&self, rank: i64) {
        self.rank.store(rank, Ordering::Relaxed);
    }

    pub fn node_id(&self) -> i64 {
        self.node_id.load(Ordering::Relaxed)
    }

    pub fn set_node_id(&self, id: i64) {
        self.node_id.store(id, Ordering::Relaxed);
    }

    pub fn replication_lag(&self) -> i64 {
        self.replication_lag.load(Ordering::Relaxed)
    }

    pub fn set_replication_lag(&self, seconds: i64) {
        self.replication_lag.store(seconds, Ordering::Relaxed);
    }

    /// Decaying average of measured response times; zero until first sample
    pub fn response_time_average(&self) -> Duration {
        Duration::from_micros(self.response_time_us.load(Ordering::Relaxed))
    }

    /// Fold one response-time sample into the average (weight 30%)
    pub fn update_response_time(&self, sample: Duration) {
        let sample_us = sample.as_micros() as u64;
        let old = self.response_time_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample_us
        } else {
            (old * 7 + sample_us * 3) / 10
        };
        self.response_time_us.store(new, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current_ops(&self) -> u32 {
        self.current_ops.load(Ordering::Relaxed)
    }

    pub fn op_started(&self) {
        self.current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_finished(&self) {
        self.current_ops.fetch_sub(1, Ordering::Relaxed);
    }

    /// Printable status summary, monitor log style
    pub fn status_string(&self) -> String {
        let s = self.status();
        let mut parts = Vec::new();
        if s & status_flags::MAINTENANCE != 0 {
            parts.push("Maintenance");
        }
        if s & status_flags::DRAINING != 0 {
            parts.push("Draining");
        }
        if s & status_flags::MASTER != 0 {
            parts.push("Master");
        }
        if s & status_flags::RELAY != 0 {
            parts.push("Relay");
        }
        if s & status_flags::SLAVE != 0 {
            parts.push("Slave");
        }
        if s & status_flags::AUTH_ERROR != 0 {
            parts.push("Auth Error");
        }
        if s & status_flags::RUNNING != 0 && s & status_flags::DOWN == 0 {
            parts.push("Running");
        } else {
            parts.push("Down");
        }
        parts.join(", ")
    }
}
