//! Shared cluster state
//!
//! The server list is process-wide: built from configuration at startup,
//! mutated only through the monitor worker or the admin surface. Routing
//! workers read the per-server role flags atomically and never take a lock
//! on the statement path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{status_flags, ServerDescriptor};

/// A named set of backend servers forming one replication cluster
pub struct Cluster {
    pub name: String,
    servers: RwLock<Vec<Arc<ServerDescriptor>>>,
    /// Set when a monitor operation failed past a commit point; automatic
    /// failover/rejoin stay disabled until an operator clears it
    manual_intervention: AtomicBool,
}

impl Cluster {
    pub fn new(name: &str, servers: Vec<Arc<ServerDescriptor>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            servers: RwLock::new(servers),
            manual_intervention: AtomicBool::new(false),
        })
    }

    /// Snapshot of the current server list
    pub fn servers(&self) -> Vec<Arc<ServerDescriptor>> {
        self.servers.read().clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<ServerDescriptor>> {
        self.servers.read().iter().find(|s| s.name == name).cloned()
    }

    /// The current master, if one is running
    pub fn master(&self) -> Option<Arc<ServerDescriptor>> {
        self.servers.read().iter().find(|s| s.is_master()).cloned()
    }

    pub fn running_slaves(&self) -> Vec<Arc<ServerDescriptor>> {
        self.servers
            .read()
            .iter()
            .filter(|s| s.is_slave() && s.is_usable())
            .cloned()
            .collect()
    }

    pub fn add_server(&self, server: Arc<ServerDescriptor>) {
        self.servers.write().push(server);
    }

    pub fn remove_server(&self, name: &str) -> bool {
        let mut servers = self.servers.write();
        let before = servers.len();
        servers.retain(|s| s.name != name);
        servers.len() != before
    }

    pub fn requires_manual_intervention(&self) -> bool {
        self.manual_intervention.load(Ordering::Relaxed)
    }

    pub fn set_manual_intervention(&self, value: bool) {
        self.manual_intervention.store(value, Ordering::Relaxed);
    }

    /// Put a server into or out of maintenance
    pub fn set_maintenance(&self, name: &str, on: bool) -> bool {
        match self.find(name) {
            Some(server) => {
                if on {
                    server.set_status(status_flags::MAINTENANCE);
                } else {
                    server.clear_status(status_flags::MAINTENANCE);
                }
                true
            }
            None => false,
        }
    }
}
