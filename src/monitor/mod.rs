//! Cluster monitor
//!
//! A periodic task per cluster. Each tick probes every backend with a short
//! query set, rebuilds the replication topology from the reported
//! master/slave links, derives the authoritative role flags the routers
//! read, and drives automatic failover and rejoin. Operator-initiated
//! switchover/failover/rejoin arrive over a command channel and run between
//! ticks.

mod failover;
#[cfg(test)]
mod scenarios;
mod topology;

pub use topology::{derive_roles, DerivedRoles, GtidPosition, NodeInfo};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{status_flags, BackendAuth, BackendConnection, ServerDescriptor};
use crate::cluster::Cluster;

/// Monitor parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Consecutive ticks the master must be unreachable before failover
    pub failcount: u32,
    pub auto_failover: bool,
    pub auto_rejoin: bool,
    /// Require slaves to confirm the master is gone before failing over
    pub verify_master_failure: bool,
    pub failover_timeout_secs: u64,
    pub switchover_timeout_secs: u64,
    /// SQL file executed on the new master right after promotion
    pub promotion_sql_file: Option<PathBuf>,
    /// Servers excluded from promotion
    pub servers_no_promotion: Vec<String>,
    /// Last-known-master journal; advisory only, overridden by the first
    /// completed tick
    pub journal_file: Option<PathBuf>,
    pub replication_user: String,
    pub replication_password: String,
    pub connect_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            failcount: 5,
            auto_failover: false,
            auto_rejoin: false,
            verify_master_failure: true,
            failover_timeout_secs: 90,
            switchover_timeout_secs: 90,
            promotion_sql_file: None,
            servers_no_promotion: Vec::new(),
            journal_file: None,
            replication_user: "repl".to_string(),
            replication_password: String::new(),
            connect_timeout_ms: 3000,
        }
    }
}

/// Operator commands delivered between ticks
pub enum MonitorCommand {
    Failover {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Switchover {
        new_master: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Rejoin {
        server: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ResetReplication {
        new_master: Option<String>,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Replication status reported by a slave
#[derive(Debug, Clone)]
pub struct SlaveStatus {
    pub master_host: String,
    pub master_port: u16,
    pub io_running: bool,
    pub sql_running: bool,
    pub seconds_behind: i64,
}

/// One backend's probe results for a tick
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub reachable: bool,
    pub server_id: i64,
    pub read_only: bool,
    pub slave: Option<SlaveStatus>,
    pub gtid_current: Option<GtidPosition>,
}

/// The per-cluster monitor task
pub struct ClusterMonitor {
    cluster: Arc<Cluster>,
    config: MonitorConfig,
    auth: BackendAuth,
    conns: HashMap<String, BackendConnection>,
    probes: HashMap<String, ProbeResult>,
    /// Name of the master as of the previous tick (journal-seeded at start)
    last_master: Option<String>,
    master_down_count: u32,
    commands: mpsc::Receiver<MonitorCommand>,
}

impl ClusterMonitor {
    pub fn new(
        cluster: Arc<Cluster>,
        config: MonitorConfig,
        auth: BackendAuth,
        commands: mpsc::Receiver<MonitorCommand>,
    ) -> Self {
        // The journal only seeds master-down tracking; the first completed
        // tick recomputes roles from live probes
        let last_master = config
            .journal_file
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if let Some(name) = &last_master {
            info!(cluster = %cluster.name, master = %name, "Journal hints previous master");
        }

        Self {
            cluster,
            config,
            auth,
            conns: HashMap::new(),
            probes: HashMap::new(),
            last_master,
            master_down_count: 0,
            commands,
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            cluster = %self.cluster.name,
            interval_ms = self.config.interval_ms,
            auto_failover = self.config.auto_failover,
            "Cluster monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(cluster = %self.cluster.name, "Cluster monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Failover { reply } => {
                let result = self.manual_failover().await;
                let _ = reply.send(result);
            }
            MonitorCommand::Switchover { new_master, reply } => {
                let result = self.switchover(&new_master).await;
                let _ = reply.send(result);
            }
            MonitorCommand::Rejoin { server, reply } => {
                let result = self.rejoin(&server).await;
                let _ = reply.send(result);
            }
            MonitorCommand::ResetReplication { new_master, reply } => {
                let result = self.reset_replication(new_master.as_deref()).await;
                let _ = reply.send(result);
            }
        }
    }

    /// One monitor tick: probe, derive, act
    pub async fn tick(&mut self) {
        let servers = self.cluster.servers();

        // Probes run concurrently across backends and collate at the end
        let mut futures = Vec::new();
        for server in &servers {
            let conn = self.conns.remove(&server.name);
            let auth = self.auth.clone();
            let timeout = Duration::from_millis(self.config.connect_timeout_ms);
            let server = server.clone();
            futures.push(async move {
                let (probe, conn) = probe_server(server.clone(), conn, &auth, timeout).await;
                (server.name.clone(), probe, conn)
            });
        }

        let results = futures::future::join_all(futures).await;
        self.probes.clear();
        for (name, probe, conn) in results {
            if let Some(conn) = conn {
                self.conns.insert(name.clone(), conn);
            }
            self.probes.insert(name, probe);
        }

        self.apply_derived_roles(&servers).await;
        self.track_master_failure(&servers).await;
        if self.config.auto_rejoin {
            self.auto_rejoin_pass(&servers).await;
        }
    }

    /// Build the topology from this tick's probes and write the role flags
    async fn apply_derived_roles(&mut self, servers: &[Arc<ServerDescriptor>]) {
        let mut nodes = Vec::with_capacity(servers.len());
        for server in servers {
            let probe = self.probes.get(&server.name).cloned().unwrap_or_default();
            let upstream = match &probe.slave {
                Some(slave) => {
                    resolve_upstream(servers, &slave.master_host, slave.master_port).await
                }
                None => None,
            };
            nodes.push(NodeInfo {
                reachable: probe.reachable,
                read_only: probe.read_only,
                server_id: probe.server_id,
                upstream,
                replicating: probe
                    .slave
                    .as_ref()
                    .map(|s| s.io_running && s.sql_running)
                    .unwrap_or(false),
                in_maintenance: server.status() & status_flags::MAINTENANCE != 0,
            });
        }

        let roles = derive_roles(&nodes);
        if !roles.cycle_members.is_empty() {
            debug!(
                cluster = %self.cluster.name,
                members = ?roles.cycle_members.iter().map(|&i| &servers[i].name).collect::<Vec<_>>(),
                "Replication ring detected"
            );
        }

        for (idx, server) in servers.iter().enumerate() {
            let Some(probe) = self.probes.get(&server.name) else {
                continue;
            };
            // Preserve operator-held bits, replace the derived ones
            let held = server.status()
                & (status_flags::MAINTENANCE | status_flags::DRAINING | status_flags::AUTH_ERROR);
            let old = server.status();
            let new = roles.status[idx] | held;
            server.assign_status(new);
            if old != new {
                info!(
                    cluster = %self.cluster.name,
                    server = %server.name,
                    "Server changed state: {}",
                    server.status_string()
                );
            }
            server.set_node_id(probe.server_id);
            server.set_replication_lag(
                probe
                    .slave
                    .as_ref()
                    .map(|s| s.seconds_behind)
                    .unwrap_or(crate::backend::RLAG_UNKNOWN),
            );
        }

        // Journal the master identity for the next restart
        let master_name = roles.master.map(|idx| servers[idx].name.clone());
        if master_name != self.last_master {
            if let Some(name) = &master_name {
                info!(cluster = %self.cluster.name, master = %name, "Master is now {name}");
                self.write_journal(name);
            }
            if master_name.is_some() {
                self.last_master = master_name;
                self.master_down_count = 0;
            }
        }
    }

    /// Count consecutive ticks with the master unreachable; fail over once
    /// the threshold is crossed and the failure is confirmed
    async fn track_master_failure(&mut self, servers: &[Arc<ServerDescriptor>]) {
        let Some(master_name) = self.last_master.clone() else {
            return;
        };

        let master_reachable = self
            .probes
            .get(&master_name)
            .map(|p| p.reachable)
            .unwrap_or(false);

        if master_reachable {
            self.master_down_count = 0;
            return;
        }

        self.master_down_count += 1;
        debug!(
            cluster = %self.cluster.name,
            master = %master_name,
            down_count = self.master_down_count,
            failcount = self.config.failcount,
            "Master unreachable"
        );

        if self.master_down_count < self.config.failcount {
            return;
        }
        if !self.config.auto_failover {
            if self.master_down_count == self.config.failcount {
                warn!(
                    cluster = %self.cluster.name,
                    master = %master_name,
                    "Master failed but auto_failover is disabled"
                );
            }
            return;
        }
        if self.cluster.requires_manual_intervention() {
            return;
        }

        if self.config.verify_master_failure && !self.slaves_confirm_master_down(servers) {
            debug!(
                cluster = %self.cluster.name,
                "Master failure not confirmed by slaves, postponing failover"
            );
            return;
        }

        info!(
            cluster = %self.cluster.name,
            master = %master_name,
            "Starting automatic failover"
        );
        match self.failover(&master_name).await {
            Ok(new_master) => {
                info!(
                    cluster = %self.cluster.name,
                    new_master = %new_master,
                    "Failover complete"
                );
                self.master_down_count = 0;
            }
            Err(e) => {
                warn!(cluster = %self.cluster.name, error = %e, "Failover failed");
            }
        }
    }

    /// The failure is confirmed when no slave still has a working IO thread
    /// toward the master
    fn slaves_confirm_master_down(&self, servers: &[Arc<ServerDescriptor>]) -> bool {
        for server in servers {
            let Some(probe) = self.probes.get(&server.name) else {
                continue;
            };
            if !probe.reachable {
                continue;
            }
            if let Some(slave) = &probe.slave {
                if slave.io_running {
                    return false;
                }
            }
        }
        true
    }

    /// Rejoin returning nodes that are running but hold no role
    async fn auto_rejoin_pass(&mut self, servers: &[Arc<ServerDescriptor>]) {
        if self.cluster.master().is_none() || self.cluster.requires_manual_intervention() {
            return;
        }
        let names: Vec<String> = servers
            .iter()
            .filter(|s| {
                s.is_running()
                    && !s.is_master()
                    && !s.is_slave()
                    && s.status() & status_flags::MAINTENANCE == 0
            })
            .map(|s| s.name.clone())
            .collect();

        for name in names {
            match self.rejoin(&name).await {
                Ok(()) => info!(cluster = %self.cluster.name, server = %name, "Server rejoined"),
                Err(e) => {
                    debug!(cluster = %self.cluster.name, server = %name, error = %e, "Rejoin skipped")
                }
            }
        }
    }

    fn write_journal(&self, master: &str) {
        let Some(path) = &self.config.journal_file else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, master) {
            warn!(error = %e, "Failed to write monitor journal");
        }
    }
}

/// Probe one backend, reusing its persistent connection when possible
async fn probe_server(
    server: Arc<ServerDescriptor>,
    conn: Option<BackendConnection>,
    auth: &BackendAuth,
    connect_timeout: Duration,
) -> (ProbeResult, Option<BackendConnection>) {
    let mut conn = match conn {
        Some(conn) => conn,
        None => {
            match BackendConnection::connect(server.clone(), auth, None, None, connect_timeout)
                .await
            {
                Ok(conn) => conn,
                Err(crate::backend::BackendError::Auth(e)) => {
                    debug!(server = %server.name, error = %e, "Monitor authentication failed");
                    server.set_status(status_flags::AUTH_ERROR);
                    return (ProbeResult::default(), None);
                }
                Err(e) => {
                    debug!(server = %server.name, error = %e, "Monitor connect failed");
                    return (ProbeResult::default(), None);
                }
            }
        }
    };

    // The probe shares the connect budget so a hung backend cannot stall
    // the whole tick
    match tokio::time::timeout(connect_timeout, run_probe_queries(&mut conn)).await {
        Ok(Ok(probe)) => (probe, Some(conn)),
        Ok(Err(e)) => {
            debug!(server = %server.name, error = %e, "Probe failed");
            (ProbeResult::default(), None)
        }
        Err(_) => {
            debug!(server = %server.name, "Probe timed out");
            (ProbeResult::default(), None)
        }
    }
}

async fn run_probe_queries(
    conn: &mut BackendConnection,
) -> Result<ProbeResult, crate::backend::BackendError> {
    let basics = conn.query("SELECT @@server_id, @@read_only").await?;
    let server_id = basics
        .value(0, 0)
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1);
    let read_only = basics.value(0, 1) == Some("1");

    let slave_result = conn.query("SHOW SLAVE STATUS").await?;
    let slave = if slave_result.is_empty() {
        None
    } else {
        Some(SlaveStatus {
            master_host: slave_result
                .value_by_name(0, "Master_Host")
                .unwrap_or_default()
                .to_string(),
            master_port: slave_result
                .value_by_name(0, "Master_Port")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3306),
            io_running: slave_result.value_by_name(0, "Slave_IO_Running") == Some("Yes"),
            sql_running: slave_result.value_by_name(0, "Slave_SQL_Running") == Some("Yes"),
            seconds_behind: slave_result
                .value_by_name(0, "Seconds_Behind_Master")
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::backend::RLAG_UNKNOWN),
        })
    };

    let gtid = conn.query("SELECT @@gtid_current_pos").await?;
    let gtid_current = gtid.scalar().and_then(GtidPosition::parse);

    Ok(ProbeResult {
        reachable: true,
        server_id,
        read_only,
        slave,
        gtid_current,
    })
}

/// Map a reported master host/port to a known server, resolving through DNS
/// when the plain string compare misses
async fn resolve_upstream(
    servers: &[Arc<ServerDescriptor>],
    host: &str,
    port: u16,
) -> Option<usize> {
    if host.is_empty() {
        return None;
    }
    if let Some(idx) = servers
        .iter()
        .position(|s| s.host == host && s.port == port)
    {
        return Some(idx);
    }

    let reported: Vec<std::net::SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .ok()?
        .collect();

    for (idx, server) in servers.iter().enumerate() {
        if server.port != port {
            continue;
        }
        if let Ok(addrs) = tokio::net::lookup_host((server.host.as_str(), server.port)).await {
            for addr in addrs {
                if reported.contains(&addr) {
                    return Some(idx);
                }
            }
        }
    }
    None
}
