//! Failover, switchover and rejoin
//!
//! Failover promotes the most advanced eligible slave after the master is
//! confirmed gone. Switchover runs the same promotion against a live,
//! drained master. Rejoin brings a returning node back under the current
//! master, refusing nodes that accumulated writes the cluster never saw. A
//! failure past a commit point latches the cluster into manual-intervention
//! mode, which disables every automatic operation until cleared.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, ServerDescriptor};

use super::topology::GtidPosition;
use super::{run_probe_queries, ClusterMonitor, ProbeResult};

/// How often catch-up checks re-probe during failover/switchover
const CATCH_UP_POLL: Duration = Duration::from_millis(500);

impl ClusterMonitor {
    /// Operator-initiated failover of a dead (or absent) master
    pub(super) async fn manual_failover(&mut self) -> Result<(), String> {
        if self.cluster.requires_manual_intervention() {
            return Err("cluster is locked for manual intervention".into());
        }
        let old_master = self
            .last_master
            .clone()
            .ok_or_else(|| "no known master to fail over from".to_string())?;
        if self
            .probes
            .get(&old_master)
            .map(|p| p.reachable)
            .unwrap_or(false)
        {
            return Err(format!(
                "master {old_master} is still reachable, use switchover instead"
            ));
        }
        self.failover(&old_master).await.map(|_| ())
    }

    /// Promote the best slave after `old_master` was lost. Returns the new
    /// master's name.
    pub(super) async fn failover(&mut self, old_master: &str) -> Result<String, String> {
        let servers = self.cluster.servers();
        let candidate = self.pick_promotion_candidate(&servers, old_master)?;
        info!(
            cluster = %self.cluster.name,
            candidate = %candidate.name,
            "Promotion candidate selected"
        );

        self.wait_for_catch_up(&servers, &candidate, old_master, self.config.failover_timeout_secs)
            .await;

        // Past this point a failure leaves the cluster half-reconfigured
        if let Err(e) = self.promote(&candidate).await {
            self.cluster.set_manual_intervention(true);
            warn!(
                cluster = %self.cluster.name,
                error = %e,
                "Promotion failed past the safe point, automatic operations disabled"
            );
            return Err(e);
        }

        self.redirect_slaves(&servers, &candidate, old_master).await;

        self.last_master = Some(candidate.name.clone());
        self.write_journal(&candidate.name);
        // Roles are recomputed from live probes on the next tick; reflect
        // the promotion immediately for the routers
        candidate.assign_status(
            crate::backend::status_flags::RUNNING | crate::backend::status_flags::MASTER,
        );
        Ok(candidate.name.clone())
    }

    /// Operator-initiated master change onto a named, running node
    pub(super) async fn switchover(&mut self, new_master: &str) -> Result<(), String> {
        if self.cluster.requires_manual_intervention() {
            return Err("cluster is locked for manual intervention".into());
        }

        let servers = self.cluster.servers();
        let candidate = self
            .cluster
            .find(new_master)
            .ok_or_else(|| format!("unknown server {new_master}"))?;
        if !candidate.is_running() {
            return Err(format!("{new_master} is not running"));
        }

        let old_master = self
            .cluster
            .master()
            .ok_or_else(|| "no running master to demote".to_string())?;
        if old_master.name == candidate.name {
            return Err(format!("{new_master} is already the master"));
        }

        // Drain the demotion target before making it read-only
        old_master.set_status(crate::backend::status_flags::DRAINING);
        let drain_deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.switchover_timeout_secs);
        while old_master.current_ops() > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(CATCH_UP_POLL).await;
        }

        if let Err(e) = self.run_on(&old_master.name, "SET GLOBAL read_only=1").await {
            old_master.clear_status(crate::backend::status_flags::DRAINING);
            return Err(format!("failed to demote {}: {e}", old_master.name));
        }

        self.wait_for_catch_up(
            &servers,
            &candidate,
            &old_master.name,
            self.config.switchover_timeout_secs,
        )
        .await;

        if let Err(e) = self.promote(&candidate).await {
            self.cluster.set_manual_intervention(true);
            return Err(e);
        }

        self.redirect_slaves(&servers, &candidate, &old_master.name).await;

        // The demoted master becomes a slave of the new one
        if let Err(e) = self.point_at(&old_master.name, &candidate).await {
            warn!(
                cluster = %self.cluster.name,
                server = %old_master.name,
                error = %e,
                "Could not repoint demoted master"
            );
        }
        old_master.clear_status(crate::backend::status_flags::DRAINING);

        self.last_master = Some(candidate.name.clone());
        self.write_journal(&candidate.name);
        Ok(())
    }

    /// Bring a returning node back under the current master
    pub(super) async fn rejoin(&mut self, name: &str) -> Result<(), String> {
        let master = self
            .cluster
            .master()
            .ok_or_else(|| "no master to rejoin to".to_string())?;
        if master.name == name {
            return Err("node is the master".into());
        }

        let probe = self.fresh_probe(name).await?;
        let master_probe = self.fresh_probe(&master.name).await?;

        if let Some(slave) = &probe.slave {
            let points_at_master =
                slave.master_host == master.host && slave.master_port == master.port;
            if points_at_master && slave.io_running && slave.sql_running {
                // Already replicating correctly; accepted silently
                return Ok(());
            }
        }

        // A standalone read-write node with events the cluster has not seen
        // must never be absorbed
        if probe.slave.is_none() && !probe.read_only {
            let node_gtid = probe.gtid_current.clone().unwrap_or_default();
            let master_gtid = master_probe.gtid_current.clone().unwrap_or_default();
            if !node_gtid.is_empty() && !master_gtid.contains(&node_gtid) {
                return Err(format!(
                    "{name} is a standalone master with local events, refusing rejoin"
                ));
            }
        }

        self.run_on(name, "STOP SLAVE").await?;
        self.run_on(name, "RESET SLAVE ALL").await?;
        self.run_on(name, "SET GLOBAL read_only=1").await?;
        self.point_at(name, &master).await?;
        Ok(())
    }

    /// Wipe replication configuration and rebuild it under one master
    pub(super) async fn reset_replication(
        &mut self,
        new_master: Option<&str>,
    ) -> Result<(), String> {
        let servers = self.cluster.servers();
        let master = match new_master {
            Some(name) => self
                .cluster
                .find(name)
                .ok_or_else(|| format!("unknown server {name}"))?,
            None => self
                .cluster
                .master()
                .or_else(|| servers.iter().find(|s| s.is_running()).cloned())
                .ok_or_else(|| "no running server to use as master".to_string())?,
        };

        for server in &servers {
            if !server.is_running() {
                continue;
            }
            self.run_on(&server.name, "STOP SLAVE").await.ok();
            self.run_on(&server.name, "RESET SLAVE ALL").await.ok();
            if server.name == master.name {
                self.run_on(&server.name, "SET GLOBAL read_only=0").await?;
            } else {
                self.run_on(&server.name, "SET GLOBAL read_only=1").await?;
                self.point_at(&server.name, &master).await?;
            }
        }

        self.cluster.set_manual_intervention(false);
        self.last_master = Some(master.name.clone());
        self.write_journal(&master.name);
        Ok(())
    }

    /// Pick the promotion candidate: among eligible slaves, the one with the
    /// most advanced GTID; ties break on rank, then name
    fn pick_promotion_candidate(
        &self,
        servers: &[Arc<ServerDescriptor>],
        old_master: &str,
    ) -> Result<Arc<ServerDescriptor>, String> {
        let mut best: Option<(&Arc<ServerDescriptor>, u64)> = None;

        for server in servers {
            if server.name == old_master {
                continue;
            }
            if self.config.servers_no_promotion.contains(&server.name) {
                continue;
            }
            let Some(probe) = self.probes.get(&server.name) else {
                continue;
            };
            if !probe.reachable || probe.slave.is_none() {
                continue;
            }
            let sequence = probe
                .gtid_current
                .as_ref()
                .map(GtidPosition::total_sequence)
                .unwrap_or(0);

            let better = match best {
                None => true,
                Some((current, current_seq)) => {
                    (sequence, std::cmp::Reverse(server.rank()), &server.name)
                        > (current_seq, std::cmp::Reverse(current.rank()), &current.name)
                }
            };
            if better {
                best = Some((server, sequence));
            }
        }

        best.map(|(server, _)| server.clone())
            .ok_or_else(|| "no eligible promotion candidate".to_string())
    }

    /// Wait until every surviving slave has caught up to the candidate's
    /// GTID (or stopped advancing) or the timeout elapses
    async fn wait_for_catch_up(
        &mut self,
        servers: &[Arc<ServerDescriptor>],
        candidate: &Arc<ServerDescriptor>,
        old_master: &str,
        timeout_secs: u64,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let mut previous: std::collections::HashMap<String, GtidPosition> = Default::default();

        while tokio::time::Instant::now() < deadline {
            let target = match self.fresh_probe(&candidate.name).await {
                Ok(p) => p.gtid_current.unwrap_or_default(),
                Err(_) => break,
            };

            let mut all_caught_up = true;
            for server in servers {
                if server.name == old_master || server.name == candidate.name {
                    continue;
                }
                let Ok(probe) = self.fresh_probe(&server.name).await else {
                    continue;
                };
                if probe.slave.is_none() {
                    continue;
                }
                let gtid = probe.gtid_current.unwrap_or_default();
                let caught_up = gtid.contains(&target);
                let stalled = previous.get(&server.name) == Some(&gtid);
                previous.insert(server.name.clone(), gtid);
                if !caught_up && !stalled {
                    all_caught_up = false;
                }
            }

            if all_caught_up {
                return;
            }
            tokio::time::sleep(CATCH_UP_POLL).await;
        }
        debug!(
            cluster = %self.cluster.name,
            "Catch-up wait ended at timeout"
        );
    }

    /// Promotion: stop and reset replication, clear read-only, run the
    /// optional promotion SQL file
    async fn promote(&mut self, candidate: &Arc<ServerDescriptor>) -> Result<(), String> {
        self.run_on(&candidate.name, "STOP SLAVE").await?;
        self.run_on(&candidate.name, "RESET SLAVE ALL").await?;
        self.run_on(&candidate.name, "SET GLOBAL read_only=0").await?;

        if let Some(path) = self.config.promotion_sql_file.clone() {
            let script = std::fs::read_to_string(&path)
                .map_err(|e| format!("could not read promotion file: {e}"))?;
            for statement in script.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                self.run_on(&candidate.name, statement).await?;
            }
        }
        Ok(())
    }

    /// Redirect every surviving slave to replicate from the new master
    async fn redirect_slaves(
        &mut self,
        servers: &[Arc<ServerDescriptor>],
        new_master: &Arc<ServerDescriptor>,
        old_master: &str,
    ) {
        for server in servers {
            if server.name == new_master.name || server.name == old_master {
                continue;
            }
            let reachable = self
                .probes
                .get(&server.name)
                .map(|p| p.reachable && p.slave.is_some())
                .unwrap_or(false);
            if !reachable {
                continue;
            }
            if let Err(e) = self.point_at(&server.name, new_master).await {
                warn!(
                    cluster = %self.cluster.name,
                    server = %server.name,
                    error = %e,
                    "Could not redirect slave to new master"
                );
            }
        }
    }

    /// CHANGE MASTER TO the given node and restart replication
    async fn point_at(
        &mut self,
        name: &str,
        master: &Arc<ServerDescriptor>,
    ) -> Result<(), String> {
        self.run_on(name, "STOP SLAVE").await.ok();
        let change = format!(
            "CHANGE MASTER TO MASTER_HOST='{}', MASTER_PORT={}, MASTER_USER='{}', \
             MASTER_PASSWORD='{}', MASTER_USE_GTID=slave_pos",
            master.host,
            master.port,
            self.config.replication_user,
            self.config.replication_password
        );
        self.run_on(name, &change).await?;
        self.run_on(name, "START SLAVE").await?;
        Ok(())
    }

    /// Execute one statement on a named server over the monitor's connection
    async fn run_on(&mut self, name: &str, sql: &str) -> Result<(), String> {
        let conn = self.monitor_conn(name).await?;
        conn.execute(sql).await.map_err(|e| e.to_string())
    }

    /// Probe one server right now, refreshing the stored result
    async fn fresh_probe(&mut self, name: &str) -> Result<ProbeResult, String> {
        let conn = self.monitor_conn(name).await?;
        match run_probe_queries(conn).await {
            Ok(probe) => {
                self.probes.insert(name.to_string(), probe.clone());
                Ok(probe)
            }
            Err(e) => {
                self.conns.remove(name);
                self.probes.insert(name.to_string(), ProbeResult::default());
                Err(e.to_string())
            }
        }
    }

    async fn monitor_conn(&mut self, name: &str) -> Result<&mut BackendConnection, String> {
        if !self.conns.contains_key(name) {
            let server = self
                .cluster
                .find(name)
                .ok_or_else(|| format!("unknown server {name}"))?;
            let conn = BackendConnection::connect(
                server,
                &self.auth,
                None,
                None,
                Duration::from_millis(self.config.connect_timeout_ms),
            )
            .await
            .map_err(|e| e.to_string())?;
            self.conns.insert(name.to_string(), conn);
        }
        Ok(self.conns.get_mut(name).expect("connection just inserted"))
    }
}
