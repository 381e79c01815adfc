//! Runtime configuration objects
//!
//! Configuration is object oriented: named instances of {service, listener,
//! server, monitor, filter, user} with typed parameter maps. Objects created
//! at runtime persist as one stanza per object in the persistence directory;
//! at startup those stanzas overlay the operator-written file. Altering a
//! parameter that is not runtime-modifiable is rejected.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::backend::ServerDescriptor;
use crate::cluster::Cluster;
use crate::monitor::MonitorCommand;

use super::schema::{Config, ServerEntry};

/// Kinds of configuration objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Service,
    Listener,
    Server,
    Monitor,
    Filter,
    User,
}

impl ObjectKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "service" | "services" => Some(ObjectKind::Service),
            "listener" | "listeners" => Some(ObjectKind::Listener),
            "server" | "servers" => Some(ObjectKind::Server),
            "monitor" | "monitors" => Some(ObjectKind::Monitor),
            "filter" | "filters" => Some(ObjectKind::Filter),
            "user" | "users" => Some(ObjectKind::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Service => "service",
            ObjectKind::Listener => "listener",
            ObjectKind::Server => "server",
            ObjectKind::Monitor => "monitor",
            ObjectKind::Filter => "filter",
            ObjectKind::User => "user",
        }
    }
}

/// One configuration object: a name, a kind, and a typed parameter map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDef {
    pub kind: ObjectKind,
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} '{1}' already exists")]
    AlreadyExists(&'static str, String),

    #[error("{0} '{1}' not found")]
    NotFound(&'static str, String),

    #[error("parameter '{0}' is not modifiable at runtime")]
    NotModifiable(String),

    #[error("invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Parameters that may change while the proxy runs, per object kind
fn runtime_modifiable(kind: ObjectKind, param: &str) -> bool {
    match kind {
        ObjectKind::Server => matches!(param, "rank" | "maintenance" | "draining"),
        ObjectKind::Monitor => matches!(
            param,
            "interval_ms" | "failcount" | "auto_failover" | "auto_rejoin"
        ),
        ObjectKind::Service => matches!(
            param,
            "master_accept_reads"
                | "causal_reads"
                | "transaction_replay"
                | "retry_failed_reads"
                | "max_slave_connections"
        ),
        ObjectKind::User => matches!(param, "password"),
        ObjectKind::Listener | ObjectKind::Filter => false,
    }
}

/// Registry of live configuration objects
pub struct ObjectRegistry {
    objects: RwLock<BTreeMap<(ObjectKind, String), ObjectDef>>,
    persist_dir: Option<PathBuf>,
}

impl ObjectRegistry {
    pub fn new(persist_dir: Option<PathBuf>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            persist_dir,
        }
    }

    /// Read persisted stanzas back; they overlay the operator-written file
    pub fn load_persisted(&self) -> Vec<ObjectDef> {
        let Some(dir) = &self.persist_dir else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut loaded = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| toml::from_str::<ObjectDef>(&s).ok())
            {
                Some(def) => {
                    info!(
                        kind = def.kind.as_str(),
                        name = %def.name,
                        "Loaded persisted object"
                    );
                    self.objects
                        .write()
                        .insert((def.kind, def.name.clone()), def.clone());
                    loaded.push(def);
                }
                None => warn!(path = %path.display(), "Skipping unreadable stanza"),
            }
        }
        loaded
    }

    /// Register an object without persisting (startup from the main file)
    pub fn adopt(&self, def: ObjectDef) {
        self.objects.write().insert((def.kind, def.name.clone()), def);
    }

    pub fn create(&self, def: ObjectDef) -> Result<(), RuntimeError> {
        let key = (def.kind, def.name.clone());
        {
            let mut objects = self.objects.write();
            if objects.contains_key(&key) {
                return Err(RuntimeError::AlreadyExists(def.kind.as_str(), def.name));
            }
            objects.insert(key, def.clone());
        }
        self.persist(&def)?;
        info!(kind = def.kind.as_str(), name = %def.name, "Object created");
        Ok(())
    }

    pub fn destroy(&self, kind: ObjectKind, name: &str) -> Result<(), RuntimeError> {
        let removed = self
            .objects
            .write()
            .remove(&(kind, name.to_string()))
            .is_some();
        if !removed {
            return Err(RuntimeError::NotFound(kind.as_str(), name.to_string()));
        }
        if let Some(path) = self.stanza_path(kind, name) {
            let _ = std::fs::remove_file(path);
        }
        info!(kind = kind.as_str(), name = %name, "Object destroyed");
        Ok(())
    }

    /// Alter one parameter; rejected unless runtime-modifiable
    pub fn alter(
        &self,
        kind: ObjectKind,
        name: &str,
        param: &str,
        value: &str,
    ) -> Result<(), RuntimeError> {
        if !runtime_modifiable(kind, param) {
            return Err(RuntimeError::NotModifiable(param.to_string()));
        }
        let def = {
            let mut objects = self.objects.write();
            let def = objects
                .get_mut(&(kind, name.to_string()))
                .ok_or_else(|| RuntimeError::NotFound(kind.as_str(), name.to_string()))?;
            def.params.insert(param.to_string(), value.to_string());
            def.clone()
        };
        self.persist(&def)?;
        Ok(())
    }

    /// Replace a relationship parameter (comma-separated object names)
    pub fn alter_relationship(
        &self,
        kind: ObjectKind,
        name: &str,
        relation: &str,
        members: &[String],
    ) -> Result<(), RuntimeError> {
        if !matches!(relation, "servers" | "targets" | "filters") {
            return Err(RuntimeError::InvalidValue(
                relation.to_string(),
                "unknown relationship".to_string(),
            ));
        }
        let def = {
            let mut objects = self.objects.write();
            let def = objects
                .get_mut(&(kind, name.to_string()))
                .ok_or_else(|| RuntimeError::NotFound(kind.as_str(), name.to_string()))?;
            def.params
                .insert(relation.to_string(), members.join(","));
            def.clone()
        };
        self.persist(&def)?;
        Ok(())
    }

    pub fn list(&self, kind: ObjectKind) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Current attributes and relationships of one object
    pub fn show(&self, kind: ObjectKind, name: &str) -> Option<ObjectDef> {
        self.objects.read().get(&(kind, name.to_string())).cloned()
    }

    fn stanza_path(&self, kind: ObjectKind, name: &str) -> Option<PathBuf> {
        self.persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.toml", kind.as_str(), name)))
    }

    fn persist(&self, def: &ObjectDef) -> Result<(), RuntimeError> {
        let Some(path) = self.stanza_path(def.kind, &def.name) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(def).map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| RuntimeError::Persistence(e.to_string()))?;
        Ok(())
    }
}

/// Overlay persisted server objects onto the startup configuration
pub fn apply_server_overlay(config: &mut Config, persisted: &[ObjectDef]) {
    for def in persisted {
        if def.kind != ObjectKind::Server {
            continue;
        }
        if config.servers.iter().any(|s| s.name == def.name) {
            continue;
        }
        let Some(host) = def.params.get("host") else {
            continue;
        };
        config.servers.push(ServerEntry {
            name: def.name.clone(),
            host: host.clone(),
            port: def
                .params
                .get("port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(3306),
            rank: def
                .params
                .get("rank")
                .and_then(|r| r.parse().ok())
                .unwrap_or(1),
        });
    }
}

/// The operator-facing control surface: object queries and mutations plus
/// the monitor commands
pub struct ControlSurface {
    registry: Arc<ObjectRegistry>,
    cluster: Arc<Cluster>,
    monitor: mpsc::Sender<MonitorCommand>,
}

impl ControlSurface {
    pub fn new(
        registry: Arc<ObjectRegistry>,
        cluster: Arc<Cluster>,
        monitor: mpsc::Sender<MonitorCommand>,
    ) -> Self {
        Self {
            registry,
            cluster,
            monitor,
        }
    }

    pub fn list(&self, kind: ObjectKind) -> Vec<String> {
        self.registry.list(kind)
    }

    pub fn show(&self, kind: ObjectKind, name: &str) -> Option<ObjectDef> {
        self.registry.show(kind, name)
    }

    /// Create an object; server objects join the cluster immediately
    pub fn create(&self, def: ObjectDef) -> Result<(), RuntimeError> {
        self.registry.create(def.clone())?;
        if def.kind == ObjectKind::Server {
            if let Some(host) = def.params.get("host") {
                let port = def
                    .params
                    .get("port")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(3306);
                let rank = def
                    .params
                    .get("rank")
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(1);
                self.cluster
                    .add_server(ServerDescriptor::new(&def.name, host, port, rank));
            }
        }
        Ok(())
    }

    pub fn destroy(&self, kind: ObjectKind, name: &str) -> Result<(), RuntimeError> {
        self.registry.destroy(kind, name)?;
        if kind == ObjectKind::Server {
            self.cluster.remove_server(name);
        }
        Ok(())
    }

    /// Alter one parameter, applying server-side effects live
    pub fn alter(
        &self,
        kind: ObjectKind,
        name: &str,
        param: &str,
        value: &str,
    ) -> Result<(), RuntimeError> {
        self.registry.alter(kind, name, param, value)?;
        if kind == ObjectKind::Server {
            match param {
                "rank" => {
                    let rank: i64 = value.parse().map_err(|_| {
                        RuntimeError::InvalidValue(param.into(), value.into())
                    })?;
                    if let Some(server) = self.cluster.find(name) {
                        server.set_rank(rank);
                    }
                }
                "maintenance" => {
                    let on = value == "true" || value == "1";
                    self.cluster.set_maintenance(name, on);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn alter_relationship(
        &self,
        kind: ObjectKind,
        name: &str,
        relation: &str,
        members: &[String],
    ) -> Result<(), RuntimeError> {
        self.registry.alter_relationship(kind, name, relation, members)
    }

    /// Monitor-specific commands
    pub async fn failover(&self) -> Result<(), String> {
        self.monitor_command(|reply| MonitorCommand::Failover { reply })
            .await
    }

    pub async fn switchover(&self, new_master: &str) -> Result<(), String> {
        let new_master = new_master.to_string();
        self.monitor_command(move |reply| MonitorCommand::Switchover { new_master, reply })
            .await
    }

    pub async fn rejoin(&self, server: &str) -> Result<(), String> {
        let server = server.to_string();
        self.monitor_command(move |reply| MonitorCommand::Rejoin { server, reply })
            .await
    }

    pub async fn reset_replication(&self, new_master: Option<&str>) -> Result<(), String> {
        let new_master = new_master.map(str::to_string);
        self.monitor_command(move |reply| MonitorCommand::ResetReplication { new_master, reply })
            .await
    }

    async fn monitor_command<F>(&self, build: F) -> Result<(), String>
    where
        F: FnOnce(oneshot::Sender<Result<(), String>>) -> MonitorCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.monitor
            .send(build(tx))
            .await
            .map_err(|_| "monitor is not running".to_string())?;
        rx.await.map_err(|_| "monitor dropped the command".to_string())?
    }
}
