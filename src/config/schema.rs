use std::path::PathBuf;

use serde::Deserialize;

use crate::monitor::MonitorConfig;
use crate::router::{HintRouterConfig, RwSplitConfig, SchemaRouterConfig};
use crate::session::RouterKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub servers: Vec<ServerEntry>,
    pub monitor: MonitorConfig,
    pub service: ServiceConfig,
    pub backend_auth: BackendAuthConfig,
    pub users: UserConfig,
    /// Directory runtime-created objects persist their stanzas into; read
    /// back at startup and overlaid on this file
    pub persistence_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Fixed worker count; every session is pinned to one worker
    pub workers: usize,
    pub server_version: String,
    /// 0 disables the limit
    pub max_connections: u32,
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 4006,
            workers: 4,
            server_version: "10.4.15-hermes".to_string(),
            max_connections: 0,
            metrics_enabled: true,
        }
    }
}

/// One configured backend server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_rank")]
    pub rank: i64,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_rank() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub cluster_name: String,
    pub router: RouterKind,
    pub rw_split: RwSplitConfig,
    pub schema: SchemaRouterConfig,
    pub hint: HintRouterConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cluster_name: "main".to_string(),
            router: RouterKind::default(),
            rw_split: RwSplitConfig::default(),
            schema: SchemaRouterConfig::default(),
            hint: HintRouterConfig::default(),
        }
    }
}

/// Credentials the proxy presents to backends
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendAuthConfig {
    pub user: String,
    pub password: String,
}

impl Default for BackendAuthConfig {
    fn default() -> Self {
        Self {
            user: "hermes".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Durable cache file so a restart authenticates without a backend
    pub cache_file: Option<PathBuf>,
    pub reload_interval_secs: u64,
    /// Let wildcard host patterns match loopback clients
    pub wildcard_matches_loopback: bool,
    /// Consecutive failures before a host is blocked (0 disables)
    pub max_auth_failures: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            cache_file: Some(PathBuf::from("data/users.toml")),
            reload_interval_secs: 30,
            wildcard_matches_loopback: false,
            max_auth_failures: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 4006

            [[servers]]
            name = "db1"
            host = "10.0.0.1"

            [[servers]]
            name = "db2"
            host = "10.0.0.2"
            port = 3307
            rank = 2

            [service]
            router = "read_write_split"

            [service.rw_split]
            causal_reads = true
            transaction_replay = true

            [monitor]
            interval_ms = 1000
            auto_failover = true
            "#,
        )
        .unwrap();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].port, 3306);
        assert_eq!(config.servers[1].rank, 2);
        assert!(config.service.rw_split.causal_reads);
        assert!(config.monitor.auto_failover);
        assert_eq!(config.server.workers, 4);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_port, 4006);
        assert_eq!(config.users.reload_interval_secs, 30);
        assert!(config.servers.is_empty());
    }
}
