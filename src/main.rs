mod auth;
mod backend;
mod classifier;
mod cluster;
mod config;
mod metrics;
mod monitor;
mod protocol;
mod router;
mod session;
#[cfg(test)]
mod testutil;
mod worker;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use auth::{Authenticator, HostBlocker, UserCache, UserFetcher};
use backend::{BackendAuth, ServerDescriptor};
use cluster::Cluster;
use config::{apply_server_overlay, Config, ObjectRegistry};
use monitor::ClusterMonitor;
use session::ServiceContext;
use worker::{KillDispatcher, WorkerPool};

/// Session id source; ids are cluster-unique for KILL addressing
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = load_or_default_config();

    // Persisted runtime objects overlay the operator-written file
    let registry = Arc::new(ObjectRegistry::new(config.persistence_dir.clone()));
    let persisted = registry.load_persisted();
    apply_server_overlay(&mut config, &persisted);

    // Operator-written objects join the registry so the control surface can
    // list and alter them alongside runtime-created ones
    for entry in &config.servers {
        registry.adopt(config::ObjectDef {
            kind: config::ObjectKind::Server,
            name: entry.name.clone(),
            params: [
                ("host".to_string(), entry.host.clone()),
                ("port".to_string(), entry.port.to_string()),
                ("rank".to_string(), entry.rank.to_string()),
            ]
            .into_iter()
            .collect(),
        });
    }

    let servers: Vec<Arc<ServerDescriptor>> = config
        .servers
        .iter()
        .map(|entry| ServerDescriptor::new(&entry.name, &entry.host, entry.port, entry.rank))
        .collect();
    if servers.is_empty() {
        warn!("No backend servers configured; every session will be refused");
    }
    let cluster = Cluster::new(&config.service.cluster_name, servers);

    let backend_auth = BackendAuth {
        user: config.backend_auth.user.clone(),
        password: config.backend_auth.password.clone(),
    };

    // User cache: durable file first, then a backend refresh
    let user_cache = Arc::new(UserCache::new(
        config.users.cache_file.clone(),
        Duration::from_secs(config.users.reload_interval_secs),
        config.users.wildcard_matches_loopback,
    ));
    match user_cache.load_file() {
        Ok(true) => {}
        Ok(false) => info!("No persisted user cache, waiting for first backend load"),
        Err(e) => warn!(error = %e, "Could not load persisted user cache"),
    }

    let fetcher = Arc::new(UserFetcher::new(
        cluster.servers(),
        backend_auth.clone(),
        Duration::from_millis(config.monitor.connect_timeout_ms),
    ));
    fetcher.reload(&user_cache).await;

    // Periodic account refresh, rate limited by the cache itself
    {
        let fetcher = fetcher.clone();
        let cache = user_cache.clone();
        let interval = Duration::from_secs(config.users.reload_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if cache.reload_permitted() {
                    fetcher.reload(&cache).await;
                }
            }
        });
    }

    let authenticator = Arc::new(Authenticator::new(
        user_cache.clone(),
        Arc::new(HostBlocker::new(config.users.max_auth_failures)),
        fetcher,
    ));

    // Monitor task with its operator command channel
    let shutdown = CancellationToken::new();
    let (monitor_tx, monitor_rx) = mpsc::channel(16);
    let cluster_monitor = ClusterMonitor::new(
        cluster.clone(),
        config.monitor.clone(),
        backend_auth.clone(),
        monitor_rx,
    );
    let monitor_shutdown = shutdown.clone();
    tokio::spawn(async move { cluster_monitor.run(monitor_shutdown).await });

    // The operator control surface is an in-process API: a CLI/REST
    // front-end is out of scope, so nothing in this binary drives it beyond
    // construction. A transport would own this value and translate its
    // commands onto the surface's calls.
    let _control = config::ControlSurface::new(registry, cluster.clone(), monitor_tx);

    let ctx = Arc::new(ServiceContext {
        cluster,
        router_kind: config.service.router,
        rw_config: config.service.rw_split.clone(),
        schema_config: config.service.schema.clone(),
        hint_config: config.service.hint.clone(),
        authenticator,
        backend_auth,
        server_version: config.server.server_version.clone(),
        kill_dispatcher: Arc::new(KillDispatcher::new()),
        max_connections: config.server.max_connections,
        active_connections: AtomicU32::new(0),
    });

    let pool = WorkerPool::spawn(config.server.workers, ctx.clone());

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "hermes proxy listening");

    if config.server.metrics_enabled {
        let metrics_addr = format!(
            "{}:{}",
            config.server.listen_addr,
            config.server.listen_port + 1000
        );
        info!(metrics_addr = %metrics_addr, "Metrics endpoint starting");
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Accept loop; sessions are pinned to a worker at accept time
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                // The worker re-registers the socket with its own reactor
                let std_stream = match stream.into_std() {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "Failed to detach client socket");
                        continue;
                    }
                };

                let session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                pool.assign(std_stream, peer.ip().to_string(), session_id);
            }
        }
    }

    shutdown.cancel();
    pool.shutdown();
    info!("hermes proxy shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/hermes.toml", "hermes.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(config::ConfigError::Io(_)) => {}
            Err(e) => {
                warn!(path = path, error = %e, "Failed to parse config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
