//! Hint-directed router session
//!
//! Routes purely on the hint attached to each statement, with a configured
//! default for unhinted statements. Useful for services where the client
//! (or a filter earlier in the chain) decides placement explicitly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::backend::{BackendAuth, BackendConnection, BackendError, ServerDescriptor};
use crate::classifier::TargetHint;
use crate::cluster::Cluster;
use crate::protocol::{Command, ErrPacket, Packet, PacketCodec, ReplyEvent};

use super::{PendingQuery, RouterAction, RouterError};

const CR_SERVER_LOST: u16 = 2013;

/// Hint-router service parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HintRouterConfig {
    /// Target for statements without a hint
    pub default_action: DefaultAction,
    /// Server used when `default_action` is `named`
    pub default_server: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for HintRouterConfig {
    fn default() -> Self {
        Self {
            default_action: DefaultAction::Master,
            default_server: None,
            connect_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Master,
    Slave,
    Named,
}

struct HintBackend {
    server: Arc<ServerDescriptor>,
    conn: Option<BackendConnection>,
    reply_pending: bool,
}

/// The hint-directed session router
pub struct HintRouterSession {
    session_id: u64,
    config: HintRouterConfig,
    cluster: Arc<Cluster>,
    backend_auth: BackendAuth,
    client_capabilities: u32,
    database: Option<String>,
    backends: Vec<HintBackend>,
    active: Option<usize>,
    last_used: Option<usize>,
    expected_responses: usize,
    queue: VecDeque<PendingQuery>,
    /// Round-robin cursor over slaves
    slave_cursor: usize,
    local_infile: bool,
}

impl HintRouterSession {
    pub fn new(
        session_id: u64,
        cluster: Arc<Cluster>,
        config: HintRouterConfig,
        backend_auth: BackendAuth,
        client_capabilities: u32,
        database: Option<String>,
    ) -> Self {
        Self {
            session_id,
            config,
            cluster,
            backend_auth,
            client_capabilities,
            database,
            backends: Vec::new(),
            active: None,
            last_used: None,
            expected_responses: 0,
            queue: VecDeque::new(),
            slave_cursor: 0,
            local_infile: false,
        }
    }

    pub fn can_route_queries(&self) -> bool {
        self.expected_responses == 0
    }

    pub fn local_infile_active(&self) -> bool {
        self.local_infile
    }

    /// Resolve the hint to a server, falling back to the default action
    fn resolve_server(&mut self, hint: &TargetHint) -> Option<Arc<ServerDescriptor>> {
        match hint {
            TargetHint::Master => self.cluster.master(),
            TargetHint::Slave | TargetHint::MaxRlag(_) => {
                let slaves = self.cluster.running_slaves();
                let slaves: Vec<_> = match hint {
                    TargetHint::MaxRlag(limit) => slaves
                        .into_iter()
                        .filter(|s| {
                            let lag = s.replication_lag();
                            lag >= 0 && lag <= *limit
                        })
                        .collect(),
                    _ => slaves,
                };
                if slaves.is_empty() {
                    return self.cluster.master();
                }
                let pick = slaves[self.slave_cursor % slaves.len()].clone();
                self.slave_cursor = self.slave_cursor.wrapping_add(1);
                Some(pick)
            }
            TargetHint::NamedServer(name) => self.cluster.find(name).filter(|s| s.is_usable()),
            TargetHint::LastUsed => self
                .last_used
                .and_then(|idx| self.backends.get(idx))
                .map(|b| b.server.clone()),
            TargetHint::All | TargetHint::Undefined => match self.config.default_action {
                DefaultAction::Master => self.cluster.master(),
                DefaultAction::Slave => self.resolve_server(&TargetHint::Slave),
                DefaultAction::Named => self
                    .config
                    .default_server
                    .as_ref()
                    .and_then(|name| self.cluster.find(name)),
            },
        }
    }

    async fn backend_for(
        &mut self,
        server: Arc<ServerDescriptor>,
    ) -> Result<usize, RouterError> {
        if let Some(idx) = self
            .backends
            .iter()
            .position(|b| b.server.name == server.name && b.conn.is_some())
        {
            return Ok(idx);
        }

        let conn = BackendConnection::connect(
            server.clone(),
            &self.backend_auth,
            self.database.as_deref(),
            Some(self.client_capabilities),
            Duration::from_millis(self.config.connect_timeout_ms),
        )
        .await?;

        self.backends.push(HintBackend {
            server,
            conn: Some(conn),
            reply_pending: false,
        });
        Ok(self.backends.len() - 1)
    }

    pub async fn route_query<S>(
        &mut self,
        query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.can_route_queries() {
            self.queue.push_back(query);
            return Ok(RouterAction::Continue);
        }

        let command = Command::from(query.payload.first().copied().unwrap_or(0xFF));

        // Fan a hinted "all" out to every known server
        if query.hint == TargetHint::All {
            return self.route_to_all(query, command, client).await;
        }

        let Some(server) = self.resolve_server(&query.hint) else {
            warn!(session_id = self.session_id, hint = ?query.hint, "No target for hint");
            let err = ErrPacket::new(CR_SERVER_LOST, "HY000", "No valid servers available");
            client.send(err.encode(1, self.client_capabilities)).await?;
            return Ok(RouterAction::Continue);
        };

        let idx = match self.backend_for(server.clone()).await {
            Ok(idx) => idx,
            Err(e) => {
                warn!(
                    session_id = self.session_id,
                    server = %server.name,
                    error = %e,
                    "Hinted target unreachable"
                );
                let err = ErrPacket::new(
                    CR_SERVER_LOST,
                    "HY000",
                    &format!("Could not connect to server {}", server.name),
                );
                client.send(err.encode(1, self.client_capabilities)).await?;
                return Ok(RouterAction::Continue);
            }
        };

        let conn = self.backends[idx].conn.as_mut().ok_or(RouterError::NoTarget)?;
        conn.send_command(command, query.payload.clone()).await?;
        if command.expects_response() {
            self.backends[idx].reply_pending = true;
            self.expected_responses += 1;
        }
        self.active = Some(idx);
        self.last_used = Some(idx);

        debug!(
            session_id = self.session_id,
            server = %self.backends[idx].server.name,
            hint = ?query.hint,
            "Statement routed by hint"
        );
        Ok(RouterAction::Continue)
    }

    /// Send to every reachable server; the first responder's reply goes to
    /// the client, the rest are consumed
    async fn route_to_all<S>(
        &mut self,
        query: PendingQuery,
        command: Command,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let servers: Vec<_> = self
            .cluster
            .servers()
            .into_iter()
            .filter(|s| s.is_usable())
            .collect();
        if servers.is_empty() {
            let err = ErrPacket::new(CR_SERVER_LOST, "HY000", "No valid servers available");
            client.send(err.encode(1, self.client_capabilities)).await?;
            return Ok(RouterAction::Continue);
        }

        let mut routed = 0usize;
        for server in servers {
            let Ok(idx) = self.backend_for(server).await else {
                continue;
            };
            let Some(conn) = self.backends[idx].conn.as_mut() else {
                continue;
            };
            if conn.send_command(command, query.payload.clone()).await.is_ok()
                && command.expects_response()
            {
                self.backends[idx].reply_pending = true;
                self.expected_responses += 1;
                routed += 1;
            }
        }

        // Only the first completed reply is forwarded
        self.active = None;
        debug!(session_id = self.session_id, fanout = routed, "Statement routed to all");
        Ok(RouterAction::Continue)
    }

    pub async fn route_continuation(&mut self, packet: Packet) -> Result<(), RouterError> {
        let idx = self.active.ok_or(RouterError::NoTarget)?;
        let conn = self.backends[idx].conn.as_mut().ok_or(RouterError::NoTarget)?;
        conn.send_continuation(packet).await?;
        Ok(())
    }

    pub async fn next_backend_event(
        &mut self,
    ) -> Option<(usize, Result<(Packet, ReplyEvent), BackendError>)> {
        let mut futures = Vec::new();
        for (idx, backend) in self.backends.iter_mut().enumerate() {
            if let Some(conn) = backend.conn.as_mut() {
                futures.push(Box::pin(async move { (idx, conn.recv_packet().await) }));
            }
        }
        if futures.is_empty() {
            return None;
        }
        let ((idx, result), _, _) = futures::future::select_all(futures).await;
        Some((idx, result))
    }

    pub async fn on_backend_event<S>(
        &mut self,
        idx: usize,
        event: Result<(Packet, ReplyEvent), BackendError>,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match event {
            Ok((packet, reply_event)) => {
                // In all-fanout mode only the designated (first active)
                // backend streams to the client
                let forward = match self.active {
                    Some(active) => active == idx,
                    None => {
                        self.active = Some(idx);
                        true
                    }
                };
                if forward {
                    client.send(packet).await?;
                }
                match reply_event {
                    ReplyEvent::Complete(_) => {
                        self.local_infile = false;
                        if self.backends[idx].reply_pending {
                            self.backends[idx].reply_pending = false;
                            self.expected_responses =
                                self.expected_responses.saturating_sub(1);
                        }
                        self.drain_queue(client).await
                    }
                    ReplyEvent::LocalInfileRequested => {
                        self.local_infile = true;
                        Ok(RouterAction::Continue)
                    }
                    ReplyEvent::Continue => Ok(RouterAction::Continue),
                }
            }
            Err(e) => {
                let pending = self.backends[idx].reply_pending;
                let name = self.backends[idx].server.name.clone();
                self.backends[idx].conn = None;
                if pending {
                    self.backends[idx].reply_pending = false;
                    self.expected_responses = self.expected_responses.saturating_sub(1);
                }
                debug!(
                    session_id = self.session_id,
                    server = %name,
                    error = %e,
                    "Hint backend failed"
                );
                if pending && self.active == Some(idx) {
                    let err = ErrPacket::new(
                        CR_SERVER_LOST,
                        "HY000",
                        &format!("Lost connection to backend server {name}"),
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                }
                Ok(RouterAction::Continue)
            }
        }
    }

    async fn drain_queue<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while self.expected_responses == 0 {
            let Some(query) = self.queue.pop_front() else {
                break;
            };
            match self.route_query(query, client).await? {
                RouterAction::Continue => {}
                other => return Ok(other),
            }
        }
        Ok(RouterAction::Continue)
    }

    pub fn kill_current_query(&mut self) {
        for backend in &mut self.backends {
            if backend.reply_pending {
                backend.conn = None;
                backend.reply_pending = false;
            }
        }
        self.expected_responses = 0;
    }
}
