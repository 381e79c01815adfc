//! Schema-sharding router session
//!
//! Each schema lives on exactly one backend server; the session tracks the
//! client's current schema (login default plus USE statements) and forwards
//! every statement to the server owning it. Statements naming no schema go
//! to the configured default server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::backend::{BackendAuth, BackendConnection, BackendError};
use crate::cluster::Cluster;
use crate::protocol::{Command, ErrPacket, Packet, PacketCodec, ReplyEvent};

use super::{PendingQuery, RouterAction, RouterError};

const ER_BAD_DB_ERROR: u16 = 1049;
const CR_SERVER_LOST: u16 = 2013;

/// Schema-router service parameters
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchemaRouterConfig {
    /// schema name -> server name
    pub schema_map: HashMap<String, String>,
    /// Server for statements outside any mapped schema
    pub default_server: Option<String>,
    pub connect_timeout_ms: u64,
}

struct SchemaBackend {
    server_name: String,
    conn: Option<BackendConnection>,
    reply_pending: bool,
}

/// The schema-sharding session router
pub struct SchemaRouterSession {
    session_id: u64,
    config: SchemaRouterConfig,
    cluster: Arc<Cluster>,
    backend_auth: BackendAuth,
    client_capabilities: u32,
    current_schema: Option<String>,
    backends: Vec<SchemaBackend>,
    /// Index of the backend serving the in-flight statement
    active: Option<usize>,
    expected_responses: usize,
    queue: std::collections::VecDeque<PendingQuery>,
    local_infile: bool,
}

impl SchemaRouterSession {
    pub fn new(
        session_id: u64,
        cluster: Arc<Cluster>,
        config: SchemaRouterConfig,
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
            current_schema: database,
            backends: Vec::new(),
            active: None,
            expected_responses: 0,
            queue: std::collections::VecDeque::new(),
            local_infile: false,
        }
    }

    pub fn can_route_queries(&self) -> bool {
        self.expected_responses == 0
    }

    pub fn local_infile_active(&self) -> bool {
        self.local_infile
    }

    fn server_for_schema(&self, schema: Option<&str>) -> Option<String> {
        schema
            .and_then(|s| self.config.schema_map.get(s).cloned())
            .or_else(|| self.config.default_server.clone())
    }

    async fn backend_for(&mut self, server_name: &str) -> Result<usize, RouterError> {
        if let Some(idx) = self
            .backends
            .iter()
            .position(|b| b.server_name == server_name && b.conn.is_some())
        {
            return Ok(idx);
        }

        let server = self
            .cluster
            .find(server_name)
            .filter(|s| s.is_usable())
            .ok_or(RouterError::NoTarget)?;

        let conn = BackendConnection::connect(
            server,
            &self.backend_auth,
            self.current_schema.as_deref(),
            Some(self.client_capabilities),
            Duration::from_millis(self.config.connect_timeout_ms.max(1000)),
        )
        .await?;

        self.backends.push(SchemaBackend {
            server_name: server_name.to_string(),
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

        // Track schema switches before resolving the target
        if command == Command::InitDb {
            let schema = String::from_utf8_lossy(&query.payload[1..]).to_string();
            self.current_schema = Some(schema);
        } else if command == Command::Query {
            if let Some(rest) = query
                .payload
                .get(1..)
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
            {
                if rest.len() > 4 && rest[..4].eq_ignore_ascii_case("USE ") {
                    self.current_schema =
                        Some(rest[4..].trim().trim_matches('`').to_string());
                }
            }
        }

        let Some(server_name) = self.server_for_schema(self.current_schema.as_deref()) else {
            let err = ErrPacket::new(
                ER_BAD_DB_ERROR,
                "42000",
                &format!(
                    "Unknown database '{}'",
                    self.current_schema.as_deref().unwrap_or("")
                ),
            );
            client.send(err.encode(1, self.client_capabilities)).await?;
            return Ok(RouterAction::Continue);
        };

        let idx = match self.backend_for(&server_name).await {
            Ok(idx) => idx,
            Err(e) => {
                warn!(
                    session_id = self.session_id,
                    server = %server_name,
                    error = %e,
                    "Schema target unavailable"
                );
                let err = ErrPacket::new(
                    CR_SERVER_LOST,
                    "HY000",
                    &format!("Could not connect to server {server_name}"),
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

        debug!(
            session_id = self.session_id,
            server = %server_name,
            schema = ?self.current_schema,
            "Statement routed by schema"
        );
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
                client.send(packet).await?;
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
                let name = self.backends[idx].server_name.clone();
                self.backends[idx].conn = None;
                if self.backends[idx].reply_pending {
                    self.backends[idx].reply_pending = false;
                    self.expected_responses = self.expected_responses.saturating_sub(1);
                }
                debug!(
                    session_id = self.session_id,
                    server = %name,
                    error = %e,
                    "Schema backend failed"
                );
                if pending {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_map() -> SchemaRouterSession {
        let mut schema_map = HashMap::new();
        schema_map.insert("orders".to_string(), "db-orders".to_string());
        schema_map.insert("billing".to_string(), "db-billing".to_string());

        SchemaRouterSession::new(
            1,
            Cluster::new("main", vec![]),
            SchemaRouterConfig {
                schema_map,
                default_server: Some("db-default".to_string()),
                connect_timeout_ms: 1000,
            },
            BackendAuth {
                user: "hermes".into(),
                password: String::new(),
            },
            0,
            Some("orders".to_string()),
        )
    }

    #[test]
    fn test_server_for_schema() {
        let session = session_with_map();
        assert_eq!(
            session.server_for_schema(Some("orders")).as_deref(),
            Some("db-orders")
        );
        assert_eq!(
            session.server_for_schema(Some("billing")).as_deref(),
            Some("db-billing")
        );
        // Unmapped schemas fall back to the default server
        assert_eq!(
            session.server_for_schema(Some("other")).as_deref(),
            Some("db-default")
        );
        assert_eq!(
            session.server_for_schema(None).as_deref(),
            Some("db-default")
        );
    }

    #[test]
    fn test_no_default_no_target() {
        let mut session = session_with_map();
        session.config.default_server = None;
        assert_eq!(session.server_for_schema(Some("unmapped")), None);
    }
}
