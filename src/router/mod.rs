//! Statement routing
//!
//! Three router implementations share one capability-set interface: route a
//! client statement, process a backend reply packet, handle a backend
//! failure. A variant enumeration picks the implementation per service; the
//! session drives whichever it holds through the same three entry points.

mod hint_route;
mod rw_split;
mod schema_route;
mod selection;
mod sescmd;
mod trx;

pub use hint_route::{DefaultAction, HintRouterConfig, HintRouterSession};
pub use rw_split::RwSplitSession;
pub use schema_route::{SchemaRouterConfig, SchemaRouterSession};
pub use selection::{select, Candidate, SelectionPolicy};
pub use sescmd::{SessionCommand, SessionCommandHistory};
pub use trx::Transaction;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::backend::BackendError;
use crate::classifier::{Classification, TargetHint};
use crate::protocol::{Packet, PacketCodec, ReplyEvent};

/// Behavior when no master is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the master is lost
    FailInstantly,
    /// Keep serving reads, close when a write arrives
    #[default]
    FailOnWrite,
    /// Keep serving reads, answer writes with a read-only error
    ErrorOnWrite,
}

/// Read/write-split service parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RwSplitConfig {
    pub policy: SelectionPolicy,
    /// Upper bound on slave connections per session
    pub max_slave_connections: usize,
    /// Let the master serve reads when it has spare capacity
    pub master_accept_reads: bool,
    /// Retry an idempotent read once when it fails before any bytes reached
    /// the client
    pub retry_failed_reads: bool,
    pub causal_reads: bool,
    pub causal_reads_timeout_secs: u64,
    pub transaction_replay: bool,
    pub transaction_replay_max_size: usize,
    pub transaction_replay_attempts: u32,
    /// Start read-only-looking transactions on a slave
    pub optimistic_trx: bool,
    pub master_failure_mode: MasterFailureMode,
    /// Close a backend connection idle past this many seconds (0 disables)
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    /// Slaves lagging more than this many seconds are not read candidates
    /// (0 disables the bound)
    pub max_slave_replication_lag: i64,
}

impl Default for RwSplitConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            max_slave_connections: 255,
            master_accept_reads: false,
            retry_failed_reads: true,
            causal_reads: false,
            causal_reads_timeout_secs: 10,
            transaction_replay: false,
            transaction_replay_max_size: 1024 * 1024,
            transaction_replay_attempts: 5,
            optimistic_trx: false,
            master_failure_mode: MasterFailureMode::default(),
            idle_timeout_secs: 0,
            connect_timeout_ms: 3000,
            max_slave_replication_lag: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("client write failed: {0}")]
    Client(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("no valid target for statement")]
    NoTarget,

    #[error("session must close: {0}")]
    Fatal(String),
}

/// What the session should do after a router callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterAction {
    Continue,
    /// Close the session; the router already told the client why (or the
    /// client is gone)
    CloseSession,
}

/// One queued or in-flight client statement
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub payload: Bytes,
    pub classification: Classification,
    pub hint: TargetHint,
}

/// Router implementation variants sharing the session-facing interface
pub enum RouterSession {
    ReadWriteSplit(Box<RwSplitSession>),
    Schema(Box<SchemaRouterSession>),
    Hint(Box<HintRouterSession>),
}

impl RouterSession {
    pub fn can_route_queries(&self) -> bool {
        match self {
            RouterSession::ReadWriteSplit(r) => r.can_route_queries(),
            RouterSession::Schema(r) => r.can_route_queries(),
            RouterSession::Hint(r) => r.can_route_queries(),
        }
    }

    pub async fn route_query<S>(
        &mut self,
        query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            RouterSession::ReadWriteSplit(r) => r.route_query(query, client).await,
            RouterSession::Schema(r) => r.route_query(query, client).await,
            RouterSession::Hint(r) => r.route_query(query, client).await,
        }
    }

    /// Await the next packet from any open backend; None when no backend is
    /// open
    pub async fn next_backend_event(
        &mut self,
    ) -> Option<(usize, Result<(Packet, ReplyEvent), BackendError>)> {
        match self {
            RouterSession::ReadWriteSplit(r) => r.next_backend_event().await,
            RouterSession::Schema(r) => r.next_backend_event().await,
            RouterSession::Hint(r) => r.next_backend_event().await,
        }
    }

    pub async fn on_backend_event<S>(
        &mut self,
        backend: usize,
        event: Result<(Packet, ReplyEvent), BackendError>,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            RouterSession::ReadWriteSplit(r) => r.on_backend_event(backend, event, client).await,
            RouterSession::Schema(r) => r.on_backend_event(backend, event, client).await,
            RouterSession::Hint(r) => r.on_backend_event(backend, event, client).await,
        }
    }

    /// A local-infile upload is streaming from the client to the current
    /// target
    pub fn local_infile_active(&self) -> bool {
        match self {
            RouterSession::ReadWriteSplit(r) => r.local_infile_active(),
            RouterSession::Schema(r) => r.local_infile_active(),
            RouterSession::Hint(r) => r.local_infile_active(),
        }
    }

    /// Forward a large-command continuation fragment to the current target
    pub async fn route_continuation(&mut self, packet: Packet) -> Result<(), RouterError> {
        match self {
            RouterSession::ReadWriteSplit(r) => r.route_continuation(packet).await,
            RouterSession::Schema(r) => r.route_continuation(packet).await,
            RouterSession::Hint(r) => r.route_continuation(packet).await,
        }
    }

    /// Close idle backend connections past the configured grace
    pub fn close_idle_backends(&mut self) {
        if let RouterSession::ReadWriteSplit(r) = self {
            r.close_idle_backends()
        }
    }

    /// Kill backend work for KILL QUERY handling: drop every backend
    /// connection with a reply outstanding
    pub fn kill_current_query(&mut self) {
        match self {
            RouterSession::ReadWriteSplit(r) => r.kill_current_query(),
            RouterSession::Schema(r) => r.kill_current_query(),
            RouterSession::Hint(r) => r.kill_current_query(),
        }
    }
}
