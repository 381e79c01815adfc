//! Read/write-split router session
//!
//! One instance per client session. Owns the session's backend connections,
//! picks a target per statement, fans session commands out to every backend,
//! and carries the resilience machinery: transaction replay after a master
//! failure, causal-read synchronization on slaves, and optimistic read-only
//! transactions started on a slave.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{BackendAuth, BackendConnection, BackendError, ServerDescriptor};
use crate::classifier::{StatementMask, TargetHint};
use crate::cluster::Cluster;
use crate::protocol::{
    Command, ErrPacket, Packet, PacketCodec, PrepareOk, ReplyEvent, ReplySummary,
};

use super::selection::{select, Candidate};
use super::sescmd::SessionCommandHistory;
use super::trx::Transaction;
use super::{MasterFailureMode, PendingQuery, RouterAction, RouterError, RwSplitConfig};

/// Error numbers with special routing-side handling
const ER_LOCK_DEADLOCK: u16 = 1213;
const ER_UNKNOWN_COM_ERROR: u16 = 1047; // wsrep not ready
const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
const ER_CONNECTION_KILLED: u16 = 1927;
const CR_SERVER_LOST: u16 = 2013;
const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;

/// What the pending reply on one backend is for
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingKind {
    None,
    /// A routed statement whose reply streams to the client
    Query,
    /// A fanned-out session command; only the authoritative reply reaches
    /// the client
    SessionCommand { position: u64, authoritative: bool },
    /// Reply is consumed and dropped, then a follow-up action runs
    Discard(AfterDiscard),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDiscard {
    Nothing,
    /// Optimistic-transaction rollback finished; migrate the transaction to
    /// the master and re-route the write that triggered it
    OtrxMigrate,
}

/// Slave-side state of a causal-read GTID wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum WaitGtidState {
    #[default]
    None,
    /// Expecting the OK/ERR of the prepended wait
    WaitingForHeader,
    /// Wait succeeded; renumber the following result packets from 1
    UpdatingPackets,
}

/// Optimistic transaction progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum OtrxState {
    #[default]
    Inactive,
    /// Open on a slave
    Active,
    /// ROLLBACK in flight on the slave
    RollingBack,
}

struct RouterBackend {
    server: Arc<ServerDescriptor>,
    conn: Option<BackendConnection>,
    pending: PendingKind,
    wait_gtid: WaitGtidState,
    /// Next sequence number while renumbering after a GTID wait
    next_seq: u8,
    /// First reply byte of the current exchange, for divergence checks
    reply_first_byte: Option<u8>,
    /// Bytes already forwarded to the client for the current reply
    forwarded_packets: usize,
    /// Internal prepared-statement ids per session-command position
    prepare_ids: HashMap<u64, u32>,
    /// External id -> this backend's internal id
    ps_map: HashMap<u32, u32>,
}

impl RouterBackend {
    fn new(server: Arc<ServerDescriptor>, conn: BackendConnection) -> Self {
        Self {
            server,
            conn: Some(conn),
            pending: PendingKind::None,
            wait_gtid: WaitGtidState::None,
            next_seq: 0,
            reply_first_byte: None,
            forwarded_packets: 0,
            prepare_ids: HashMap::new(),
            ps_map: HashMap::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn in_exchange(&self) -> bool {
        self.pending != PendingKind::None
    }

    fn close(&mut self) {
        self.conn = None;
        self.pending = PendingKind::None;
        self.wait_gtid = WaitGtidState::None;
    }
}

/// The read/write-split session router
pub struct RwSplitSession {
    session_id: u64,
    config: RwSplitConfig,
    cluster: Arc<Cluster>,
    backend_auth: BackendAuth,
    client_capabilities: u32,
    database: Option<String>,

    backends: Vec<RouterBackend>,
    current_master: Option<usize>,
    /// The backend the previous statement used
    prev_target: Option<usize>,
    expected_responses: usize,

    query_queue: VecDeque<PendingQuery>,
    /// The statement currently in flight, kept for retry and replay
    current_query: Option<PendingQuery>,

    sescmd: SessionCommandHistory,
    /// External prepared-statement id -> history position of its PREPARE
    ps_registry: HashMap<u32, u64>,

    /// Last master GTID seen in an OK session-track trailer
    gtid_pos: Option<String>,

    trx: Transaction,
    trx_target: Option<usize>,
    replay_attempts: u32,
    otrx_state: OtrxState,
    /// One transparent read retry per statement
    read_retried: bool,
    /// The backend asked for a local-infile upload; client packets stream
    /// through until the empty terminator
    local_infile: bool,
}

impl RwSplitSession {
    /// Create the router and open the initial backend set: the master plus
    /// up to `max_slave_connections` usable slaves
    pub async fn connect(
        session_id: u64,
        cluster: Arc<Cluster>,
        config: RwSplitConfig,
        backend_auth: BackendAuth,
        client_capabilities: u32,
        database: Option<String>,
    ) -> Result<Self, RouterError> {
        let mut session = Self {
            session_id,
            trx: Transaction::new(config.transaction_replay_max_size),
            config,
            cluster,
            backend_auth,
            client_capabilities,
            database,
            backends: Vec::new(),
            current_master: None,
            prev_target: None,
            expected_responses: 0,
            query_queue: VecDeque::new(),
            current_query: None,
            sescmd: SessionCommandHistory::new(),
            ps_registry: HashMap::new(),
            gtid_pos: None,
            trx_target: None,
            replay_attempts: 0,
            otrx_state: OtrxState::Inactive,
            read_retried: false,
            local_infile: false,
        };

        session.open_connections().await?;
        Ok(session)
    }

    async fn open_connections(&mut self) -> Result<(), RouterError> {
        let mut opened_slaves = 0usize;
        for server in self.cluster.servers() {
            if !server.is_usable() {
                continue;
            }
            let is_master = server.is_master();
            if !is_master && opened_slaves >= self.config.max_slave_connections {
                continue;
            }
            match self.open_backend(server.clone()).await {
                Ok(idx) => {
                    if is_master {
                        self.current_master = Some(idx);
                    } else {
                        opened_slaves += 1;
                    }
                }
                Err(e) => {
                    debug!(
                        session_id = self.session_id,
                        server = %server.name,
                        error = %e,
                        "Backend connect failed at session start"
                    );
                }
            }
        }

        if self.backends.iter().all(|b| !b.is_open()) {
            return Err(RouterError::NoTarget);
        }

        if self.current_master.is_none()
            && self.config.master_failure_mode == MasterFailureMode::FailInstantly
        {
            return Err(RouterError::Fatal("no master available".into()));
        }

        Ok(())
    }

    /// Open a connection to `server` and replay the session command history
    /// before making it routable
    async fn open_backend(&mut self, server: Arc<ServerDescriptor>) -> Result<usize, RouterError> {
        let mut conn = BackendConnection::connect(
            server.clone(),
            &self.backend_auth,
            self.database.as_deref(),
            Some(self.client_capabilities),
            Duration::from_millis(self.config.connect_timeout_ms),
        )
        .await?;

        // A fresh connection only becomes available once the stored history
        // has been acknowledged back to back
        let mut prepare_ids = HashMap::new();
        for cmd in self.sescmd.iter() {
            conn.send_command(cmd.command, cmd.payload.clone()).await?;
            if !cmd.command.expects_response() {
                continue;
            }
            let (packets, summary) = conn.read_reply().await?;
            if let Some(err) = &summary.error {
                return Err(RouterError::Backend(BackendError::Query(format!(
                    "history replay failed: {}",
                    err.error_message
                ))));
            }
            if let Some(first) = packets.first().and_then(|p| p.first_byte()) {
                if self.sescmd.response_diverges(cmd.position, first) {
                    return Err(RouterError::Backend(BackendError::Query(
                        "history replay diverged".into(),
                    )));
                }
            }
            if let Some(prepare) = summary.prepare {
                prepare_ids.insert(cmd.position, prepare.statement_id);
            }
        }

        let mut backend = RouterBackend::new(server, conn);
        backend.prepare_ids = prepare_ids;
        // Map replayed prepares to their external ids
        for (&external, &position) in &self.ps_registry {
            if let Some(&internal) = backend.prepare_ids.get(&position) {
                backend.ps_map.insert(external, internal);
            }
        }

        // Reuse a closed slot when one exists
        if let Some(idx) = self.backends.iter().position(|b| !b.is_open()) {
            self.backends[idx] = backend;
            Ok(idx)
        } else {
            self.backends.push(backend);
            Ok(self.backends.len() - 1)
        }
    }

    /// Admission check: a new statement may only be dispatched while no
    /// reply is outstanding
    pub fn can_route_queries(&self) -> bool {
        self.expected_responses == 0
    }

    /// A local-infile upload is in progress; client packets stream straight
    /// to the current target
    pub fn local_infile_active(&self) -> bool {
        self.local_infile
    }

    /// Await the next frame from any open backend
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

    /// Route one client statement, or queue it while a reply is outstanding
    pub async fn route_query<S>(
        &mut self,
        query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.can_route_queries() {
            debug!(
                session_id = self.session_id,
                queued = self.query_queue.len() + 1,
                "Reply outstanding, queueing statement"
            );
            self.query_queue.push_back(query);
            return Ok(RouterAction::Continue);
        }
        self.route_stmt(query, client).await
    }

    /// Forward a large-command continuation fragment to the previous target
    pub async fn route_continuation(&mut self, packet: Packet) -> Result<(), RouterError> {
        let Some(idx) = self.prev_target else {
            return Err(RouterError::NoTarget);
        };
        let Some(conn) = self.backends[idx].conn.as_mut() else {
            return Err(RouterError::NoTarget);
        };
        conn.send_continuation(packet).await?;
        Ok(())
    }

    async fn route_stmt<S>(
        &mut self,
        query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.read_retried = false;
        let mask = query.classification.mask;
        let command = Command::from(query.payload.first().copied().unwrap_or(0xFF));

        // Session commands replicate to every backend
        if is_session_command(command, mask) {
            return self.route_session_command(query, client).await;
        }

        // Transaction bookkeeping at statement entry
        if mask.starts_trx() && !self.trx.is_open() {
            self.trx.start();
            self.trx_target = None;
            self.replay_attempts = 0;
            if self.config.optimistic_trx
                && !mask.contains(StatementMask::READ_WRITE_TRX)
                && self.has_usable_slave()
            {
                self.otrx_state = OtrxState::Active;
            }
        }

        // A write inside an optimistic transaction rolls the slave back and
        // migrates onto the master
        if self.otrx_state == OtrxState::Active
            && self.trx.is_open()
            && (mask.is_write() || mask.contains(StatementMask::STMT_UNSAFE))
        {
            return self.start_otrx_migration(query).await;
        }

        let target = match self.resolve_target(&query, mask, command).await {
            Ok(idx) => idx,
            Err(RouterError::NoTarget) => {
                return self.handle_no_target(mask, client).await;
            }
            Err(e) => return Err(e),
        };

        self.send_to_backend(target, query, client).await
    }

    /// Pick the backend index for a non-session-command statement
    async fn resolve_target(
        &mut self,
        query: &PendingQuery,
        mask: StatementMask,
        command: Command,
    ) -> Result<usize, RouterError> {
        // Binary-protocol statement commands follow their prepared statement
        if command == Command::StmtExecute
            || command == Command::StmtReset
            || command == Command::StmtFetch
            || command == Command::StmtSendLongData
        {
            // Inside a transaction they still pin to the transaction target
            if !self.trx.is_open() {
                if let Some(idx) = self.prev_target {
                    if self.backends[idx].is_open() {
                        return Ok(idx);
                    }
                }
            }
        }

        // An open transaction pins writes (and, once locked, everything) to
        // the node it began on
        if self.trx.is_open() {
            if let Some(idx) = self.trx_target {
                if self.backends[idx].is_open() {
                    return Ok(idx);
                }
                return Err(RouterError::NoTarget);
            }
            // First statement after BEGIN decides the node
            let idx = if self.otrx_state == OtrxState::Active && mask.is_read() {
                self.pick_slave(None)
                    .or_else(|| self.master_backend())
                    .ok_or(RouterError::NoTarget)?
            } else {
                self.otrx_state = OtrxState::Inactive;
                self.master_backend().ok_or(RouterError::NoTarget)?
            };
            self.trx_target = Some(idx);
            return Ok(idx);
        }

        // Hints override classification for target selection only
        match &query.hint {
            TargetHint::Master => return self.master_backend().ok_or(RouterError::NoTarget),
            TargetHint::Slave => {
                return self
                    .pick_slave(None)
                    .or_else(|| self.master_backend())
                    .ok_or(RouterError::NoTarget)
            }
            TargetHint::NamedServer(name) => {
                if let Some(idx) = self.backend_by_name(name) {
                    return Ok(idx);
                }
                // Fall back to policy when the named server is gone
                warn!(
                    session_id = self.session_id,
                    server = %name,
                    "Hinted server not available, falling back"
                );
            }
            TargetHint::LastUsed => {
                if let Some(idx) = self.prev_target {
                    if self.backends[idx].is_open() {
                        return Ok(idx);
                    }
                }
            }
            TargetHint::MaxRlag(limit) => {
                if let Some(idx) = self.pick_slave(Some(*limit)) {
                    return Ok(idx);
                }
            }
            TargetHint::All | TargetHint::Undefined => {}
        }

        if mask.is_read() && !mask.contains(StatementMask::STMT_UNSAFE) {
            return self
                .pick_slave(None)
                .or_else(|| self.master_backend())
                .ok_or(RouterError::NoTarget);
        }

        self.master_backend().ok_or(RouterError::NoTarget)
    }

    /// Read target preference: a running slave by policy, then the master
    /// when it accepts reads, then any other running node
    fn pick_slave(&self, rlag_override: Option<i64>) -> Option<usize> {
        let rlag_limit = rlag_override.unwrap_or(self.config.max_slave_replication_lag);

        let mut candidates = Vec::new();
        let mut indexes = Vec::new();
        for (idx, backend) in self.backends.iter().enumerate() {
            if !backend.is_open() || backend.in_exchange() {
                continue;
            }
            let server = &backend.server;
            let acts_slave = server.is_slave()
                || (server.is_master() && self.config.master_accept_reads);
            if !acts_slave || !server.is_usable() {
                continue;
            }
            if rlag_limit > 0 {
                let lag = server.replication_lag();
                if lag > rlag_limit {
                    continue;
                }
            }
            candidates.push(Candidate {
                server: server.clone(),
                router_connections: 1,
            });
            indexes.push(idx);
        }

        select(self.config.policy, &candidates).map(|pos| indexes[pos])
    }

    fn master_backend(&self) -> Option<usize> {
        let idx = self.current_master?;
        let backend = &self.backends[idx];
        if backend.is_open() && backend.server.is_master() {
            Some(idx)
        } else {
            None
        }
    }

    fn backend_by_name(&self, name: &str) -> Option<usize> {
        self.backends
            .iter()
            .position(|b| b.is_open() && b.server.name == name)
    }

    fn has_usable_slave(&self) -> bool {
        self.backends
            .iter()
            .any(|b| b.is_open() && b.server.is_slave() && b.server.is_usable())
    }

    async fn handle_no_target<S>(
        &mut self,
        mask: StatementMask,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if mask.is_write()
            && self.config.master_failure_mode == MasterFailureMode::ErrorOnWrite
        {
            let err = ErrPacket::new(
                ER_OPTION_PREVENTS_STATEMENT,
                "HY000",
                "The MariaDB server is running with the --read-only option so it cannot execute this statement",
            );
            client
                .send(err.encode(1, self.client_capabilities))
                .await?;
            return Ok(RouterAction::Continue);
        }

        warn!(
            session_id = self.session_id,
            "Could not find a valid target, closing session"
        );
        Ok(RouterAction::CloseSession)
    }

    async fn send_to_backend<S>(
        &mut self,
        idx: usize,
        mut query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let command = Command::from(query.payload.first().copied().unwrap_or(0xFF));

        // Remap the external prepared-statement id to this backend's own
        if let Some(external) = stmt_command_id(command, &query.payload) {
            match self.backends[idx].ps_map.get(&external) {
                Some(&internal) if internal != external => {
                    query.payload =
                        crate::protocol::rewrite_stmt_id(&query.payload, internal);
                }
                Some(_) => {}
                None => {
                    let err = ErrPacket::new(
                        ER_UNKNOWN_STMT_HANDLER,
                        "HY000",
                        &format!("Unknown prepared statement handler ({external}) given"),
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                    return Ok(RouterAction::Continue);
                }
            }
        }

        // Causal read: prepend a GTID wait before a slave read so the slave
        // has observed the last master transaction this session saw
        let mut payload = query.payload.clone();
        if self.config.causal_reads
            && command == Command::Query
            && !self.trx.is_open()
            && self.backends[idx].server.is_slave()
        {
            if let Some(gtid) = &self.gtid_pos {
                payload = prefix_wait_gtid(
                    gtid,
                    self.config.causal_reads_timeout_secs,
                    &query.payload,
                );
                self.backends[idx].wait_gtid = WaitGtidState::WaitingForHeader;
            }
        }

        let expects_response = command.expects_response();
        {
            let backend = &mut self.backends[idx];
            let conn = backend.conn.as_mut().ok_or(RouterError::NoTarget)?;
            conn.send_command(command, payload).await?;
            backend.pending = if expects_response {
                PendingKind::Query
            } else {
                PendingKind::None
            };
            backend.reply_first_byte = None;
            backend.forwarded_packets = 0;
        }

        self.prev_target = Some(idx);
        if expects_response {
            self.expected_responses += 1;
            self.current_query = Some(query);
        } else {
            self.current_query = None;
        }

        debug!(
            session_id = self.session_id,
            server = %self.backends[idx].server.name,
            command = ?command,
            "Statement routed"
        );
        Ok(RouterAction::Continue)
    }

    /// Fan a session command out to every open backend
    async fn route_session_command<S>(
        &mut self,
        query: PendingQuery,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let command = Command::from(query.payload.first().copied().unwrap_or(0xFF));

        // COM_STMT_CLOSE fans out without a response and prunes the history
        if command == Command::StmtClose {
            if let Some(external) = query.payload.get(1..5).map(|b| {
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }) {
                self.close_prepared_statement(external).await;
            }
            return Ok(RouterAction::Continue);
        }

        if self.backends.iter().all(|b| !b.is_open()) {
            let err = ErrPacket::new(CR_SERVER_LOST, "HY000", "No backend servers available");
            client.send(err.encode(1, self.client_capabilities)).await?;
            return Ok(RouterAction::CloseSession);
        }

        let position = self.sescmd.append(command, query.payload.clone());
        let authoritative_idx = self
            .master_backend()
            .or_else(|| self.backends.iter().position(|b| b.is_open()));

        let mut sent = 0usize;
        for idx in 0..self.backends.len() {
            let backend = &mut self.backends[idx];
            let Some(conn) = backend.conn.as_mut() else {
                continue;
            };
            if let Err(e) = conn.send_command(command, query.payload.clone()).await {
                debug!(
                    session_id = self.session_id,
                    server = %backend.server.name,
                    error = %e,
                    "Session command send failed, closing backend"
                );
                backend.close();
                continue;
            }
            backend.pending = PendingKind::SessionCommand {
                position,
                authoritative: Some(idx) == authoritative_idx,
            };
            backend.reply_first_byte = None;
            backend.forwarded_packets = 0;
            if command.expects_response() {
                sent += 1;
            } else {
                backend.pending = PendingKind::None;
            }
        }

        if sent == 0 && command.expects_response() {
            return Ok(RouterAction::CloseSession);
        }

        self.expected_responses += sent;
        self.current_query = None;

        // A session command inside a recorded transaction replays with it
        if self.trx.is_open() {
            self.trx.add_statement(query.payload.clone());
        }

        debug!(
            session_id = self.session_id,
            position,
            fanout = sent,
            "Session command replicated"
        );
        Ok(RouterAction::Continue)
    }

    /// Tear down one prepared statement everywhere
    async fn close_prepared_statement(&mut self, external: u32) {
        if let Some(position) = self.ps_registry.remove(&external) {
            self.sescmd.prune_prepare(position);
        }
        for backend in &mut self.backends {
            let Some(&internal) = backend.ps_map.get(&external) else {
                continue;
            };
            backend.ps_map.remove(&external);
            backend.prepare_ids.retain(|_, id| *id != internal);
            if let Some(conn) = backend.conn.as_mut() {
                let mut payload = BytesMut::with_capacity(5);
                payload.extend_from_slice(&[0x19]);
                payload.extend_from_slice(&internal.to_le_bytes());
                let _ = conn.send_command(Command::StmtClose, payload.freeze()).await;
            }
        }
    }

    /// Process one backend frame
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
                self.on_backend_packet(idx, packet, reply_event, client).await
            }
            Err(e) => self.on_backend_error(idx, e, client).await,
        }
    }

    async fn on_backend_packet<S>(
        &mut self,
        idx: usize,
        mut packet: Packet,
        event: ReplyEvent,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.backends[idx].reply_first_byte.is_none() {
            self.backends[idx].reply_first_byte = packet.first_byte();
        }

        match self.backends[idx].pending.clone() {
            PendingKind::None => {
                // Unsolicited data is a protocol violation
                warn!(
                    session_id = self.session_id,
                    server = %self.backends[idx].server.name,
                    "Unsolicited packet from idle backend, closing it"
                );
                self.backends[idx].close();
                Ok(RouterAction::Continue)
            }

            PendingKind::Query => {
                // Causal-read wait header handling comes first
                match self.backends[idx].wait_gtid {
                    WaitGtidState::WaitingForHeader => {
                        return self.on_wait_gtid_header(idx, packet, event, client).await;
                    }
                    WaitGtidState::UpdatingPackets => {
                        packet.sequence_id = self.backends[idx].next_seq;
                        self.backends[idx].next_seq =
                            self.backends[idx].next_seq.wrapping_add(1);
                    }
                    WaitGtidState::None => {}
                }

                // A replayable error mid-transaction is consumed, not
                // forwarded; the transaction is replayed instead
                if let ReplyEvent::Complete(summary) = &event {
                    if let Some(err) = &summary.error {
                        if self.trx.is_open()
                            && self.config.transaction_replay
                            && Some(idx) == self.trx_target
                            && is_replayable_error(err.error_code)
                        {
                            info!(
                                session_id = self.session_id,
                                code = err.error_code,
                                "Transient transaction error, starting replay"
                            );
                            self.finish_exchange(idx);
                            return self.start_trx_replay(client).await;
                        }
                    }
                }

                // Stream to the client and fold into the transaction checksum
                let frame = encode_frame(&packet);
                if self.trx.is_open() && Some(idx) == self.trx_target {
                    self.trx.add_reply_bytes(&frame);
                }
                client.send(packet).await?;
                self.backends[idx].forwarded_packets += 1;

                match event {
                    ReplyEvent::Complete(summary) => {
                        self.local_infile = false;
                        self.on_query_complete(idx, summary);
                        self.route_stored_query(client).await
                    }
                    ReplyEvent::LocalInfileRequested => {
                        self.local_infile = true;
                        Ok(RouterAction::Continue)
                    }
                    ReplyEvent::Continue => Ok(RouterAction::Continue),
                }
            }

            PendingKind::SessionCommand {
                position,
                authoritative,
            } => {
                if authoritative {
                    client.send(packet.clone()).await?;
                }
                if let ReplyEvent::Complete(summary) = event {
                    self.on_sescmd_complete(idx, position, authoritative, &summary);
                    return self.route_stored_query(client).await;
                }
                Ok(RouterAction::Continue)
            }

            PendingKind::Discard(after) => {
                if let ReplyEvent::Complete(_) = event {
                    self.finish_exchange(idx);
                    if after == AfterDiscard::OtrxMigrate {
                        return self.finish_otrx_migration(client).await;
                    }
                }
                Ok(RouterAction::Continue)
            }
        }
    }

    async fn on_wait_gtid_header<S>(
        &mut self,
        idx: usize,
        packet: Packet,
        event: ReplyEvent,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match packet.first_byte() {
            Some(0x00) => {
                // Wait satisfied: swallow the OK and renumber what follows
                self.backends[idx].wait_gtid = WaitGtidState::UpdatingPackets;
                self.backends[idx].next_seq = 1;
                Ok(RouterAction::Continue)
            }
            _ => {
                // Wait failed: the whole batch aborted; retry on the master
                self.backends[idx].wait_gtid = WaitGtidState::None;
                if matches!(event, ReplyEvent::Complete(_)) {
                    self.finish_exchange(idx);
                    let Some(query) = self.current_query.take() else {
                        return Ok(RouterAction::Continue);
                    };
                    info!(
                        session_id = self.session_id,
                        "Causal read wait failed on slave, retrying on master"
                    );
                    let Some(master) = self.master_backend() else {
                        return self.handle_no_target(StatementMask::READ, client).await;
                    };
                    return self.send_to_backend(master, query, client).await;
                }
                Ok(RouterAction::Continue)
            }
        }
    }

    fn on_query_complete(&mut self, idx: usize, summary: ReplySummary) {
        self.finish_exchange(idx);
        self.backends[idx].wait_gtid = WaitGtidState::None;

        // Remember the last master-issued GTID for causal reads
        if let Some(gtid) = summary.gtid() {
            self.gtid_pos = Some(gtid.to_string());
        }

        let query = self.current_query.take();

        if summary.error.is_none() {
            if let Some(query) = &query {
                let mask = query.classification.mask;
                if self.trx.is_open() && Some(idx) == self.trx_target {
                    if !mask.ends_trx() {
                        self.trx.add_statement(query.payload.clone());
                    }
                }
                if mask.ends_trx() {
                    self.trx.close();
                    self.trx_target = None;
                    self.otrx_state = OtrxState::Inactive;
                    self.replay_attempts = 0;
                }
            }
        }
    }

    fn on_sescmd_complete(
        &mut self,
        idx: usize,
        position: u64,
        authoritative: bool,
        summary: &ReplySummary,
    ) {
        self.finish_exchange(idx);
        let first_byte = self.backends[idx].reply_first_byte.unwrap_or(0xFF);

        if let Some(prepare) = summary.prepare {
            self.backends[idx]
                .prepare_ids
                .insert(position, prepare.statement_id);
        }

        if authoritative {
            self.sescmd.record_response(position, first_byte);
            if let Some(prepare) = summary.prepare {
                self.register_prepare(idx, position, prepare);
            }
            if let Some(gtid) = summary.gtid() {
                self.gtid_pos = Some(gtid.to_string());
            }
        } else if self.sescmd.response_diverges(position, first_byte) {
            // A diverging backend can no longer answer for this session
            warn!(
                session_id = self.session_id,
                server = %self.backends[idx].server.name,
                position,
                "Session command response diverged, closing backend"
            );
            self.backends[idx].close();
        } else {
            // If the authoritative prepare already completed, map this
            // backend's internal id to the external id now
            let external = self
                .ps_registry
                .iter()
                .find(|(_, &pos)| pos == position)
                .map(|(&ext, _)| ext);
            if let Some(external) = external {
                if let Some(&internal) = self.backends[idx].prepare_ids.get(&position) {
                    self.backends[idx].ps_map.insert(external, internal);
                }
            }
        }
    }

    /// The authoritative PREPARE's statement id becomes the external id the
    /// client sees; every backend maps it to its own internal id
    fn register_prepare(&mut self, auth_idx: usize, position: u64, prepare: PrepareOk) {
        let external = prepare.statement_id;
        self.ps_registry.insert(external, position);
        for backend in &mut self.backends {
            if let Some(&internal) = backend.prepare_ids.get(&position) {
                backend.ps_map.insert(external, internal);
            }
        }
        debug!(
            session_id = self.session_id,
            external,
            server = %self.backends[auth_idx].server.name,
            "Prepared statement registered"
        );
    }

    fn finish_exchange(&mut self, idx: usize) {
        if self.backends[idx].pending != PendingKind::None {
            self.backends[idx].pending = PendingKind::None;
            self.expected_responses = self.expected_responses.saturating_sub(1);
        }
        self.backends[idx].reply_first_byte = None;
    }

    /// When the last expected response completes, the queue drains
    async fn route_stored_query<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while self.expected_responses == 0 {
            let Some(query) = self.query_queue.pop_front() else {
                break;
            };
            match self.route_stmt(query, client).await? {
                RouterAction::Continue => {}
                other => return Ok(other),
            }
        }
        Ok(RouterAction::Continue)
    }

    async fn on_backend_error<S>(
        &mut self,
        idx: usize,
        error: BackendError,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pending = self.backends[idx].pending.clone();
        let was_master = Some(idx) == self.current_master;
        let server_name = self.backends[idx].server.name.clone();

        debug!(
            session_id = self.session_id,
            server = %server_name,
            error = %error,
            pending = ?pending,
            "Backend connection failed"
        );

        self.finish_exchange(idx);
        self.backends[idx].close();
        if was_master {
            self.current_master = None;
        }

        match pending {
            PendingKind::None => Ok(RouterAction::Continue),

            PendingKind::SessionCommand { authoritative, .. } => {
                if authoritative {
                    // The client's pending acknowledgement can no longer be
                    // produced faithfully
                    let err = ErrPacket::new(
                        CR_SERVER_LOST,
                        "HY000",
                        &format!("Lost connection to backend server {server_name}"),
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                    return Ok(RouterAction::CloseSession);
                }
                // A failing non-authoritative backend is closed silently
                self.route_stored_query(client).await
            }

            PendingKind::Discard(AfterDiscard::OtrxMigrate) => {
                // Slave died mid-rollback; the migration proceeds anyway
                self.finish_otrx_migration(client).await
            }
            PendingKind::Discard(AfterDiscard::Nothing) => Ok(RouterAction::Continue),

            PendingKind::Query => {
                // Mid-transaction master failure triggers replay
                if self.trx.is_open() && Some(idx) == self.trx_target {
                    if self.config.transaction_replay {
                        return self.start_trx_replay(client).await;
                    }
                    let err = ErrPacket::new(
                        CR_SERVER_LOST,
                        "HY000",
                        "Connection was killed mid-transaction",
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                    return Ok(RouterAction::CloseSession);
                }

                // A read that failed before any bytes reached the client is
                // retried once on another eligible candidate
                let can_retry_read = self.config.retry_failed_reads
                    && !self.read_retried
                    && self.backends[idx].forwarded_packets == 0
                    && self
                        .current_query
                        .as_ref()
                        .map(|q| q.classification.mask.is_read())
                        .unwrap_or(false);

                if can_retry_read {
                    if let Some(query) = self.current_query.take() {
                        if let Some(target) = self.pick_slave(None).or_else(|| self.master_backend())
                        {
                            info!(
                                session_id = self.session_id,
                                from = %server_name,
                                to = %self.backends[target].server.name,
                                "Retrying failed read"
                            );
                            self.read_retried = true;
                            return self.send_to_backend(target, query, client).await;
                        }
                    }
                }

                if was_master
                    && self.config.master_failure_mode != MasterFailureMode::FailInstantly
                    && self
                        .current_query
                        .as_ref()
                        .map(|q| !q.classification.mask.is_write())
                        .unwrap_or(false)
                {
                    // Reads may continue against slaves
                    let err = ErrPacket::new(
                        CR_SERVER_LOST,
                        "HY000",
                        &format!("Lost connection to backend server {server_name}"),
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                    self.current_query = None;
                    return self.route_stored_query(client).await;
                }

                let err = ErrPacket::new(
                    CR_SERVER_LOST,
                    "HY000",
                    &format!("Lost connection to backend server {server_name}"),
                );
                client.send(err.encode(1, self.client_capabilities)).await?;
                self.current_query = None;

                if self.backends.iter().any(|b| b.is_open()) {
                    self.route_stored_query(client).await
                } else {
                    Ok(RouterAction::CloseSession)
                }
            }
        }
    }

    /// Replay the recorded transaction on a surviving master-eligible node
    async fn start_trx_replay<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let interrupted = self.current_query.take();
        let original = self.trx.snapshot();

        loop {
            self.replay_attempts += 1;
            if self.replay_attempts > self.config.transaction_replay_attempts
                || !original.replayable()
            {
                return self.fail_replay(client, "Transaction replay attempts exhausted").await;
            }

            info!(
                session_id = self.session_id,
                attempt = self.replay_attempts,
                statements = original.statements().len(),
                "Replaying transaction"
            );

            match self.replay_once(&original).await {
                Ok(ReplayVerdict::Match { target }) => {
                    // Resume the open transaction on the new node
                    self.trx_target = Some(target);
                    self.current_master = Some(target);
                    if let Some(query) = interrupted {
                        return self.send_to_backend(target, query, client).await;
                    }
                    return self.route_stored_query(client).await;
                }
                Ok(ReplayVerdict::ChecksumMismatch) => {
                    let err = ErrPacket::new(
                        ER_CONNECTION_KILLED,
                        "HY000",
                        "Transaction checksum mismatch encountered when replaying transaction",
                    );
                    client.send(err.encode(1, self.client_capabilities)).await?;
                    return Ok(RouterAction::CloseSession);
                }
                Err(e) => {
                    debug!(
                        session_id = self.session_id,
                        error = %e,
                        "Replay attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn replay_once(&mut self, original: &Transaction) -> Result<ReplayVerdict, RouterError> {
        // A reconnection to a master-eligible node must be available
        let master = self
            .cluster
            .master()
            .filter(|m| m.is_usable())
            .ok_or(RouterError::NoTarget)?;

        let target = match self.backend_by_name(&master.name) {
            Some(idx) => idx,
            None => self.open_backend(master).await?,
        };

        // Each replay restores from the original snapshot
        let mut replayed = Transaction::new(self.config.transaction_replay_max_size);
        replayed.start();

        let conn = self.backends[target]
            .conn
            .as_mut()
            .ok_or(RouterError::NoTarget)?;
        replay_statements(conn, original.statements(), &mut replayed).await?;

        if replayed.checksum() == original.checksum() {
            // Adopt the replayed record as the live transaction
            self.trx = replayed;
            Ok(ReplayVerdict::Match { target })
        } else {
            Ok(ReplayVerdict::ChecksumMismatch)
        }
    }

    async fn fail_replay<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        reason: &str,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        warn!(session_id = self.session_id, reason, "Transaction replay failed");
        let err = ErrPacket::new(CR_SERVER_LOST, "HY000", reason);
        client.send(err.encode(1, self.client_capabilities)).await?;
        Ok(RouterAction::CloseSession)
    }

    /// A write arrived inside an optimistic slave-side transaction: roll the
    /// slave back, then replay the transaction on the master
    async fn start_otrx_migration(
        &mut self,
        query: PendingQuery,
    ) -> Result<RouterAction, RouterError> {
        let Some(idx) = self.trx_target else {
            // BEGIN was routed nowhere yet; just pin to the master
            self.otrx_state = OtrxState::Inactive;
            self.query_queue.push_front(query);
            return Ok(RouterAction::Continue);
        };

        info!(
            session_id = self.session_id,
            slave = %self.backends[idx].server.name,
            "Write in optimistic transaction, migrating to master"
        );

        self.otrx_state = OtrxState::RollingBack;
        self.current_query = Some(query);

        if let Some(conn) = self.backends[idx].conn.as_mut() {
            conn.send_command(Command::Query, Bytes::from_static(b"\x03ROLLBACK"))
                .await?;
            self.backends[idx].pending = PendingKind::Discard(AfterDiscard::OtrxMigrate);
            self.expected_responses += 1;
        } else {
            return self.fail_otrx_migration();
        }

        Ok(RouterAction::Continue)
    }

    fn fail_otrx_migration(&mut self) -> Result<RouterAction, RouterError> {
        Err(RouterError::Fatal(
            "optimistic transaction migration failed".into(),
        ))
    }

    /// Rollback acknowledged: replay the recorded statements on the master
    /// and release the write that triggered the migration
    async fn finish_otrx_migration<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
    ) -> Result<RouterAction, RouterError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.otrx_state = OtrxState::Inactive;
        let original = self.trx.snapshot();
        let interrupted = self.current_query.take();

        let Some(master) = self.cluster.master().filter(|m| m.is_usable()) else {
            return self
                .fail_replay(client, "No master available for transaction migration")
                .await;
        };
        let target = match self.backend_by_name(&master.name) {
            Some(idx) => idx,
            None => self.open_backend(master).await?,
        };

        // The slave's replies are not compared against the master's here:
        // the migration re-runs the read-only prefix on the master and the
        // transaction continues from its state
        let mut migrated = Transaction::new(self.config.transaction_replay_max_size);
        migrated.start();
        let result = {
            let conn = self.backends[target]
                .conn
                .as_mut()
                .ok_or(RouterError::NoTarget)?;
            replay_statements(conn, original.statements(), &mut migrated).await
        };
        if let Err(e) = result {
            return self
                .fail_replay(client, &format!("Transaction migration failed: {e}"))
                .await;
        }

        self.trx = migrated;
        self.trx_target = Some(target);

        if let Some(query) = interrupted {
            return self.send_to_backend(target, query, client).await;
        }
        self.route_stored_query(client).await
    }

    /// After COM_CHANGE_USER validates, wipe per-user backend state: the
    /// session command history and prepared statements belong to the old
    /// user, and every backend connection is reset so no variables leak
    pub async fn reset_backends_after_change_user(
        &mut self,
        database: Option<&str>,
    ) -> Result<(), RouterError> {
        self.sescmd = SessionCommandHistory::new();
        self.ps_registry.clear();
        self.gtid_pos = None;
        self.query_queue.clear();
        self.database = database.map(str::to_string);

        for backend in &mut self.backends {
            backend.ps_map.clear();
            backend.prepare_ids.clear();
            let Some(conn) = backend.conn.as_mut() else {
                continue;
            };

            let reset_ok = conn
                .send_command(Command::ResetConnection, Bytes::from_static(&[0x1F]))
                .await
                .is_ok()
                && conn.read_reply().await.is_ok();
            if !reset_ok {
                backend.close();
                continue;
            }

            if let Some(db) = database {
                let mut payload = BytesMut::with_capacity(1 + db.len());
                payload.extend_from_slice(&[0x02]);
                payload.extend_from_slice(db.as_bytes());
                let init_ok = conn
                    .send_command(Command::InitDb, payload.freeze())
                    .await
                    .is_ok()
                    && conn.read_reply().await.is_ok();
                if !init_ok {
                    backend.close();
                }
            }
        }
        Ok(())
    }

    /// Close backend connections idle past the configured grace
    pub fn close_idle_backends(&mut self) {
        if self.config.idle_timeout_secs == 0 {
            return;
        }
        let grace = Duration::from_secs(self.config.idle_timeout_secs);
        for (idx, backend) in self.backends.iter_mut().enumerate() {
            if Some(idx) == self.current_master
                || Some(idx) == self.trx_target
                || backend.in_exchange()
            {
                continue;
            }
            let idle = backend
                .conn
                .as_ref()
                .map(|c| c.idle_for() > grace)
                .unwrap_or(false);
            if idle {
                debug!(
                    server = %backend.server.name,
                    "Closing idle backend connection"
                );
                backend.close();
            }
        }
    }

    /// KILL QUERY: drop every backend connection with a reply outstanding
    pub fn kill_current_query(&mut self) {
        for backend in &mut self.backends {
            if backend.in_exchange() {
                backend.close();
            }
        }
        self.expected_responses = 0;
        self.current_query = None;
    }
}

enum ReplayVerdict {
    Match { target: usize },
    ChecksumMismatch,
}

/// Re-execute recorded statements back to back on one connection, folding
/// the server's reply bytes into `record`
async fn replay_statements(
    conn: &mut BackendConnection,
    statements: &[Bytes],
    record: &mut Transaction,
) -> Result<(), RouterError> {
    for payload in statements {
        let command = Command::from(payload.first().copied().unwrap_or(0xFF));
        conn.send_command(command, payload.clone()).await?;
        if command.expects_response() {
            let (packets, summary) = conn.read_reply().await?;
            if let Some(err) = summary.error {
                return Err(RouterError::Backend(BackendError::Query(format!(
                    "replayed statement failed: {}",
                    err.error_message
                ))));
            }
            for packet in &packets {
                record.add_reply_bytes(&encode_frame(packet));
            }
        }
        record.add_statement(payload.clone());
    }
    Ok(())
}

/// Whether a command/classification pair must replicate to every backend
fn is_session_command(command: Command, mask: StatementMask) -> bool {
    match command {
        Command::InitDb
        | Command::SetOption
        | Command::StmtPrepare
        | Command::StmtClose
        | Command::ResetConnection => true,
        Command::Query => mask.is_session_command(),
        _ => false,
    }
}

/// External statement id carried by binary-protocol statement commands
fn stmt_command_id(command: Command, payload: &Bytes) -> Option<u32> {
    match command {
        Command::StmtExecute
        | Command::StmtReset
        | Command::StmtFetch
        | Command::StmtSendLongData => payload
            .get(1..5)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        _ => None,
    }
}

/// Build the combined statement for a causal read: a GTID wait whose reply
/// collapses to a single OK or ERR packet, followed by the original query
fn prefix_wait_gtid(gtid: &str, timeout_secs: u64, original: &Bytes) -> Bytes {
    let prefix = format!(
        "SET @hermes_gtid_sync=(SELECT CASE WHEN MASTER_GTID_WAIT('{}', {}) = 0 THEN 1 \
         ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END); ",
        gtid, timeout_secs
    );
    let mut out = BytesMut::with_capacity(1 + prefix.len() + original.len());
    out.extend_from_slice(&[0x03]);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&original[1..]);
    out.freeze()
}

/// Re-encode one packet to its wire frame for checksumming
fn encode_frame(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(packet.payload.len() + 4);
    packet.encode(&mut buf);
    buf.to_vec()
}


/// Deadlock rollbacks and wsrep-not-ready are transient: the transaction is
/// replayed instead of surfacing the error
fn is_replayable_error(code: u16) -> bool {
    code == ER_LOCK_DEADLOCK || code == ER_UNKNOWN_COM_ERROR
}
