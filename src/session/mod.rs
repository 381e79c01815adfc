//! Client session lifecycle
//!
//! One session per client connection: drives the login exchange against the
//! user cache, then pumps the command loop, handing statements to the
//! router and router/backend events back to the client. A session lives on
//! one worker for its whole life; everything here runs on that worker's
//! loop.

#[cfg(test)]
mod scenarios;
mod state;

pub use state::{SessionPhase, SessionState};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::backend::{BackendAuth, BackendError};
use crate::classifier::{classify, parse_hint, Classification, KillKind, TargetHint};
use crate::cluster::Cluster;
use crate::metrics::metrics;
use crate::protocol::{
    AuthSwitchRequest, ChangeUser, ClientCommand, ErrPacket, InitialHandshake, LargeQueryTracker,
    OkPacket, Packet, PacketCodec, ReplyEvent, HandshakeResponse, NATIVE_PASSWORD_PLUGIN,
};
use crate::router::{
    HintRouterConfig, HintRouterSession, PendingQuery, RouterAction, RouterError, RouterSession,
    RwSplitConfig, RwSplitSession, SchemaRouterConfig, SchemaRouterSession,
};
use crate::worker::{KillDispatcher, KillRequest, KillSignal};

const ER_QUERY_INTERRUPTED: u16 = 1317;
const ER_HANDSHAKE_ERROR: u16 = 1043;
const ER_CON_COUNT_ERROR: u16 = 1040;

/// Which router implementation a service uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    #[default]
    ReadWriteSplit,
    Schema,
    Hint,
}

/// Shared service context handed to every session
pub struct ServiceContext {
    pub cluster: Arc<Cluster>,
    pub router_kind: RouterKind,
    pub rw_config: RwSplitConfig,
    pub schema_config: SchemaRouterConfig,
    pub hint_config: HintRouterConfig,
    pub authenticator: Arc<Authenticator>,
    pub backend_auth: BackendAuth,
    pub server_version: String,
    pub kill_dispatcher: Arc<KillDispatcher>,
    pub max_connections: u32,
    pub active_connections: AtomicU32,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// What the command loop decided to do with one event
enum LoopStep {
    Continue,
    Close,
}

/// One client session
pub struct Session {
    pub id: u64,
    state: SessionState,
    ctx: Arc<ServiceContext>,
    kill_rx: mpsc::UnboundedReceiver<KillSignal>,
    large_query: LargeQueryTracker,
    /// Publishes the authenticated username into the worker's session table
    /// for KILL USER matching
    username_cell: Option<std::rc::Rc<std::cell::RefCell<String>>>,
}

impl Session {
    pub fn new(
        id: u64,
        ctx: Arc<ServiceContext>,
        kill_rx: mpsc::UnboundedReceiver<KillSignal>,
        client_host: String,
    ) -> Self {
        Self {
            id,
            state: SessionState::new(client_host),
            ctx,
            kill_rx,
            large_query: LargeQueryTracker::default(),
            username_cell: None,
        }
    }

    /// Run with a shared cell the worker table reads usernames from
    pub async fn run_with_username_cell<S>(
        mut self,
        stream: S,
        cell: std::rc::Rc<std::cell::RefCell<String>>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.username_cell = Some(cell);
        self.run(stream).await
    }

    /// Run the session to completion
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(stream, PacketCodec);

        let active = self.ctx.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        let result = self.run_inner(&mut client, active).await;
        self.ctx.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.state.phase = SessionPhase::Stopped;
        result
    }

    async fn run_inner<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        active: u32,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Login exchange
        let handshake = InitialHandshake::new(self.id as u32, &self.ctx.server_version);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;
        let mut last_seq = response_packet.sequence_id;

        let Some(response) = HandshakeResponse::parse(&response_packet.payload) else {
            let err = ErrPacket::new(ER_HANDSHAKE_ERROR, "08S01", "Bad handshake");
            client.send(err.encode(last_seq.wrapping_add(1), 0)).await?;
            return Err(SessionError::Protocol("malformed handshake response".into()));
        };

        // TLS is not terminated here; a client insisting on it cannot
        // proceed
        if response.wants_ssl {
            let err = ErrPacket::new(ER_HANDSHAKE_ERROR, "08S01", "Bad handshake");
            client.send(err.encode(last_seq.wrapping_add(1), 0)).await?;
            return Err(SessionError::Protocol("unsupported SSL request".into()));
        }

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        if active > self.ctx.max_connections && self.ctx.max_connections > 0 {
            let err = ErrPacket::new(ER_CON_COUNT_ERROR, "08004", "Too many connections");
            client
                .send(err.encode(last_seq.wrapping_add(1), response.capability_flags))
                .await?;
            return Ok(());
        }

        // Auth-switch when the client answered with a different plugin
        let mut token = response.auth_response.clone();
        if response.auth_plugin_name != NATIVE_PASSWORD_PLUGIN {
            let switch = AuthSwitchRequest {
                plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
                scramble: handshake.scramble.to_vec(),
            };
            client.send(switch.encode(last_seq.wrapping_add(1))).await?;
            let reply = client
                .next()
                .await
                .ok_or(SessionError::ClientDisconnected)??;
            last_seq = reply.sequence_id;
            token = reply.payload.to_vec();
        }

        let auth_result = self
            .ctx
            .authenticator
            .authenticate(
                &response.username,
                &self.state.client_host,
                response.database.as_deref(),
                &handshake.scramble,
                &token,
            )
            .await;

        if let Err(failure) = auth_result {
            info!(
                session_id = self.id,
                user = %response.username,
                host = %self.state.client_host,
                error = %failure,
                "Authentication failed"
            );
            metrics().record_auth_failure();
            let err = ErrPacket::new(failure.error_code(), failure.sql_state(), &failure.to_string());
            client
                .send(err.encode(last_seq.wrapping_add(1), response.capability_flags))
                .await?;
            return Ok(());
        }

        let ok = OkPacket::new();
        client
            .send(ok.encode(last_seq.wrapping_add(1), response.capability_flags))
            .await?;

        info!(
            session_id = self.id,
            user = %self.state.username,
            db = ?self.state.database,
            "Client authenticated"
        );
        if let Some(cell) = &self.username_cell {
            *cell.borrow_mut() = self.state.username.clone();
        }

        // Router construction opens the initial backend set
        let mut router = match self.build_router().await {
            Ok(router) => router,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "No backends available");
                let err = ErrPacket::new(
                    1045,
                    "08004",
                    "Could not connect to any backend server",
                );
                client.send(err.encode(0, self.state.capability_flags)).await?;
                return Ok(());
            }
        };

        self.state.phase = SessionPhase::Started;
        let result = self.command_loop(client, &mut router).await;
        self.state.phase = SessionPhase::Stopping;
        result
    }

    async fn build_router(&self) -> Result<RouterSession, RouterError> {
        let router = match self.ctx.router_kind {
            RouterKind::ReadWriteSplit => RouterSession::ReadWriteSplit(Box::new(
                RwSplitSession::connect(
                    self.id,
                    self.ctx.cluster.clone(),
                    self.ctx.rw_config.clone(),
                    self.ctx.backend_auth.clone(),
                    self.state.capability_flags,
                    self.state.database.clone(),
                )
                .await?,
            )),
            RouterKind::Schema => RouterSession::Schema(Box::new(SchemaRouterSession::new(
                self.id,
                self.ctx.cluster.clone(),
                self.ctx.schema_config.clone(),
                self.ctx.backend_auth.clone(),
                self.state.capability_flags,
                self.state.database.clone(),
            ))),
            RouterKind::Hint => RouterSession::Hint(Box::new(HintRouterSession::new(
                self.id,
                self.ctx.cluster.clone(),
                self.ctx.hint_config.clone(),
                self.ctx.backend_auth.clone(),
                self.state.capability_flags,
                self.state.database.clone(),
            ))),
        };
        Ok(router)
    }

    async fn command_loop<S>(
        &mut self,
        client: &mut Framed<S, PacketCodec>,
        router: &mut RouterSession,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        enum Event {
            Client(Option<Result<Packet, std::io::Error>>),
            Backend(usize, Result<(Packet, ReplyEvent), BackendError>),
            Kill(KillSignal),
            Tick,
        }

        let mut idle_ticker = tokio::time::interval(Duration::from_secs(5));
        idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stopping = false;

        loop {
            // Messages take effect on the next loop turn; backend replies
            // beat fresh client statements so ordering holds
            let event = tokio::select! {
                biased;
                Some(signal) = self.kill_rx.recv() => Event::Kill(signal),
                Some((idx, result)) = router.next_backend_event() => Event::Backend(idx, result),
                packet = client.next() => Event::Client(packet),
                _ = idle_ticker.tick() => Event::Tick,
            };

            let step = match event {
                Event::Kill(signal) => self.on_kill(signal, client, router, &mut stopping).await?,
                Event::Backend(idx, result) => {
                    match router.on_backend_event(idx, result, client).await? {
                        RouterAction::Continue => LoopStep::Continue,
                        RouterAction::CloseSession => LoopStep::Close,
                    }
                }
                Event::Client(None) => {
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
                Event::Client(Some(Err(e))) => {
                    return Err(e.into());
                }
                Event::Client(Some(Ok(packet))) => {
                    self.on_client_packet(packet, client, router, &mut stopping)
                        .await?
                }
                Event::Tick => {
                    router.close_idle_backends();
                    LoopStep::Continue
                }
            };

            if matches!(step, LoopStep::Close) {
                return Ok(());
            }
            if stopping && router.can_route_queries() {
                debug!(session_id = self.id, "In-flight replies drained, closing");
                return Ok(());
            }
        }
    }

    async fn on_client_packet<S>(
        &mut self,
        packet: Packet,
        client: &mut Framed<S, PacketCodec>,
        router: &mut RouterSession,
        stopping: &mut bool,
    ) -> Result<LoopStep, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Continuations of a large command and local-infile uploads bypass
        // classification and queueing entirely
        if self.large_query.observe(&packet) || router.local_infile_active() {
            router.route_continuation(packet).await?;
            return Ok(LoopStep::Continue);
        }

        let command = ClientCommand::parse(&packet.payload);

        match &command {
            ClientCommand::Quit => {
                // Never forwarded; close cleanly once in-flight replies have
                // drained
                debug!(session_id = self.id, "Client sent QUIT");
                if router.can_route_queries() {
                    return Ok(LoopStep::Close);
                }
                *stopping = true;
                return Ok(LoopStep::Continue);
            }

            ClientCommand::Ping => {
                let ok = OkPacket::new();
                client.send(ok.encode(1, self.state.capability_flags)).await?;
                return Ok(LoopStep::Continue);
            }

            ClientCommand::ChangeUser(data) => {
                return self.on_change_user(data.clone(), client, router).await;
            }

            _ => {}
        }

        // Classify queries; other commands carry an empty classification
        let classification = match command.query_text() {
            Some(sql) => {
                let c = classify(&sql, self.state.sql_mode);

                // KILL never reaches a backend: it is dispatched to the
                // worker owning the target session
                if let Some(kill) = &c.kill {
                    self.ctx.kill_dispatcher.broadcast(KillRequest {
                        command: kill.clone(),
                        issuer: self.id,
                    });
                    metrics().record_kill_dispatched();
                    let ok = OkPacket::new();
                    client.send(ok.encode(1, self.state.capability_flags)).await?;
                    return Ok(LoopStep::Continue);
                }

                self.state.track_statement(&c);
                c
            }
            None => Classification::default(),
        };

        if let ClientCommand::InitDb(db) = &command {
            self.state.change_database(db.clone());
        }

        let hint = match command.query_text() {
            Some(sql) => parse_hint(&sql),
            None => TargetHint::Undefined,
        };

        metrics().record_query(&classification);

        let query = PendingQuery {
            payload: packet.payload,
            classification,
            hint,
        };

        match router.route_query(query, client).await {
            Ok(RouterAction::Continue) => Ok(LoopStep::Continue),
            Ok(RouterAction::CloseSession) => Ok(LoopStep::Close),
            Err(e) => {
                warn!(session_id = self.id, error = %e, "Routing failed");
                Err(e.into())
            }
        }
    }

    /// COM_CHANGE_USER: an auth-switch-equivalent exchange inside the
    /// established session. Credentials swap only after the new token
    /// validates; failure closes the session.
    async fn on_change_user<S>(
        &mut self,
        data: Bytes,
        client: &mut Framed<S, PacketCodec>,
        router: &mut RouterSession,
    ) -> Result<LoopStep, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(change) = ChangeUser::parse(&data, self.state.capability_flags) else {
            return Err(SessionError::Protocol("malformed COM_CHANGE_USER".into()));
        };

        // Fresh challenge; the client re-answers with the new credentials
        let switch_scramble: Vec<u8> = {
            let hs = InitialHandshake::new(self.id as u32, &self.ctx.server_version);
            hs.scramble.to_vec()
        };
        let switch = AuthSwitchRequest {
            plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
            scramble: switch_scramble.clone(),
        };
        client.send(switch.encode(1)).await?;

        let reply = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;
        let token = reply.payload.to_vec();

        let auth_result = self
            .ctx
            .authenticator
            .authenticate(
                &change.username,
                &self.state.client_host,
                change.database.as_deref(),
                &switch_scramble,
                &token,
            )
            .await;

        match auth_result {
            Ok(_) => {
                self.state
                    .change_user(change.username.clone(), change.database.clone());
                if let Some(cell) = &self.username_cell {
                    *cell.borrow_mut() = self.state.username.clone();
                }
                let ok = OkPacket::new();
                client
                    .send(ok.encode(reply.sequence_id.wrapping_add(1), self.state.capability_flags))
                    .await?;
                info!(
                    session_id = self.id,
                    user = %change.username,
                    "Session user changed"
                );

                // Backend session state resets so stale user variables and
                // prepared statements cannot leak across users
                if let RouterSession::ReadWriteSplit(rw) = router {
                    rw.reset_backends_after_change_user(change.database.as_deref())
                        .await?;
                }
                Ok(LoopStep::Continue)
            }
            Err(failure) => {
                info!(
                    session_id = self.id,
                    user = %change.username,
                    error = %failure,
                    "COM_CHANGE_USER authentication failed, closing session"
                );
                let err = ErrPacket::new(
                    failure.error_code(),
                    failure.sql_state(),
                    &failure.to_string(),
                );
                client
                    .send(err.encode(reply.sequence_id.wrapping_add(1), self.state.capability_flags))
                    .await?;
                Ok(LoopStep::Close)
            }
        }
    }

    async fn on_kill<S>(
        &mut self,
        signal: KillSignal,
        client: &mut Framed<S, PacketCodec>,
        router: &mut RouterSession,
        stopping: &mut bool,
    ) -> Result<LoopStep, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(session_id = self.id, signal = ?signal, "Kill signal received");
        metrics().record_session_killed();

        match signal.kind {
            KillKind::Connection => {
                if signal.hard || router.can_route_queries() {
                    Ok(LoopStep::Close)
                } else {
                    // SOFT: await the in-flight reply, then close
                    *stopping = true;
                    Ok(LoopStep::Continue)
                }
            }
            KillKind::Query => {
                if !router.can_route_queries() {
                    router.kill_current_query();
                    let err = ErrPacket::new(
                        ER_QUERY_INTERRUPTED,
                        "70100",
                        "Query execution was interrupted",
                    );
                    client.send(err.encode(1, self.state.capability_flags)).await?;
                }
                Ok(LoopStep::Continue)
            }
        }
    }
}
