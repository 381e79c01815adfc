//! Backend-side protocol session
//!
//! The login half mirrors the client side: read the backend's handshake,
//! answer the scramble, absorb an optional auth switch. The data half runs
//! the reply state machine: every received frame advances the tracker, and a
//! complete reply is consumed exactly once per command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::protocol::{
    capabilities, compute_auth_response, get_lenenc_str, AuthSwitchRequest, Command, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec, ReplyEvent, ReplySummary,
    ReplyTracker, NATIVE_PASSWORD_PLUGIN,
};

use super::ServerDescriptor;

/// Credentials the proxy uses toward backends
#[derive(Debug, Clone)]
pub struct BackendAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("reply error: {0}")]
    Reply(#[from] crate::protocol::ReplyError),

    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// One authenticated connection to a backend server
pub struct BackendConnection {
    framed: Framed<TcpStream, PacketCodec>,
    server: Arc<ServerDescriptor>,
    capability_flags: u32,
    tracker: ReplyTracker,
    created_at: Instant,
    last_used: Instant,
}

impl BackendConnection {
    /// Connect and log in
    ///
    /// `client_capabilities` is the mask the client chose on the proxy's
    /// front side; it is intersected with the proxy's own mask and the
    /// backend's advertised mask before forwarding, so nothing the proxy
    /// cannot handle is ever negotiated end to end.
    pub async fn connect(
        server: Arc<ServerDescriptor>,
        auth: &BackendAuth,
        database: Option<&str>,
        client_capabilities: Option<u32>,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let addr = server.addr();
        debug!(server = %server.name, addr = %addr, "Connecting to backend");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BackendError::Connect(addr.clone(), "connect timeout".into()))?
            .map_err(|e| BackendError::Connect(addr.clone(), e.to_string()))?;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)??;

        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| BackendError::Protocol("malformed backend handshake".into()))?;

        debug!(
            server = %server.name,
            version = %handshake.server_version,
            "Backend handshake received"
        );

        // Capabilities the proxy itself relies on mid-stream, kept even when
        // the client did not ask for them: session tracking feeds causal
        // reads, multi-statements carries the GTID wait prefix
        const PROXY_REQUIRED: u32 = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH
            | capabilities::CLIENT_TRANSACTIONS
            | capabilities::CLIENT_SESSION_TRACK
            | capabilities::CLIENT_MULTI_STATEMENTS
            | capabilities::CLIENT_MULTI_RESULTS;

        let mut caps = capabilities::PROXY_CAPABILITIES & handshake.capability_flags;
        if let Some(client_caps) = client_capabilities {
            caps &= client_caps | PROXY_REQUIRED;
        }
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB & handshake.capability_flags;
        }

        let auth_response = compute_auth_response(&auth.password, &handshake.scramble);

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: auth.user.clone(),
            auth_response,
            database: database.map(str::to_string),
            auth_plugin_name: handshake.auth_plugin_name.clone(),
            wants_ssl: false,
        };

        framed
            .send(response.encode(handshake_packet.sequence_id.wrapping_add(1)))
            .await?;

        // OK, ERR, or an auth switch the proxy answers with a fresh token
        let mut reply = framed.next().await.ok_or(BackendError::Disconnected)??;

        if reply.first_byte() == Some(0xFE) {
            let switch = AuthSwitchRequest::parse(&reply.payload)
                .ok_or_else(|| BackendError::Protocol("malformed auth switch".into()))?;
            if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                return Err(BackendError::Auth(format!(
                    "unsupported auth plugin {}",
                    switch.plugin_name
                )));
            }
            let token = compute_auth_response(&auth.password, &switch.scramble);
            framed
                .send(Packet::new(reply.sequence_id.wrapping_add(1), token))
                .await?;
            reply = framed.next().await.ok_or(BackendError::Disconnected)??;
        }

        match reply.first_byte() {
            Some(0x00) => {}
            Some(0xFF) => {
                let err = ErrPacket::parse(&reply.payload)
                    .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
                error!(
                    server = %server.name,
                    code = err.error_code,
                    message = %err.error_message,
                    "Backend authentication failed"
                );
                return Err(BackendError::Auth(err.error_message));
            }
            _ => {
                return Err(BackendError::Protocol(
                    "expected OK after login".into(),
                ))
            }
        }

        debug!(server = %server.name, "Backend login complete");
        server.add_connection();

        let now = Instant::now();
        Ok(Self {
            framed,
            server,
            capability_flags: caps,
            tracker: ReplyTracker::new(caps),
            created_at: now,
            last_used: now,
        })
    }

    pub fn server(&self) -> &Arc<ServerDescriptor> {
        &self.server
    }

    pub fn capability_flags(&self) -> u32 {
        self.capability_flags
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether a reply is still outstanding for the current command
    pub fn reply_pending(&self) -> bool {
        !self.tracker.is_complete()
    }

    /// Send one command packet (sequence restarts at 0) and arm the reply
    /// tracker
    pub async fn send_command(
        &mut self,
        command: Command,
        payload: Bytes,
    ) -> Result<(), BackendError> {
        self.last_used = Instant::now();
        self.tracker.start_command(command);
        if command.expects_response() {
            self.server.op_started();
        }
        self.framed.send(Packet::new(0, payload)).await?;
        Ok(())
    }

    /// Send a continuation fragment of a large command without re-arming the
    /// tracker
    pub async fn send_continuation(&mut self, packet: Packet) -> Result<(), BackendError> {
        self.last_used = Instant::now();
        self.framed.send(packet).await?;
        Ok(())
    }

    /// Send raw pre-framed bytes (used when piping a client's local-infile
    /// upload through unchanged)
    pub async fn send_raw(&mut self, bytes: Bytes) -> Result<(), BackendError> {
        self.framed.send(bytes).await?;
        Ok(())
    }

    /// Receive the next server frame and advance the reply state machine
    ///
    /// Cancel-safe: dropping the future mid-read leaves the frame buffered.
    pub async fn recv_packet(&mut self) -> Result<(Packet, ReplyEvent), BackendError> {
        let packet = self
            .framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)??;

        let event = self.tracker.process(&packet)?;
        if matches!(event, ReplyEvent::Complete(_)) {
            self.server.op_finished();
        }
        Ok((packet, event))
    }

    /// Collect every packet of the current reply
    pub async fn read_reply(&mut self) -> Result<(Vec<Packet>, ReplySummary), BackendError> {
        let mut packets = Vec::new();
        loop {
            let (packet, event) = self.recv_packet().await?;
            packets.push(packet);
            match event {
                ReplyEvent::Complete(summary) => return Ok((packets, summary)),
                ReplyEvent::LocalInfileRequested => {
                    return Err(BackendError::Protocol(
                        "unexpected local-infile request".into(),
                    ))
                }
                ReplyEvent::Continue => {}
            }
        }
    }

    /// Run a text-protocol query and collect the result
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, BackendError> {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.extend_from_slice(&[0x03]);
        payload.extend_from_slice(sql.as_bytes());
        self.send_command(Command::Query, payload.freeze()).await?;

        let started = Instant::now();
        let (packets, summary) = self.read_reply().await?;
        self.server.update_response_time(started.elapsed());

        if let Some(err) = summary.error {
            return Err(BackendError::Query(format!(
                "{} ({})",
                err.error_message, err.error_code
            )));
        }

        Ok(ResultSet::from_packets(&packets, &summary))
    }

    /// Run a statement where only success matters
    pub async fn execute(&mut self, sql: &str) -> Result<(), BackendError> {
        self.query(sql).await.map(|_| ())
    }

    pub async fn ping(&mut self) -> Result<(), BackendError> {
        self.send_command(Command::Ping, Bytes::from_static(&[0x0e]))
            .await?;
        let started = Instant::now();
        let (_, summary) = self.read_reply().await?;
        self.server.update_response_time(started.elapsed());
        if summary.is_error() {
            return Err(BackendError::Query("ping failed".into()));
        }
        Ok(())
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        self.server.remove_connection();
        if self.reply_pending() {
            self.server.op_finished();
        }
    }
}

/// Text-protocol result rows, decoded to strings
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Decode columns and rows from the packets of a completed reply
    ///
    /// Walks the same boundaries the tracker saw: packet 0 is the column
    /// count, then one definition per column, an optional EOF, then rows
    /// until the terminator.
    fn from_packets(packets: &[Packet], summary: &ReplySummary) -> Self {
        if summary.ok.is_some() && summary.result_sets == 0 {
            return ResultSet::default();
        }
        let Some(first) = packets.first() else {
            return ResultSet::default();
        };
        let Some((column_count, _)) = crate::protocol::get_lenenc_int(&first.payload) else {
            return ResultSet::default();
        };
        let column_count = column_count as usize;

        let columns = packets
            .iter()
            .skip(1)
            .take(column_count)
            .map(|p| parse_column_name(&p.payload).unwrap_or_default())
            .collect();

        let mut rows = Vec::new();
        for packet in packets.iter().skip(1 + column_count) {
            let payload = &packet.payload;
            // Skip the EOF delimiter and the result terminator
            if payload.first() == Some(&0xFE) && payload.len() < 9 {
                continue;
            }
            if let Some(row) = decode_text_row(payload, column_count) {
                rows.push(row);
            }
        }

        ResultSet { columns, rows }
    }

    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Value in `row` under the named column, case-insensitively
    pub fn value_by_name(&self, row: usize, name: &str) -> Option<&str> {
        let col = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))?;
        self.value(row, col)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Column name from a column-definition packet: the fifth length-encoded
/// string (catalog, schema, table, org_table, name)
fn parse_column_name(payload: &[u8]) -> Option<String> {
    let mut rest = payload;
    for _ in 0..4 {
        let (_, used) = get_lenenc_str(rest)?;
        rest = &rest[used..];
    }
    let (name, _) = get_lenenc_str(rest)?;
    Some(String::from_utf8_lossy(name).to_string())
}

/// Decode one text-protocol row of lenenc values (0xFB is NULL)
fn decode_text_row(payload: &[u8], columns: usize) -> Option<Vec<Option<String>>> {
    let mut row = Vec::with_capacity(columns);
    let mut rest = payload;
    for _ in 0..columns {
        if rest.first() == Some(&0xFB) {
            row.push(None);
            rest = &rest[1..];
        } else {
            let (value, used) = get_lenenc_str(rest)?;
            row.push(Some(String::from_utf8_lossy(value).to_string()));
            rest = &rest[used..];
        }
    }
    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_decode_text_row() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.extend_from_slice(b"1");
        buf.put_u8(0xFB); // NULL
        buf.put_u8(3);
        buf.extend_from_slice(b"abc");

        let row = decode_text_row(&buf, 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("1"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("abc"));
    }

    #[test]
    fn test_decode_text_row_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.extend_from_slice(b"ab");
        assert!(decode_text_row(&buf, 1).is_none());
    }

    #[test]
    fn test_parse_column_name() {
        let mut buf = BytesMut::new();
        for field in [&b"def"[..], b"", b"t", b"t"] {
            buf.put_u8(field.len() as u8);
            buf.extend_from_slice(field);
        }
        buf.put_u8(9);
        buf.extend_from_slice(b"Read_Only");
        buf.put_u8(9);
        buf.extend_from_slice(b"read_only");

        assert_eq!(parse_column_name(&buf).as_deref(), Some("Read_Only"));
    }
}
