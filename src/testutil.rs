//! In-process mock backend for protocol and routing tests
//!
//! Speaks just enough of the server side of the wire protocol to let a full
//! session run against it: handshake, login, text queries with canned
//! replies, prepared statements, and scripted connection death.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::protocol::{
    capabilities, put_lenenc_int, put_lenenc_str, status, Command, EofPacket, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec,
};

/// Scripted reply to one statement
#[derive(Debug, Clone)]
pub enum MockReply {
    Ok {
        affected_rows: u64,
        gtid: Option<String>,
    },
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Error {
        code: u16,
        message: String,
    },
    /// Close the connection without replying
    Die,
    /// Multiple results in one reply (multi-statement)
    Multi(Vec<MockReply>),
}

impl MockReply {
    pub fn ok() -> Self {
        MockReply::Ok {
            affected_rows: 0,
            gtid: None,
        }
    }

    pub fn ok_with_gtid(gtid: &str) -> Self {
        MockReply::Ok {
            affected_rows: 1,
            gtid: Some(gtid.to_string()),
        }
    }

    pub fn single_row(column: &str, value: &str) -> Self {
        MockReply::Rows {
            columns: vec![column.to_string()],
            rows: vec![vec![value.to_string()]],
        }
    }

    pub fn empty_result(columns: &[&str]) -> Self {
        MockReply::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }
}

type Responder = Arc<dyn Fn(&str) -> MockReply + Send + Sync>;

/// One mock backend server
pub struct MockBackend {
    pub addr: SocketAddr,
    /// Every COM_QUERY text received, in order, across connections
    queries: Arc<Mutex<Vec<String>>>,
    responder: Arc<Mutex<Responder>>,
    handle: tokio::task::JoinHandle<()>,
    connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl MockBackend {
    /// Start a mock that answers everything with OK
    pub async fn start() -> Self {
        Self::with_responder(|_| MockReply::ok()).await
    }

    /// Start a mock with a custom statement responder
    pub async fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries: Arc<Mutex<Vec<String>>> = Arc::default();
        let responder: Arc<Mutex<Responder>> = Arc::new(Mutex::new(Arc::new(responder)));

        let connections: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::default();
        let task_queries = queries.clone();
        let task_responder = responder.clone();
        let task_connections = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let queries = task_queries.clone();
                let responder = task_responder.clone();
                let conn = tokio::spawn(async move {
                    let _ = serve_connection(stream, queries, responder).await;
                });
                task_connections.lock().unwrap().push(conn);
            }
        });

        Self {
            addr,
            queries,
            responder,
            handle,
            connections,
        }
    }

    /// Statements this backend has received
    pub fn received(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Swap the responder mid-test
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Arc::new(responder);
    }

    /// Stop accepting and drop every open connection
    pub fn kill(&self) {
        self.handle.abort();
        for conn in self.connections.lock().unwrap().drain(..) {
            conn.abort();
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

const MOCK_CAPABILITIES: u32 = capabilities::CLIENT_PROTOCOL_41
    | capabilities::CLIENT_SECURE_CONNECTION
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_MULTI_RESULTS
    | capabilities::CLIENT_SESSION_TRACK
    | capabilities::CLIENT_TRANSACTIONS;

async fn serve_connection(
    stream: TcpStream,
    queries: Arc<Mutex<Vec<String>>>,
    responder: Arc<Mutex<Responder>>,
) -> Option<()> {
    let mut framed = Framed::new(stream, PacketCodec);

    let mut handshake = InitialHandshake::new(1, "10.4.15-mock");
    handshake.capability_flags = MOCK_CAPABILITIES;
    framed.send(handshake.encode()).await.ok()?;

    let response = framed.next().await?.ok()?;
    HandshakeResponse::parse(&response.payload)?;
    framed
        .send(OkPacket::new().encode(response.sequence_id.wrapping_add(1), MOCK_CAPABILITIES))
        .await
        .ok()?;

    let next_stmt_id = AtomicU32::new(1);

    loop {
        let packet = framed.next().await?.ok()?;
        let command = Command::from(packet.first_byte().unwrap_or(0xFF));

        match command {
            Command::Quit => return Some(()),
            Command::Ping | Command::ResetConnection | Command::InitDb => {
                framed
                    .send(OkPacket::new().encode(1, MOCK_CAPABILITIES))
                    .await
                    .ok()?;
            }
            Command::StmtPrepare => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                queries.lock().unwrap().push(format!("PREPARE:{sql}"));
                let stmt_id = next_stmt_id.fetch_add(1, Ordering::Relaxed);
                send_prepare_ok(&mut framed, stmt_id).await?;
            }
            Command::StmtClose => {}
            Command::StmtExecute => {
                let stmt_id = u32::from_le_bytes([
                    packet.payload[1],
                    packet.payload[2],
                    packet.payload[3],
                    packet.payload[4],
                ]);
                queries.lock().unwrap().push(format!("EXECUTE:{stmt_id}"));
                framed
                    .send(OkPacket::new().encode(1, MOCK_CAPABILITIES))
                    .await
                    .ok()?;
            }
            Command::Query => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                let reply = {
                    let responder = responder.lock().unwrap().clone();
                    responder(&sql)
                };
                queries.lock().unwrap().push(sql);
                if !send_reply(&mut framed, reply).await? {
                    return Some(());
                }
            }
            _ => {
                framed
                    .send(OkPacket::new().encode(1, MOCK_CAPABILITIES))
                    .await
                    .ok()?;
            }
        }
    }
}

/// Send one reply; false means the connection was scripted to die
async fn send_reply(
    framed: &mut Framed<TcpStream, PacketCodec>,
    reply: MockReply,
) -> Option<bool> {
    let mut seq = 1u8;
    match reply {
        MockReply::Multi(parts) => {
            let count = parts.len();
            for (i, part) in parts.into_iter().enumerate() {
                let more = i + 1 < count;
                if !send_one_result(framed, part, &mut seq, more).await? {
                    return Some(false);
                }
            }
            Some(true)
        }
        other => send_one_result(framed, other, &mut seq, false).await,
    }
}

async fn send_one_result(
    framed: &mut Framed<TcpStream, PacketCodec>,
    reply: MockReply,
    seq: &mut u8,
    more_results: bool,
) -> Option<bool> {
    match reply {
        MockReply::Die => Some(false),
        MockReply::Multi(_) => Some(false),
        MockReply::Ok {
            affected_rows,
            gtid,
        } => {
            let mut ok = OkPacket::new();
            ok.affected_rows = affected_rows;
            if more_results {
                ok.status_flags |= status::SERVER_MORE_RESULTS_EXIST;
            }
            if gtid.is_some() {
                ok.status_flags |= status::SERVER_SESSION_STATE_CHANGED;
                ok.gtid = gtid;
            }
            framed.send(ok.encode(*seq, MOCK_CAPABILITIES)).await.ok()?;
            *seq = seq.wrapping_add(1);
            Some(true)
        }
        MockReply::Error { code, message } => {
            let err = ErrPacket::new(code, "HY000", &message);
            framed.send(err.encode(*seq, MOCK_CAPABILITIES)).await.ok()?;
            *seq = seq.wrapping_add(1);
            Some(true)
        }
        MockReply::Rows { columns, rows } => {
            let mut count = BytesMut::new();
            put_lenenc_int(&mut count, columns.len() as u64);
            framed
                .send(Packet::new(*seq, count.freeze()))
                .await
                .ok()?;
            *seq = seq.wrapping_add(1);

            for name in &columns {
                framed
                    .send(Packet::new(*seq, column_definition(name)))
                    .await
                    .ok()?;
                *seq = seq.wrapping_add(1);
            }

            framed
                .send(EofPacket::default().encode(*seq))
                .await
                .ok()?;
            *seq = seq.wrapping_add(1);

            for row in &rows {
                let mut buf = BytesMut::new();
                for value in row {
                    put_lenenc_str(&mut buf, value.as_bytes());
                }
                framed.send(Packet::new(*seq, buf.freeze())).await.ok()?;
                *seq = seq.wrapping_add(1);
            }

            let terminator = EofPacket {
                warnings: 0,
                status_flags: if more_results {
                    status::SERVER_MORE_RESULTS_EXIST
                } else {
                    0
                },
            };
            framed.send(terminator.encode(*seq)).await.ok()?;
            *seq = seq.wrapping_add(1);
            Some(true)
        }
    }
}

/// A minimal column definition: six length-encoded strings plus the fixed
/// tail fields
fn column_definition(name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_lenenc_str(&mut buf, b"def");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, b"");
    put_lenenc_str(&mut buf, name.as_bytes());
    put_lenenc_str(&mut buf, name.as_bytes());
    buf.put_u8(0x0c);
    buf.put_u16_le(0x21); // charset
    buf.put_u32_le(255); // column length
    buf.put_u8(0xFD); // VAR_STRING
    buf.put_u16_le(0); // flags
    buf.put_u8(0); // decimals
    buf.put_u16_le(0); // filler
    buf.freeze()
}

async fn send_prepare_ok(
    framed: &mut Framed<TcpStream, PacketCodec>,
    stmt_id: u32,
) -> Option<()> {
    let mut buf = BytesMut::new();
    buf.put_u8(0x00);
    buf.put_u32_le(stmt_id);
    buf.put_u16_le(0); // columns
    buf.put_u16_le(0); // params
    buf.put_u8(0);
    buf.put_u16_le(0); // warnings
    framed.send(Packet::new(1, buf.freeze())).await.ok()?;
    Some(())
}

/// Standard responder for a "master"-flavored mock: answers probe queries
/// like a writable master with the given server id
pub fn master_responder(server_id: u32) -> impl Fn(&str) -> MockReply + Send + Sync {
    move |sql| probe_responder(sql, server_id, false, None)
}

/// Standard responder for a "slave"-flavored mock replicating from
/// `master_addr`
pub fn slave_responder(
    server_id: u32,
    master_addr: SocketAddr,
) -> impl Fn(&str) -> MockReply + Send + Sync {
    move |sql| probe_responder(sql, server_id, true, Some(master_addr))
}

fn probe_responder(
    sql: &str,
    server_id: u32,
    read_only: bool,
    master: Option<SocketAddr>,
) -> MockReply {
    let upper = sql.trim().to_uppercase();
    if upper.starts_with("SELECT @@SERVER_ID") {
        return MockReply::Rows {
            columns: vec!["@@server_id".into(), "@@read_only".into()],
            rows: vec![vec![
                server_id.to_string(),
                if read_only { "1" } else { "0" }.to_string(),
            ]],
        };
    }
    if upper.starts_with("SHOW SLAVE STATUS") {
        let columns = vec![
            "Master_Host".to_string(),
            "Master_Port".to_string(),
            "Slave_IO_Running".to_string(),
            "Slave_SQL_Running".to_string(),
            "Seconds_Behind_Master".to_string(),
        ];
        return match master {
            Some(addr) => MockReply::Rows {
                columns,
                rows: vec![vec![
                    addr.ip().to_string(),
                    addr.port().to_string(),
                    "Yes".to_string(),
                    "Yes".to_string(),
                    "0".to_string(),
                ]],
            },
            None => MockReply::Rows {
                columns,
                rows: Vec::new(),
            },
        };
    }
    if upper.starts_with("SELECT @@GTID_CURRENT_POS") {
        return MockReply::single_row("@@gtid_current_pos", &format!("0-{server_id}-10"));
    }
    MockReply::ok()
}
