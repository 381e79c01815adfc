use bytes::{Buf, Bytes};

use super::packet::{Command, Packet};

/// Parsed view of one client command packet
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Query(Bytes),
    InitDb(String),
    Quit,
    Ping,
    FieldList { table: String },
    StmtPrepare(Bytes),
    /// Binary-protocol commands that reference a prepared statement by its
    /// external 4-byte id
    StmtExecute { stmt_id: u32 },
    StmtClose { stmt_id: u32 },
    StmtReset { stmt_id: u32 },
    StmtSendLongData { stmt_id: u32 },
    StmtFetch { stmt_id: u32 },
    ChangeUser(Bytes),
    SetOption(u16),
    ProcessKill(u32),
    ResetConnection,
    Other(Command, Bytes),
}

impl ClientCommand {
    /// Parse a command from packet payload
    ///
    /// Only the first fragment of a large (2^24-1 byte) command is parsed;
    /// continuation fragments must bypass this and stream to the current
    /// target.
    pub fn parse(payload: &Bytes) -> Self {
        let Some(&cmd_byte) = payload.first() else {
            return ClientCommand::Other(Command::Unknown, Bytes::new());
        };

        let cmd = Command::from(cmd_byte);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => ClientCommand::Query(data),
            Command::InitDb => {
                ClientCommand::InitDb(String::from_utf8_lossy(&data).to_string())
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::FieldList => {
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                ClientCommand::FieldList {
                    table: String::from_utf8_lossy(&data[..null_pos]).to_string(),
                }
            }
            Command::StmtPrepare => ClientCommand::StmtPrepare(data),
            Command::StmtExecute => match read_stmt_id(&data) {
                Some(stmt_id) => ClientCommand::StmtExecute { stmt_id },
                None => ClientCommand::Other(cmd, data),
            },
            Command::StmtClose => match read_stmt_id(&data) {
                Some(stmt_id) => ClientCommand::StmtClose { stmt_id },
                None => ClientCommand::Other(cmd, data),
            },
            Command::StmtReset => match read_stmt_id(&data) {
                Some(stmt_id) => ClientCommand::StmtReset { stmt_id },
                None => ClientCommand::Other(cmd, data),
            },
            Command::StmtSendLongData => match read_stmt_id(&data) {
                Some(stmt_id) => ClientCommand::StmtSendLongData { stmt_id },
                None => ClientCommand::Other(cmd, data),
            },
            Command::StmtFetch => match read_stmt_id(&data) {
                Some(stmt_id) => ClientCommand::StmtFetch { stmt_id },
                None => ClientCommand::Other(cmd, data),
            },
            Command::ChangeUser => ClientCommand::ChangeUser(data),
            Command::SetOption => {
                if data.len() >= 2 {
                    ClientCommand::SetOption(u16::from_le_bytes([data[0], data[1]]))
                } else {
                    ClientCommand::Other(cmd, data)
                }
            }
            Command::ProcessKill => {
                if data.len() >= 4 {
                    let mut buf = &data[..];
                    ClientCommand::ProcessKill(buf.get_u32_le())
                } else {
                    ClientCommand::Other(cmd, data)
                }
            }
            Command::ResetConnection => ClientCommand::ResetConnection,
            _ => ClientCommand::Other(cmd, data),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            ClientCommand::Query(_) => Command::Query,
            ClientCommand::InitDb(_) => Command::InitDb,
            ClientCommand::Quit => Command::Quit,
            ClientCommand::Ping => Command::Ping,
            ClientCommand::FieldList { .. } => Command::FieldList,
            ClientCommand::StmtPrepare(_) => Command::StmtPrepare,
            ClientCommand::StmtExecute { .. } => Command::StmtExecute,
            ClientCommand::StmtClose { .. } => Command::StmtClose,
            ClientCommand::StmtReset { .. } => Command::StmtReset,
            ClientCommand::StmtSendLongData { .. } => Command::StmtSendLongData,
            ClientCommand::StmtFetch { .. } => Command::StmtFetch,
            ClientCommand::ChangeUser(_) => Command::ChangeUser,
            ClientCommand::SetOption(_) => Command::SetOption,
            ClientCommand::ProcessKill(_) => Command::ProcessKill,
            ClientCommand::ResetConnection => Command::ResetConnection,
            ClientCommand::Other(cmd, _) => *cmd,
        }
    }

    /// SQL text of a COM_QUERY, lossily decoded
    pub fn query_text(&self) -> Option<String> {
        match self {
            ClientCommand::Query(data) => Some(String::from_utf8_lossy(data).to_string()),
            _ => None,
        }
    }

    /// External prepared-statement id referenced by this command, if any
    pub fn stmt_id(&self) -> Option<u32> {
        match self {
            ClientCommand::StmtExecute { stmt_id }
            | ClientCommand::StmtClose { stmt_id }
            | ClientCommand::StmtReset { stmt_id }
            | ClientCommand::StmtSendLongData { stmt_id }
            | ClientCommand::StmtFetch { stmt_id } => Some(*stmt_id),
            _ => None,
        }
    }
}

/// Read the 4-byte statement id at the head of a binary-protocol payload
fn read_stmt_id(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Rewrite the 4-byte statement id in place, returning a new payload
///
/// Used to remap the client-visible statement id to the per-backend internal
/// id before forwarding.
pub fn rewrite_stmt_id(payload: &Bytes, new_id: u32) -> Bytes {
    let mut out = payload.to_vec();
    if out.len() >= 5 {
        out[1..5].copy_from_slice(&new_id.to_le_bytes());
    }
    Bytes::from(out)
}

/// Tracks large-command continuation across packets
///
/// A payload of exactly 2^24-1 bytes means the next packet continues the same
/// command; only the first fragment is classified.
#[derive(Debug, Default)]
pub struct LargeQueryTracker {
    in_large_query: bool,
}

impl LargeQueryTracker {
    /// Returns true when `packet` is a continuation of a previous fragment
    /// (and must bypass classification and queueing)
    pub fn observe(&mut self, packet: &Packet) -> bool {
        let was_continuation = self.in_large_query;
        self.in_large_query = packet.is_large_fragment();
        was_continuation
    }

    pub fn active(&self) -> bool {
        self.in_large_query
    }
}
