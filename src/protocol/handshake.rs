use bytes::{Buf, BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::buffer::{get_lenenc_int, get_lenenc_str, put_lenenc_int, put_lenenc_str};
use super::packet::{capabilities::*, status, Packet};

/// Length of the full native-password scramble
pub const SCRAMBLE_LEN: usize = 20;

/// Default authentication plugin
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub scramble: [u8; SCRAMBLE_LEN],
    pub capability_flags: u32,
    /// MariaDB extended capabilities carried in the reserved filler bytes
    pub extended_capabilities: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a handshake the proxy sends to a connecting client
    ///
    /// A `10.x` version is prefixed with `5.5.5-` for client compatibility
    /// with MariaDB's replication-era version handshake.
    pub fn new(connection_id: u32, server_version: &str) -> Self {
        let mut scramble = [0u8; SCRAMBLE_LEN];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut scramble);
        // The scramble travels as two null-terminated parts; zero bytes
        // would truncate it on the wire.
        for b in scramble.iter_mut() {
            if *b == 0 {
                *b = 0x5A;
            }
        }

        let advertised = if server_version.starts_with("10.") {
            format!("5.5.5-{}", server_version)
        } else {
            server_version.to_string()
        };

        Self {
            protocol_version: 10,
            server_version: advertised,
            connection_id,
            scramble,
            capability_flags: PROXY_CAPABILITIES,
            extended_capabilities: 0,
            character_set: 0x21, // utf8_general_ci
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }

    /// Encode to packet (sequence 0: start of the login exchange)
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.connection_id);

        // Scramble part 1 (8 bytes) + filler
        buf.extend_from_slice(&self.scramble[..8]);
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((SCRAMBLE_LEN + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        // Reserved 10 bytes; the trailing 4 carry the MariaDB extended mask
        buf.extend_from_slice(&[0u8; 6]);
        buf.put_u32_le(self.extended_capabilities);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.scramble[8..]);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload (proxy acting as client toward a backend)
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut scramble = [0u8; SCRAMBLE_LEN];
        scramble[..8].copy_from_slice(&buf[..8]);
        buf.advance(8);
        buf.advance(1); // filler

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8() as usize;

        buf.advance(6);
        let extended_capabilities = buf.get_u32_le();

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // Scramble part 2: at least 12 bytes, null-terminated
            let part2_len = auth_plugin_data_len.saturating_sub(9).max(12);
            if buf.len() < part2_len {
                return None;
            }
            scramble[8..].copy_from_slice(&buf[..12]);
            buf.advance(part2_len);
            if !buf.is_empty() && buf[0] == 0 {
                buf.advance(1);
            }
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            scramble,
            capability_flags,
            extended_capabilities,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub wants_ssl: bool,
}

impl HandshakeResponse {
    /// Parse from packet payload
    ///
    /// A 32-byte payload carrying only the capability header is an
    /// SSLRequest; it is reported with `wants_ssl` and empty username.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();
        buf.advance(23);

        let wants_ssl = capability_flags & CLIENT_SSL != 0;
        if buf.is_empty() {
            return Some(Self {
                capability_flags,
                max_packet_size,
                character_set,
                username: String::new(),
                auth_response: Vec::new(),
                database: None,
                auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
                wants_ssl,
            });
        }

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let (data, used) = get_lenenc_str(buf)?;
            let data = data.to_vec();
            buf.advance(used);
            data
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = *buf.first()? as usize;
            buf.advance(1);
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            wants_ssl,
        })
    }

    /// Encode to packet (proxy logging in to a backend)
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Server-initiated mid-handshake plugin change (0xFE + name + scramble)
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub scramble: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.extend_from_slice(self.plugin_name.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(&self.scramble);
        buf.put_u8(0);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() < 2 {
            return None;
        }
        let rest = &payload[1..];
        let null_pos = rest.iter().position(|&b| b == 0)?;
        let plugin_name = String::from_utf8_lossy(&rest[..null_pos]).to_string();
        let mut scramble = rest[null_pos + 1..].to_vec();
        if scramble.last() == Some(&0) {
            scramble.pop();
        }
        Some(Self {
            plugin_name,
            scramble,
        })
    }
}

/// COM_CHANGE_USER payload
#[derive(Debug, Clone)]
pub struct ChangeUser {
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub character_set: u16,
    pub auth_plugin_name: String,
}

impl ChangeUser {
    /// Parse the payload after the 0x11 command byte
    pub fn parse(payload: &[u8], capability_flags: u32) -> Option<Self> {
        let mut buf = payload;

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        let auth_response = if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = *buf.first()? as usize;
            buf.advance(1);
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            let null_pos = buf.iter().position(|&b| b == 0)?;
            let data = buf[..null_pos].to_vec();
            buf.advance(null_pos + 1);
            data
        };

        let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance((null_pos + 1).min(buf.len()));
        let database = if db.is_empty() { None } else { Some(db) };

        let character_set = if buf.len() >= 2 { buf.get_u16_le() } else { 0 };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Some(Self {
            username,
            auth_response,
            database,
            character_set,
            auth_plugin_name,
        })
    }
}

/// Session state entry types in an OK packet's trailer
const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0;
const SESSION_TRACK_SCHEMA: u8 = 1;
const SESSION_TRACK_GTIDS: u8 = 3;
const SESSION_TRACK_TRANSACTION_CHARACTERISTICS: u8 = 4;

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Last GTID observed in the session-track trailer
    pub gtid: Option<String>,
    /// Schema change reported via session tracking
    pub schema: Option<String>,
    /// Tracked system variable changes (name, value)
    pub system_variables: Vec<(String, String)>,
    /// Tracked transaction characteristics statement
    pub trx_characteristics: Option<String>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: status::SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & status::SERVER_MORE_RESULTS_EXIST != 0
    }

    pub fn encode(&self, sequence_id: u8, capability_flags: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capability_flags & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        if capability_flags & CLIENT_SESSION_TRACK != 0
            && self.status_flags & status::SERVER_SESSION_STATE_CHANGED != 0
        {
            put_lenenc_str(&mut buf, b""); // info
            let mut track = BytesMut::new();
            if let Some(ref gtid) = self.gtid {
                track.put_u8(SESSION_TRACK_GTIDS);
                let mut entry = BytesMut::new();
                entry.put_u8(0); // encoding specification
                put_lenenc_str(&mut entry, gtid.as_bytes());
                put_lenenc_str(&mut track, &entry);
            }
            put_lenenc_str(&mut buf, &track);
        }

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse an OK payload, including the session-track trailer when the
    /// negotiated capabilities carry CLIENT_SESSION_TRACK
    pub fn parse(payload: &[u8], capability_flags: u32) -> Option<Self> {
        if payload.first() != Some(&0x00) && payload.first() != Some(&0xFE) {
            return None;
        }

        let mut buf = &payload[1..];
        let (affected_rows, used) = get_lenenc_int(buf)?;
        buf = &buf[used..];
        let (last_insert_id, used) = get_lenenc_int(buf)?;
        buf = &buf[used..];

        let mut ok = OkPacket {
            affected_rows,
            last_insert_id,
            ..Default::default()
        };

        if capability_flags & CLIENT_PROTOCOL_41 != 0 {
            if buf.len() < 4 {
                return Some(ok);
            }
            ok.status_flags = u16::from_le_bytes([buf[0], buf[1]]);
            ok.warnings = u16::from_le_bytes([buf[2], buf[3]]);
            buf = &buf[4..];
        }

        if capability_flags & CLIENT_SESSION_TRACK != 0 && !buf.is_empty() {
            let (_info, used) = get_lenenc_str(buf)?;
            buf = &buf[used..];

            if ok.status_flags & status::SERVER_SESSION_STATE_CHANGED != 0 && !buf.is_empty() {
                let (mut track, _) = get_lenenc_str(buf)?;
                while !track.is_empty() {
                    let entry_type = track[0];
                    track = &track[1..];
                    let (data, used) = get_lenenc_str(track)?;
                    track = &track[used..];
                    Self::parse_track_entry(&mut ok, entry_type, data);
                }
            }
        }

        Some(ok)
    }

    fn parse_track_entry(ok: &mut OkPacket, entry_type: u8, data: &[u8]) {
        match entry_type {
            SESSION_TRACK_SYSTEM_VARIABLES => {
                let mut rest = data;
                while let Some((name, used)) = get_lenenc_str(rest) {
                    rest = &rest[used..];
                    let Some((value, used)) = get_lenenc_str(rest) else {
                        break;
                    };
                    rest = &rest[used..];
                    ok.system_variables.push((
                        String::from_utf8_lossy(name).to_string(),
                        String::from_utf8_lossy(value).to_string(),
                    ));
                }
            }
            SESSION_TRACK_SCHEMA => {
                if let Some((schema, _)) = get_lenenc_str(data) {
                    ok.schema = Some(String::from_utf8_lossy(schema).to_string());
                }
            }
            SESSION_TRACK_GTIDS => {
                // One byte of encoding specification precedes the text
                if data.len() > 1 {
                    if let Some((gtid, _)) = get_lenenc_str(&data[1..]) {
                        ok.gtid = Some(String::from_utf8_lossy(gtid).to_string());
                    }
                }
            }
            SESSION_TRACK_TRANSACTION_CHARACTERISTICS => {
                if let Some((stmt, _)) = get_lenenc_str(data) {
                    ok.trx_characteristics = Some(String::from_utf8_lossy(stmt).to_string());
                }
            }
            _ => {}
        }
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    pub fn encode(&self, sequence_id: u8, capability_flags: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capability_flags & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) || payload.len() < 3 {
            return None;
        }

        let mut buf = &payload[1..];
        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if !buf.is_empty() && buf[0] == b'#' && buf.len() >= 6 {
            let sql_state = String::from_utf8_lossy(&buf[1..6]).to_string();
            let error_message = String::from_utf8_lossy(&buf[6..]).to_string();
            (sql_state, error_message)
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet (pre-DEPRECATE_EOF result set delimiter)
#[derive(Debug, Clone, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() >= 9 {
            return None;
        }
        let mut eof = EofPacket::default();
        if payload.len() >= 5 {
            eof.warnings = u16::from_le_bytes([payload[1], payload[2]]);
            eof.status_flags = u16::from_le_bytes([payload[3], payload[4]]);
        }
        Some(eof)
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Compute the mysql_native_password client token:
/// SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha1::digest(password.as_bytes());
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    hash1
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Verify a client token against the stored double-SHA1 password hash.
///
/// `stored_hash` is SHA1(SHA1(password)) as held in the grants table. The
/// server recovers SHA1(password) from the token and checks its hash.
pub fn verify_auth_response(stored_hash: &[u8], scramble: &[u8], token: &[u8]) -> bool {
    if token.len() != 20 || stored_hash.len() != 20 {
        return false;
    }

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stored_hash);
    let hash3 = hasher.finalize();

    let recovered_hash1: Vec<u8> = token.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect();
    let recomputed = Sha1::digest(&recovered_hash1);
    recomputed.as_slice() == stored_hash
}

/// Double-SHA1 a cleartext password into the stored-hash form
pub fn hash_password(password: &str) -> Vec<u8> {
    Sha1::digest(Sha1::digest(password.as_bytes())).to_vec()
}
