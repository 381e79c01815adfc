mod buffer;
mod command;
mod handshake;
mod packet;
mod reply;

pub use buffer::{
    get_lenenc_int, get_lenenc_str, get_u24_le, put_lenenc_int, put_lenenc_str, put_u24_le,
    BufferChain,
};
pub use command::{rewrite_stmt_id, ClientCommand, LargeQueryTracker};
pub use handshake::{
    compute_auth_response, hash_password, verify_auth_response, AuthSwitchRequest, ChangeUser,
    EofPacket, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, NATIVE_PASSWORD_PLUGIN,
    SCRAMBLE_LEN,
};
pub use packet::{
    capabilities, status, Command, Packet, PacketCodec, MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE,
};
pub use reply::{PrepareOk, ReplyError, ReplyEvent, ReplyState, ReplySummary, ReplyTracker};
