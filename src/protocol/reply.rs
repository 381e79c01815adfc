//! Backend reply tracking
//!
//! A `ReplyTracker` follows the server's half of one command exchange packet
//! by packet and reports when the complete reply has been seen. The router
//! forwards packets as they arrive; the tracker only decides where a reply
//! ends and what it carried (OK details, error, prepared-statement metadata).

use bytes::Buf;
use thiserror::Error;

use super::buffer::get_lenenc_int;
use super::handshake::{ErrPacket, OkPacket};
use super::packet::{capabilities::CLIENT_DEPRECATE_EOF, status, Command, Packet};

/// Position inside one command's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Expecting the first packet of a (possibly multi-) result
    Start,
    /// Column count read, streaming column definitions
    ColumnDefs { remaining: u64 },
    /// Expecting the EOF delimiter that follows column definitions
    EofAfterColumns,
    /// Streaming row packets until the result-set terminator
    Rows,
    /// Server requested a local-infile upload; an OK or ERR follows the data
    LocalInfile,
    /// Prepared-statement OK read, streaming parameter definitions
    PrepareParamDefs { remaining: u16, columns: u16 },
    /// Expecting the EOF delimiter after parameter definitions
    EofAfterParamDefs { columns: u16 },
    /// Streaming prepared-statement column definitions
    PrepareColumnDefs { remaining: u16 },
    /// Expecting the EOF delimiter after prepared-statement columns
    EofAfterPrepareColumns,
    /// The full reply has been consumed
    Done,
}

/// Metadata from a COM_STMT_PREPARE response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    /// Parse the fixed-offset prepared-statement OK payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 12 || payload[0] != 0x00 {
            return None;
        }
        let mut buf = &payload[1..];
        let statement_id = buf.get_u32_le();
        let num_columns = buf.get_u16_le();
        let num_params = buf.get_u16_le();
        buf.advance(1); // filler
        let warnings = buf.get_u16_le();
        Some(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

/// What one processed packet meant for the reply
#[derive(Debug)]
pub enum ReplyEvent {
    /// Mid-reply packet, keep streaming
    Continue,
    /// The server asked for a local file; the client must now upload
    LocalInfileRequested,
    /// The reply is complete
    Complete(ReplySummary),
}

/// Summary of one complete reply
#[derive(Debug, Clone, Default)]
pub struct ReplySummary {
    /// Last OK of the reply (absent when it ended in an error or row EOF
    /// without status decoding)
    pub ok: Option<OkPacket>,
    pub error: Option<ErrPacket>,
    pub prepare: Option<PrepareOk>,
    /// Number of result sets streamed (0 for plain OK)
    pub result_sets: u32,
}

impl ReplySummary {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// GTID carried in the final OK's session-track trailer, if any
    pub fn gtid(&self) -> Option<&str> {
        self.ok.as_ref().and_then(|ok| ok.gtid.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("packet in state {state:?} does not match any legal transition: first byte {first:#04x}")]
    IllegalTransition { state: &'static str, first: u8 },
    #[error("malformed {0} packet")]
    Malformed(&'static str),
    #[error("reply packet received with no command outstanding")]
    Unexpected,
}

/// Reply state machine for one backend connection
#[derive(Debug)]
pub struct ReplyTracker {
    state: ReplyState,
    command: Command,
    capability_flags: u32,
    summary: ReplySummary,
}

impl ReplyTracker {
    pub fn new(capability_flags: u32) -> Self {
        Self {
            state: ReplyState::Done,
            command: Command::Sleep,
            capability_flags,
            summary: ReplySummary::default(),
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.capability_flags & CLIENT_DEPRECATE_EOF != 0
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    /// Arm the tracker for the reply to `command`
    ///
    /// Commands that elicit no response leave the tracker in Done.
    pub fn start_command(&mut self, command: Command) {
        self.command = command;
        self.summary = ReplySummary::default();
        self.state = if command.expects_response() {
            ReplyState::Start
        } else {
            ReplyState::Done
        };
    }

    /// Advance the machine with one complete server packet
    pub fn process(&mut self, packet: &Packet) -> Result<ReplyEvent, ReplyError> {
        let first = packet.first_byte().ok_or(ReplyError::Malformed("empty"))?;

        match self.state {
            ReplyState::Done => Err(ReplyError::Unexpected),

            ReplyState::Start => self.on_start(packet, first),

            ReplyState::ColumnDefs { remaining } => {
                let remaining = remaining - 1;
                if remaining == 0 {
                    self.state = if self.deprecate_eof() {
                        ReplyState::Rows
                    } else {
                        ReplyState::EofAfterColumns
                    };
                } else {
                    self.state = ReplyState::ColumnDefs { remaining };
                }
                Ok(ReplyEvent::Continue)
            }

            ReplyState::EofAfterColumns => {
                if first != 0xFE || packet.payload.len() >= 9 {
                    return Err(self.illegal("EofAfterColumns", first));
                }
                self.state = ReplyState::Rows;
                Ok(ReplyEvent::Continue)
            }

            ReplyState::Rows => self.on_row(packet, first),

            ReplyState::LocalInfile => match first {
                0x00 => self.finish_ok(packet),
                0xFF => self.finish_err(packet),
                _ => Err(self.illegal("LocalInfile", first)),
            },

            ReplyState::PrepareParamDefs { remaining, columns } => {
                let remaining = remaining - 1;
                self.state = if remaining == 0 {
                    if !self.deprecate_eof() {
                        ReplyState::EofAfterParamDefs { columns }
                    } else {
                        self.after_param_defs(columns)
                    }
                } else {
                    ReplyState::PrepareParamDefs { remaining, columns }
                };
                self.maybe_prepare_complete()
            }

            ReplyState::EofAfterParamDefs { columns } => {
                if first != 0xFE || packet.payload.len() >= 9 {
                    return Err(self.illegal("EofAfterParamDefs", first));
                }
                self.state = self.after_param_defs(columns);
                self.maybe_prepare_complete()
            }

            ReplyState::PrepareColumnDefs { remaining } => {
                let remaining = remaining - 1;
                self.state = if remaining == 0 {
                    if !self.deprecate_eof() {
                        ReplyState::EofAfterPrepareColumns
                    } else {
                        ReplyState::Done
                    }
                } else {
                    ReplyState::PrepareColumnDefs { remaining }
                };
                self.maybe_prepare_complete()
            }

            ReplyState::EofAfterPrepareColumns => {
                if first != 0xFE || packet.payload.len() >= 9 {
                    return Err(self.illegal("EofAfterPrepareColumns", first));
                }
                self.state = ReplyState::Done;
                self.maybe_prepare_complete()
            }
        }
    }

    fn on_start(&mut self, packet: &Packet, first: u8) -> Result<ReplyEvent, ReplyError> {
        // COM_STATISTICS answers with one bare string packet
        if self.command == Command::Statistics {
            self.state = ReplyState::Done;
            return Ok(ReplyEvent::Complete(self.summary.clone()));
        }

        // COM_FIELD_LIST streams column definitions straight to an EOF,
        // with no leading count packet
        if self.command == Command::FieldList {
            self.state = ReplyState::Rows;
            return self.on_row(packet, first);
        }

        if self.command == Command::StmtPrepare {
            return match first {
                0x00 => {
                    let prepare = PrepareOk::parse(&packet.payload)
                        .ok_or(ReplyError::Malformed("prepare OK"))?;
                    self.summary.prepare = Some(prepare);
                    self.state = if prepare.num_params > 0 {
                        ReplyState::PrepareParamDefs {
                            remaining: prepare.num_params,
                            columns: prepare.num_columns,
                        }
                    } else {
                        self.after_param_defs(prepare.num_columns)
                    };
                    self.maybe_prepare_complete()
                }
                0xFF => self.finish_err(packet),
                _ => Err(self.illegal("Start", first)),
            };
        }

        match first {
            0x00 => self.finish_ok(packet),
            0xFF => self.finish_err(packet),
            0xFB => {
                self.state = ReplyState::LocalInfile;
                Ok(ReplyEvent::LocalInfileRequested)
            }
            _ => {
                let (count, _) = get_lenenc_int(&packet.payload)
                    .ok_or(ReplyError::Malformed("column count"))?;
                if count == 0 {
                    return Err(self.illegal("Start", first));
                }
                self.state = ReplyState::ColumnDefs { remaining: count };
                Ok(ReplyEvent::Continue)
            }
        }
    }

    fn on_row(&mut self, packet: &Packet, first: u8) -> Result<ReplyEvent, ReplyError> {
        if first == 0xFF {
            return self.finish_err(packet);
        }

        // With DEPRECATE_EOF the terminator is an OK packet wearing an 0xFE
        // header; without it, a short classic EOF.
        if self.deprecate_eof() {
            if first == 0xFE && packet.payload.len() < super::packet::MAX_PAYLOAD_SIZE {
                let ok = OkPacket::parse(&packet.payload, self.capability_flags)
                    .ok_or(ReplyError::Malformed("result OK"))?;
                return self.finish_result_set(ok.more_results(), Some(ok));
            }
        } else if first == 0xFE && packet.payload.len() < 9 {
            let more = packet.payload.len() >= 5 && {
                let flags = u16::from_le_bytes([packet.payload[3], packet.payload[4]]);
                flags & status::SERVER_MORE_RESULTS_EXIST != 0
            };
            return self.finish_result_set(more, None);
        }

        Ok(ReplyEvent::Continue)
    }

    fn after_param_defs(&self, columns: u16) -> ReplyState {
        if columns > 0 {
            ReplyState::PrepareColumnDefs { remaining: columns }
        } else {
            ReplyState::Done
        }
    }

    fn maybe_prepare_complete(&mut self) -> Result<ReplyEvent, ReplyError> {
        if self.state == ReplyState::Done {
            Ok(ReplyEvent::Complete(self.summary.clone()))
        } else {
            Ok(ReplyEvent::Continue)
        }
    }

    fn finish_ok(&mut self, packet: &Packet) -> Result<ReplyEvent, ReplyError> {
        let ok = OkPacket::parse(&packet.payload, self.capability_flags)
            .ok_or(ReplyError::Malformed("OK"))?;
        let more = ok.more_results();
        self.summary.ok = Some(ok);
        if more {
            self.state = ReplyState::Start;
            Ok(ReplyEvent::Continue)
        } else {
            self.state = ReplyState::Done;
            Ok(ReplyEvent::Complete(self.summary.clone()))
        }
    }

    fn finish_err(&mut self, packet: &Packet) -> Result<ReplyEvent, ReplyError> {
        let err =
            ErrPacket::parse(&packet.payload).ok_or(ReplyError::Malformed("ERR"))?;
        self.summary.error = Some(err);
        self.state = ReplyState::Done;
        Ok(ReplyEvent::Complete(self.summary.clone()))
    }

    fn finish_result_set(
        &mut self,
        more: bool,
        ok: Option<OkPacket>,
    ) -> Result<ReplyEvent, ReplyError> {
        self.summary.result_sets += 1;
        if let Some(ok) = ok {
            self.summary.ok = Some(ok);
        }
        if more {
            self.state = ReplyState::Start;
            Ok(ReplyEvent::Continue)
        } else {
            self.state = ReplyState::Done;
            Ok(ReplyEvent::Complete(self.summary.clone()))
        }
    }

    fn illegal(&self, state: &'static str, first: u8) -> ReplyError {
        ReplyError::IllegalTransition { state, first }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::EofPacket;
    use crate::protocol::packet::capabilities::*;
    use bytes::{BufMut, Bytes, BytesMut};

    const CAPS: u32 = CLIENT_PROTOCOL_41;

    fn ok_payload(status_flags: u16) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u8(0); // affected rows
        buf.put_u8(0); // last insert id
        buf.put_u16_le(status_flags);
        buf.put_u16_le(0);
        buf.freeze()
    }

    fn eof_payload(status_flags: u16) -> Bytes {
        EofPacket {
            warnings: 0,
            status_flags,
        }
        .encode(0)
        .payload
    }

    fn feed(tracker: &mut ReplyTracker, payload: Bytes) -> ReplyEvent {
        tracker.process(&Packet::new(1, payload)).unwrap()
    }

    #[test]
    fn test_plain_ok_completes() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        match feed(&mut tracker, ok_payload(0)) {
            ReplyEvent::Complete(summary) => {
                assert!(summary.ok.is_some());
                assert_eq!(summary.result_sets, 0);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_error_completes() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        let err = ErrPacket::new(1064, "42000", "syntax").encode(1, CAPS).payload;
        match feed(&mut tracker, err) {
            ReplyEvent::Complete(summary) => assert!(summary.is_error()),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_result_set_classic_eof() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        // column count = 2
        feed(&mut tracker, Bytes::from_static(&[2]));
        assert_eq!(tracker.state(), ReplyState::ColumnDefs { remaining: 2 });

        feed(&mut tracker, Bytes::from_static(b"coldef1"));
        feed(&mut tracker, Bytes::from_static(b"coldef2"));
        assert_eq!(tracker.state(), ReplyState::EofAfterColumns);

        feed(&mut tracker, eof_payload(0));
        assert_eq!(tracker.state(), ReplyState::Rows);

        feed(&mut tracker, Bytes::from_static(b"row1"));
        feed(&mut tracker, Bytes::from_static(b"row2"));

        match feed(&mut tracker, eof_payload(0)) {
            ReplyEvent::Complete(summary) => assert_eq!(summary.result_sets, 1),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_result_set_deprecate_eof() {
        let mut tracker = ReplyTracker::new(CAPS | CLIENT_DEPRECATE_EOF);
        tracker.start_command(Command::Query);

        feed(&mut tracker, Bytes::from_static(&[1]));
        feed(&mut tracker, Bytes::from_static(b"coldef"));
        // No EOF after columns in deprecate mode
        assert_eq!(tracker.state(), ReplyState::Rows);

        feed(&mut tracker, Bytes::from_static(b"row"));

        // Terminating OK wears an 0xFE header
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        match feed(&mut tracker, buf.freeze()) {
            ReplyEvent::Complete(summary) => assert_eq!(summary.result_sets, 1),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_result_reenters_start() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        // First result: OK with MORE_RESULTS
        match feed(&mut tracker, ok_payload(status::SERVER_MORE_RESULTS_EXIST)) {
            ReplyEvent::Continue => {}
            other => panic!("expected Continue, got {:?}", other),
        }
        assert_eq!(tracker.state(), ReplyState::Start);

        // Second result: final OK
        match feed(&mut tracker, ok_payload(0)) {
            ReplyEvent::Complete(_) => {}
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_result_via_row_eof() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        feed(&mut tracker, Bytes::from_static(&[1]));
        feed(&mut tracker, Bytes::from_static(b"col"));
        feed(&mut tracker, eof_payload(0));
        // Row EOF with more-results flag re-enters Start
        match feed(
            &mut tracker,
            eof_payload(status::SERVER_MORE_RESULTS_EXIST),
        ) {
            ReplyEvent::Continue => {}
            other => panic!("expected Continue, got {:?}", other),
        }
        assert_eq!(tracker.state(), ReplyState::Start);

        match feed(&mut tracker, ok_payload(0)) {
            ReplyEvent::Complete(summary) => assert_eq!(summary.result_sets, 1),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_response_sequence() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::StmtPrepare);

        // stmt id 7, 2 columns, 1 param
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u32_le(7);
        buf.put_u16_le(2);
        buf.put_u16_le(1);
        buf.put_u8(0);
        buf.put_u16_le(0);
        feed(&mut tracker, buf.freeze());
        assert_eq!(
            tracker.state(),
            ReplyState::PrepareParamDefs {
                remaining: 1,
                columns: 2
            }
        );

        feed(&mut tracker, Bytes::from_static(b"paramdef"));
        assert_eq!(
            tracker.state(),
            ReplyState::EofAfterParamDefs { columns: 2 }
        );
        feed(&mut tracker, eof_payload(0));

        feed(&mut tracker, Bytes::from_static(b"coldef1"));
        feed(&mut tracker, Bytes::from_static(b"coldef2"));
        assert_eq!(tracker.state(), ReplyState::EofAfterPrepareColumns);

        match feed(&mut tracker, eof_payload(0)) {
            ReplyEvent::Complete(summary) => {
                let prepare = summary.prepare.unwrap();
                assert_eq!(prepare.statement_id, 7);
                assert_eq!(prepare.num_columns, 2);
                assert_eq!(prepare.num_params, 1);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_response_no_defs() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::StmtPrepare);

        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.put_u32_le(1);
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        buf.put_u8(0);
        buf.put_u16_le(0);
        match feed(&mut tracker, buf.freeze()) {
            ReplyEvent::Complete(summary) => {
                assert_eq!(summary.prepare.unwrap().statement_id, 1)
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_local_infile_flow() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);

        let mut buf = BytesMut::new();
        buf.put_u8(0xFB);
        buf.extend_from_slice(b"/tmp/data.csv");
        match feed(&mut tracker, buf.freeze()) {
            ReplyEvent::LocalInfileRequested => {}
            other => panic!("expected LocalInfileRequested, got {:?}", other),
        }
        assert_eq!(tracker.state(), ReplyState::LocalInfile);

        match feed(&mut tracker, ok_payload(0)) {
            ReplyEvent::Complete(_) => {}
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_done_exactly_once() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Query);
        feed(&mut tracker, ok_payload(0));

        // Any further packet is a protocol violation
        let result = tracker.process(&Packet::new(2, ok_payload(0)));
        assert!(matches!(result, Err(ReplyError::Unexpected)));
    }

    #[test]
    fn test_no_response_commands_stay_done() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::StmtClose);
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_field_list_reply() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::FieldList);

        // Definitions stream directly, then EOF
        feed(&mut tracker, Bytes::from_static(b"\x03def-column-1"));
        feed(&mut tracker, Bytes::from_static(b"\x03def-column-2"));
        match feed(&mut tracker, eof_payload(0)) {
            ReplyEvent::Complete(_) => {}
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_statistics_single_packet_reply() {
        let mut tracker = ReplyTracker::new(CAPS);
        tracker.start_command(Command::Statistics);

        match feed(&mut tracker, Bytes::from_static(b"Uptime: 5  Threads: 1")) {
            ReplyEvent::Complete(_) => {}
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_gtid_from_final_ok() {
        let caps = CAPS | CLIENT_SESSION_TRACK;
        let mut tracker = ReplyTracker::new(caps);
        tracker.start_command(Command::Query);

        let mut ok = OkPacket::new();
        ok.status_flags |= status::SERVER_SESSION_STATE_CHANGED;
        ok.gtid = Some("0-1-5".to_string());
        let payload = ok.encode(1, caps).payload;

        match feed(&mut tracker, payload) {
            ReplyEvent::Complete(summary) => {
                assert_eq!(summary.gtid(), Some("0-1-5"))
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }
}
