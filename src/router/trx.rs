//! Transaction recording for replay
//!
//! While replay is enabled, every statement of the open transaction is kept
//! together with a running SHA-1 over the concatenated bytes of every
//! server-sent packet belonging to those statements. A replayed transaction
//! is accepted only when the new reply bytes hash to the same value. The
//! record is bounded; crossing the size cap marks the transaction
//! non-replayable.

use bytes::Bytes;
use sha1::{Digest, Sha1};

/// Record of the open (or replayed) transaction
#[derive(Clone, Default)]
pub struct Transaction {
    statements: Vec<Bytes>,
    checksum: Sha1,
    size: usize,
    max_size: usize,
    too_big: bool,
    open: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("statements", &self.statements.len())
            .field("size", &self.size)
            .field("too_big", &self.too_big)
            .field("open", &self.open)
            .finish()
    }
}

impl Transaction {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Begin recording a new transaction
    pub fn start(&mut self) {
        self.statements.clear();
        self.checksum = Sha1::new();
        self.size = 0;
        self.too_big = false;
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Whether the transaction can still be replayed
    pub fn replayable(&self) -> bool {
        !self.too_big
    }

    /// Record one executed statement payload
    pub fn add_statement(&mut self, payload: Bytes) {
        if !self.open {
            return;
        }
        self.track_size(payload.len());
        if self.too_big {
            self.statements.clear();
            return;
        }
        self.statements.push(payload);
    }

    /// Fold server-sent reply bytes into the running checksum
    pub fn add_reply_bytes(&mut self, bytes: &[u8]) {
        if !self.open || self.too_big {
            return;
        }
        self.track_size(bytes.len());
        if !self.too_big {
            self.checksum.update(bytes);
        }
    }

    fn track_size(&mut self, add: usize) {
        self.size += add;
        if self.max_size > 0 && self.size > self.max_size {
            self.too_big = true;
            self.statements.clear();
        }
    }

    /// Current checksum value; the running state is unaffected
    pub fn checksum(&self) -> [u8; 20] {
        self.checksum.clone().finalize().into()
    }

    /// Statements in execution order
    pub fn statements(&self) -> &[Bytes] {
        &self.statements
    }

    /// Snapshot for replay: the replay re-executes from a copy so a failed
    /// attempt can start over from the original
    pub fn snapshot(&self) -> Transaction {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_matches_for_same_replies() {
        let mut original = Transaction::new(0);
        original.start();
        original.add_statement(Bytes::from_static(b"\x03INSERT 1"));
        original.add_reply_bytes(b"ok-packet-bytes");
        original.add_statement(Bytes::from_static(b"\x03INSERT 2"));
        original.add_reply_bytes(b"ok-packet-bytes-2");

        let mut replayed = Transaction::new(0);
        replayed.start();
        replayed.add_statement(Bytes::from_static(b"\x03INSERT 1"));
        replayed.add_reply_bytes(b"ok-packet-bytes");
        replayed.add_statement(Bytes::from_static(b"\x03INSERT 2"));
        replayed.add_reply_bytes(b"ok-packet-bytes-2");

        assert_eq!(original.checksum(), replayed.checksum());
    }

    #[test]
    fn test_checksum_differs_for_different_replies() {
        let mut a = Transaction::new(0);
        a.start();
        a.add_reply_bytes(b"affected rows: 1");

        let mut b = Transaction::new(0);
        b.start();
        b.add_reply_bytes(b"affected rows: 2");

        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_size_cap_marks_non_replayable() {
        let mut trx = Transaction::new(16);
        trx.start();
        assert!(trx.replayable());

        trx.add_statement(Bytes::from(vec![0u8; 32]));
        assert!(!trx.replayable());
        assert!(trx.statements().is_empty());

        // Further additions stay dropped
        trx.add_statement(Bytes::from_static(b"\x03x"));
        assert!(trx.statements().is_empty());
    }

    #[test]
    fn test_start_resets_state() {
        let mut trx = Transaction::new(16);
        trx.start();
        trx.add_statement(Bytes::from(vec![0u8; 32]));
        assert!(!trx.replayable());

        trx.start();
        assert!(trx.replayable());
        assert!(trx.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut trx = Transaction::new(0);
        trx.start();
        trx.add_statement(Bytes::from_static(b"\x03INSERT 1"));
        let snapshot = trx.snapshot();

        trx.add_statement(Bytes::from_static(b"\x03INSERT 2"));
        assert_eq!(snapshot.statements().len(), 1);
        assert_eq!(trx.statements().len(), 2);
    }

    #[test]
    fn test_checksum_read_does_not_disturb_running_state() {
        let mut trx = Transaction::new(0);
        trx.start();
        trx.add_reply_bytes(b"part one");
        let mid = trx.checksum();
        trx.add_reply_bytes(b"part two");
        let end = trx.checksum();
        assert_ne!(mid, end);

        let mut reference = Transaction::new(0);
        reference.start();
        reference.add_reply_bytes(b"part one");
        reference.add_reply_bytes(b"part two");
        assert_eq!(end, reference.checksum());
    }
}
