//! Session command history
//!
//! Statements that change connection state (SET, USE, PREPARE,
//! COM_CHANGE_USER, ...) must be reproduced on every backend a session later
//! uses, so any backend can answer the next read. The history keeps them in
//! execution order under monotonically increasing positions, together with
//! the authoritative response byte for divergence detection.

use std::collections::HashMap;

use bytes::Bytes;

use crate::protocol::Command;

/// One replayable session command
#[derive(Debug, Clone)]
pub struct SessionCommand {
    pub position: u64,
    pub command: Command,
    /// Full command payload including the command byte
    pub payload: Bytes,
}

/// Ordered session command log with response bookkeeping
#[derive(Debug, Default)]
pub struct SessionCommandHistory {
    commands: Vec<SessionCommand>,
    next_position: u64,
    /// First response byte per position, from the authoritative backend
    responses: HashMap<u64, u8>,
}

impl SessionCommandHistory {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            next_position: 1,
            responses: HashMap::new(),
        }
    }

    /// Append a command, returning its position
    pub fn append(&mut self, command: Command, payload: Bytes) -> u64 {
        let position = self.next_position;
        self.next_position += 1;
        self.commands.push(SessionCommand {
            position,
            command,
            payload,
        });
        position
    }

    /// Record the authoritative response byte for a position
    pub fn record_response(&mut self, position: u64, first_byte: u8) {
        self.responses.entry(position).or_insert(first_byte);
    }

    /// Whether a backend's response byte diverges from the authoritative one
    pub fn response_diverges(&self, position: u64, first_byte: u8) -> bool {
        self.responses
            .get(&position)
            .map(|&recorded| recorded != first_byte)
            .unwrap_or(false)
    }

    /// Drop a prepare from the history once the statement is closed, so
    /// replay on future connections stays bounded
    ///
    /// `prepare_position` is the position the prepare was stored under.
    pub fn prune_prepare(&mut self, prepare_position: u64) {
        self.commands.retain(|c| c.position != prepare_position);
        self.responses.remove(&prepare_position);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Commands in replay order
    pub fn iter(&self) -> impl Iterator<Item = &SessionCommand> {
        self.commands.iter()
    }

    /// Highest position assigned so far
    pub fn last_position(&self) -> u64 {
        self.next_position - 1
    }
}
