use crate::classifier::{Classification, SqlMode, StatementMask};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Created,
    /// Authentication completed, statements flow
    Started,
    /// COM_QUIT received; draining in-flight replies before closing
    Stopping,
    Stopped,
}

/// Client-visible session state
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub username: String,
    pub client_host: String,
    pub database: Option<String>,
    pub capability_flags: u32,
    pub character_set: u8,
    pub sql_mode: SqlMode,
    pub autocommit: bool,
    pub in_transaction: bool,
}

impl SessionState {
    pub fn new(client_host: String) -> Self {
        Self {
            client_host,
            autocommit: true,
            ..Default::default()
        }
    }

    /// Record the outcome of the login exchange
    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capability_flags: u32,
        character_set: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capability_flags;
        self.character_set = character_set;
    }

    /// Apply a statement's classification side effects: SQL mode changes,
    /// autocommit toggles, transaction boundaries
    pub fn track_statement(&mut self, classification: &Classification) {
        if let Some(mode) = classification.sql_mode_change {
            self.sql_mode = mode;
        }

        let mask = classification.mask;
        if mask.contains(StatementMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
        }
        if mask.contains(StatementMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
        }
        if mask.starts_trx() {
            self.in_transaction = true;
        }
        if mask.ends_trx() && !mask.starts_trx() {
            self.in_transaction = false;
        }
    }

    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }

    /// Atomically adopt new credentials after COM_CHANGE_USER validates
    pub fn change_user(&mut self, username: String, database: Option<String>) {
        self.username = username;
        self.database = database;
        self.in_transaction = false;
        self.autocommit = true;
    }
}
