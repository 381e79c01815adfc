//! Statement classification
//!
//! Token-based keyword lookahead over COM_QUERY payloads. No parse tree is
//! built; anything ambiguous is classified as a write so routing stays safe.

pub mod hint;

pub use hint::{parse_hint, TargetHint};

/// Classification bitmask for one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementMask(u32);

impl StatementMask {
    pub const READ: StatementMask = StatementMask(1);
    pub const WRITE: StatementMask = StatementMask(1 << 1);
    pub const BEGIN_TRX: StatementMask = StatementMask(1 << 2);
    pub const COMMIT: StatementMask = StatementMask(1 << 3);
    pub const ROLLBACK: StatementMask = StatementMask(1 << 4);
    pub const ENABLE_AUTOCOMMIT: StatementMask = StatementMask(1 << 5);
    pub const DISABLE_AUTOCOMMIT: StatementMask = StatementMask(1 << 6);
    pub const STMT_UNSAFE: StatementMask = StatementMask(1 << 7);
    pub const READ_ONLY_TRX: StatementMask = StatementMask(1 << 8);
    pub const READ_WRITE_TRX: StatementMask = StatementMask(1 << 9);
    pub const SESSION_COMMAND: StatementMask = StatementMask(1 << 10);

    pub fn empty() -> Self {
        StatementMask(0)
    }

    pub fn contains(&self, other: StatementMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StatementMask) {
        self.0 |= other.0;
    }

    pub fn is_read(&self) -> bool {
        self.contains(Self::READ) && !self.contains(Self::WRITE)
    }

    pub fn is_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_session_command(&self) -> bool {
        self.contains(Self::SESSION_COMMAND)
    }

    pub fn starts_trx(&self) -> bool {
        self.contains(Self::BEGIN_TRX)
    }

    pub fn ends_trx(&self) -> bool {
        self.contains(Self::COMMIT) || self.contains(Self::ROLLBACK)
    }
}

/// Session SQL dialect mode, tracked from SET SQL_MODE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqlMode {
    #[default]
    Default,
    Oracle,
}

/// Result of classifying one statement
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub mask: StatementMask,
    /// SQL mode change carried by this SET statement
    pub sql_mode_change: Option<SqlMode>,
    /// KILL statement details, when the statement is a KILL
    pub kill: Option<KillCommand>,
}

/// Parsed `KILL [HARD|SOFT] [CONNECTION|QUERY] {<id> | USER <name>}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillCommand {
    pub target: KillTarget,
    pub kind: KillKind,
    pub hard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Id(u64),
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillKind {
    Connection,
    Query,
}

/// Classify a COM_QUERY payload
pub fn classify(sql: &str, mode: SqlMode) -> Classification {
    let tokens = tokenize(sql, 512);
    let mut c = Classification::default();

    let Some(first) = tokens.first() else {
        c.mask.insert(StatementMask::WRITE);
        return c;
    };

    match first.as_str() {
        "SELECT" => classify_select(sql, &tokens, &mut c),
        "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "HELP" | "CHECKSUM" => {
            c.mask.insert(StatementMask::READ)
        }
        "BEGIN" => {
            if mode == SqlMode::Oracle {
                // An anonymous PL/SQL block, not a transaction boundary
                c.mask.insert(StatementMask::WRITE);
                c.mask.insert(StatementMask::STMT_UNSAFE);
            } else if tokens.get(1).map(String::as_str) == Some("NOT") {
                // BEGIN NOT ATOMIC ... compound statement
                c.mask.insert(StatementMask::WRITE);
            } else {
                c.mask.insert(StatementMask::BEGIN_TRX);
            }
        }
        "START" => {
            if tokens.get(1).map(String::as_str) == Some("TRANSACTION") {
                c.mask.insert(StatementMask::BEGIN_TRX);
                classify_trx_characteristics(&tokens[2..], &mut c);
            } else {
                // START SLAVE and friends
                c.mask.insert(StatementMask::WRITE);
            }
        }
        "COMMIT" => c.mask.insert(StatementMask::COMMIT),
        "ROLLBACK" => {
            if tokens.get(1).map(String::as_str) == Some("TO") {
                // Savepoint rollback keeps the transaction open
                c.mask.insert(StatementMask::WRITE);
            } else {
                c.mask.insert(StatementMask::ROLLBACK);
            }
        }
        "SET" => classify_set(&tokens, &mut c),
        "USE" => {
            c.mask.insert(StatementMask::SESSION_COMMAND);
            c.mask.insert(StatementMask::READ);
        }
        "PREPARE" | "DEALLOCATE" => {
            c.mask.insert(StatementMask::SESSION_COMMAND);
            c.mask.insert(StatementMask::WRITE);
        }
        "EXECUTE" => c.mask.insert(StatementMask::WRITE),
        "KILL" => {
            if let Some(kill) = parse_kill_tokens(&tokens[1..]) {
                c.kill = Some(kill);
            }
            c.mask.insert(StatementMask::WRITE);
        }
        "LOCK" | "UNLOCK" | "FLUSH" | "GET" | "HANDLER" => {
            c.mask.insert(StatementMask::WRITE);
            c.mask.insert(StatementMask::STMT_UNSAFE);
        }
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "ALTER" | "DROP"
        | "TRUNCATE" | "RENAME" | "GRANT" | "REVOKE" | "LOAD" | "CALL" | "OPTIMIZE"
        | "ANALYZE" | "REPAIR" | "DO" | "INSTALL" | "UNINSTALL" | "SAVEPOINT" | "RELEASE"
        | "XA" => c.mask.insert(StatementMask::WRITE),
        // Ambiguity defaults to write
        _ => c.mask.insert(StatementMask::WRITE),
    }

    c
}

fn classify_select(sql: &str, tokens: &[String], c: &mut Classification) {
    c.mask.insert(StatementMask::READ);

    // Locking clauses sit at the end; statements longer than the token scan
    // window get a tail check so they are never misrouted to a slave.
    if tokens.len() == 512 {
        let start = sql.len().saturating_sub(256);
        let tail = String::from_utf8_lossy(&sql.as_bytes()[start..]).to_uppercase();
        if tail.contains("FOR UPDATE") || tail.contains("LOCK IN SHARE MODE") {
            c.mask.insert(StatementMask::WRITE);
        }
    }

    for (i, token) in tokens.iter().enumerate() {
        match token.as_str() {
            // SELECT ... FOR UPDATE / LOCK IN SHARE MODE must see the master
            "FOR" if tokens.get(i + 1).map(String::as_str) == Some("UPDATE") => {
                c.mask.insert(StatementMask::WRITE);
            }
            "LOCK" if tokens.get(i + 1).map(String::as_str) == Some("IN") => {
                c.mask.insert(StatementMask::WRITE);
            }
            // Functions whose value depends on the connection that ran the
            // preceding write
            "GET_LOCK" | "RELEASE_LOCK" | "IS_FREE_LOCK" | "IS_USED_LOCK"
            | "LAST_INSERT_ID" | "FOUND_ROWS" | "ROW_COUNT" => {
                c.mask.insert(StatementMask::STMT_UNSAFE);
            }
            _ => {}
        }
    }
}

fn classify_trx_characteristics(rest: &[String], c: &mut Classification) {
    let mut i = 0;
    while i + 1 < rest.len() {
        if rest[i] == "READ" {
            match rest[i + 1].as_str() {
                "ONLY" => c.mask.insert(StatementMask::READ_ONLY_TRX),
                "WRITE" => c.mask.insert(StatementMask::READ_WRITE_TRX),
                _ => {}
            }
        }
        i += 1;
    }
}

fn classify_set(tokens: &[String], c: &mut Classification) {
    c.mask.insert(StatementMask::SESSION_COMMAND);
    c.mask.insert(StatementMask::READ);

    // Find "autocommit" in forms: SET autocommit=, SET @@autocommit=,
    // SET @@session.autocommit=, SET SESSION autocommit=
    for (i, token) in tokens.iter().enumerate() {
        let name = token
            .trim_start_matches("@@SESSION.")
            .trim_start_matches("@@LOCAL.")
            .trim_start_matches("@@GLOBAL.")
            .trim_start_matches("@@");
        if name == "AUTOCOMMIT" {
            if let Some(value) = tokens.get(i + 1) {
                match value.as_str() {
                    "0" | "OFF" | "FALSE" => {
                        c.mask.insert(StatementMask::DISABLE_AUTOCOMMIT);
                        // Disabling autocommit opens an implicit transaction
                        c.mask.insert(StatementMask::BEGIN_TRX);
                    }
                    "1" | "ON" | "TRUE" => {
                        c.mask.insert(StatementMask::ENABLE_AUTOCOMMIT);
                        c.mask.insert(StatementMask::COMMIT);
                    }
                    _ => {}
                }
            }
        }
        if name == "SQL_MODE" {
            // Values were uppercased by the tokenizer; string bodies keep
            // their quotes stripped
            let changed = tokens[i + 1..]
                .iter()
                .any(|t| t.contains("ORACLE"));
            c.sql_mode_change = Some(if changed {
                SqlMode::Oracle
            } else {
                SqlMode::Default
            });
        }
    }
}

/// Parse a KILL statement body (tokens after the KILL keyword)
fn parse_kill_tokens(tokens: &[String]) -> Option<KillCommand> {
    let mut hard = true;
    let mut kind = KillKind::Connection;
    let mut i = 0;

    match tokens.get(i).map(String::as_str) {
        Some("HARD") => i += 1,
        Some("SOFT") => {
            hard = false;
            i += 1;
        }
        _ => {}
    }

    match tokens.get(i).map(String::as_str) {
        Some("CONNECTION") => i += 1,
        Some("QUERY") => {
            kind = KillKind::Query;
            i += 1;
        }
        _ => {}
    }

    match tokens.get(i).map(String::as_str) {
        Some("USER") => {
            let name = tokens.get(i + 1)?;
            Some(KillCommand {
                target: KillTarget::User(name.to_lowercase()),
                kind,
                hard,
            })
        }
        Some(id) => {
            let id: u64 = id.parse().ok()?;
            Some(KillCommand {
                target: KillTarget::Id(id),
                kind,
                hard,
            })
        }
        None => None,
    }
}

/// Tokenize the leading portion of a statement
///
/// Skips comments and whitespace, uppercases bare words, strips quotes from
/// string literals, and stops after `max_tokens` tokens. This is a keyword
/// scanner, not a SQL lexer.
fn tokenize(sql: &str, max_tokens: usize) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() && tokens.len() < max_tokens {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' | b';' | b'(' | b')' | b',' | b'=' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            b'\'' | b'"' | b'`' => {
                let quote = b;
                let start = i + 1;
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                tokens.push(
                    String::from_utf8_lossy(&bytes[start..i.min(bytes.len())]).to_uppercase(),
                );
                i = (i + 1).min(bytes.len());
            }
            _ => {
                let start = i;
                while i < bytes.len()
                    && !matches!(
                        bytes[i],
                        b' ' | b'\t'
                            | b'\r'
                            | b'\n'
                            | b';'
                            | b'('
                            | b')'
                            | b','
                            | b'='
                            | b'\''
                            | b'"'
                            | b'`'
                    )
                {
                    i += 1;
                }
                tokens.push(String::from_utf8_lossy(&bytes[start..i]).to_uppercase());
            }
        }
    }

    tokens
}
