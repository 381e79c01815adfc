//! Locally cached user account data
//!
//! Accounts are replicated from one reachable backend's grant tables and
//! persisted to a local file, so a restart can authenticate known users even
//! with every backend unreachable. Reloads are rate limited per the
//! configured interval; an authentication failure may trigger one additional
//! out-of-band reload to pick up fresh grants before the failure is reported.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One (user, host, db) grant row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub user: String,
    /// Host pattern: exact, SQL LIKE wildcards, or "localhost"
    pub host: String,
    /// Specific database this row grants access to
    pub db: Option<String>,
    /// Row grants access to every database
    pub any_db: bool,
    /// Hex form of SHA1(SHA1(password)); empty for passwordless accounts
    pub password_hash: String,
}

impl UserEntry {
    /// Decoded 20-byte stored hash, or None for a passwordless account
    pub fn stored_hash(&self) -> Option<Vec<u8>> {
        if self.password_hash.is_empty() {
            return None;
        }
        decode_hex(self.password_hash.trim_start_matches('*'))
    }
}

/// Reason a lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("user not found")]
    UserNotFound,
    #[error("unknown database")]
    UnknownDatabase,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read user cache file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse user cache file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize user cache: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheData {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    databases: Vec<String>,
}

/// Shared, read-mostly account cache
pub struct UserCache {
    data: RwLock<CacheData>,
    known_databases: RwLock<HashSet<String>>,
    file: Option<PathBuf>,
    reload_interval: Duration,
    last_reload: Mutex<Option<Instant>>,
    last_failure_reload: Mutex<Option<Instant>>,
    /// Let wildcard host patterns match loopback clients
    wildcard_matches_loopback: bool,
}

impl UserCache {
    pub fn new(
        file: Option<PathBuf>,
        reload_interval: Duration,
        wildcard_matches_loopback: bool,
    ) -> Self {
        Self {
            data: RwLock::new(CacheData::default()),
            known_databases: RwLock::new(HashSet::new()),
            file,
            reload_interval,
            last_reload: Mutex::new(None),
            last_failure_reload: Mutex::new(None),
            wildcard_matches_loopback,
        }
    }

    /// Load the persisted cache file, if one exists
    pub fn load_file(&self) -> Result<bool, CacheError> {
        let Some(path) = &self.file else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let content = std::fs::read_to_string(path)?;
        let data: CacheData = toml::from_str(&content)?;
        let count = data.users.len();
        *self.known_databases.write() = data.databases.iter().cloned().collect();
        *self.data.write() = data;
        info!(users = count, path = %path.display(), "Loaded persisted user cache");
        Ok(true)
    }

    /// Replace the cache contents and persist them
    pub fn replace(&self, users: Vec<UserEntry>, databases: Vec<String>) {
        debug!(
            users = users.len(),
            databases = databases.len(),
            "User cache updated"
        );
        *self.known_databases.write() = databases.iter().cloned().collect();
        let data = CacheData { users, databases };
        if let Some(path) = &self.file {
            if let Err(e) = persist(path, &data) {
                warn!(error = %e, "Failed to persist user cache");
            }
        }
        *self.data.write() = data;
        *self.last_reload.lock() = Some(Instant::now());
    }

    /// Whether a periodic reload is currently permitted
    pub fn reload_permitted(&self) -> bool {
        let last = self.last_reload.lock();
        match *last {
            Some(at) => at.elapsed() >= self.reload_interval,
            None => true,
        }
    }

    /// Whether the one extra reload after an authentication failure is
    /// currently permitted
    pub fn failure_reload_permitted(&self) -> bool {
        let mut last = self.last_failure_reload.lock();
        let allowed = match *last {
            Some(at) => at.elapsed() >= self.reload_interval,
            None => true,
        };
        if allowed {
            *last = Some(Instant::now());
        }
        allowed
    }

    /// Look up the matching grant row for a connecting client
    ///
    /// Host patterns are tried for an exact match first, then wildcard
    /// patterns, so `app@10.0.0.5` wins over `app@%`.
    pub fn find(
        &self,
        user: &str,
        host: &str,
        db: Option<&str>,
    ) -> Result<UserEntry, LookupError> {
        let data = self.data.read();

        let mut candidates: Vec<&UserEntry> = data
            .users
            .iter()
            .filter(|e| e.user == user)
            .filter(|e| host_matches(&e.host, host, self.wildcard_matches_loopback))
            .collect();

        if candidates.is_empty() {
            return Err(LookupError::UserNotFound);
        }

        // More specific host patterns sort first
        candidates.sort_by_key(|e| host_specificity(&e.host));

        if let Some(db) = db {
            if !self.known_databases.read().contains(db) {
                return Err(LookupError::UnknownDatabase);
            }
            for entry in &candidates {
                if entry.any_db || entry.db.as_deref() == Some(db) {
                    return Ok((*entry).clone());
                }
            }
            return Err(LookupError::UnknownDatabase);
        }

        Ok(candidates[0].clone())
    }

    pub fn user_count(&self) -> usize {
        self.data.read().users.len()
    }
}

fn persist(path: &Path, data: &CacheData) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(data)?;
    // Write-then-rename keeps a readable file across a crash mid-write
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Sort key: exact hosts before wildcard patterns, longer patterns first
fn host_specificity(pattern: &str) -> (u8, i64) {
    let has_wildcard = pattern.contains('%') || pattern.contains('_');
    (u8::from(has_wildcard), -(pattern.len() as i64))
}

/// Match a client host against a grant-table host pattern
pub fn host_matches(pattern: &str, host: &str, wildcard_matches_loopback: bool) -> bool {
    if pattern == host {
        return true;
    }

    // "localhost" covers both loopback address families
    if pattern.eq_ignore_ascii_case("localhost") && is_loopback(host) {
        return true;
    }

    if pattern.contains('%') || pattern.contains('_') {
        if is_loopback(host) && !wildcard_matches_loopback {
            return false;
        }
        return like_match(pattern.as_bytes(), host.as_bytes());
    }

    false
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host == "::ffff:127.0.0.1"
}

/// SQL LIKE matching with `%` (any run) and `_` (any single byte)
fn like_match(pattern: &[u8], value: &[u8]) -> bool {
    match (pattern.first(), value.first()) {
        (None, None) => true,
        (Some(b'%'), _) => {
            like_match(&pattern[1..], value)
                || (!value.is_empty() && like_match(pattern, &value[1..]))
        }
        (Some(b'_'), Some(_)) => like_match(&pattern[1..], &value[1..]),
        (Some(p), Some(v)) if p.eq_ignore_ascii_case(v) => {
            like_match(&pattern[1..], &value[1..])
        }
        _ => false,
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Hex-encode a stored hash for persistence
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
