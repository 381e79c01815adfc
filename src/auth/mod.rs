//! Client authentication
//!
//! The proxy is the server side of the client's login: it hands out the
//! scramble, checks the native-password token against the cached grant rows,
//! and drives the auth-switch path when a client asks for another plugin.
//! COM_CHANGE_USER re-runs the same verification inside an established
//! session; the session's credentials are replaced only after the new token
//! validates.

mod cache;

pub use cache::{encode_hex, host_matches, CacheError, LookupError, UserCache, UserEntry};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendAuth, BackendConnection, BackendError, ServerDescriptor};
use crate::protocol::verify_auth_response;

/// Authentication outcome failure kinds, mapped to client-visible errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Access denied for user '{user}'@'{host}' (using password: {password_used})")]
    UserNotFound {
        user: String,
        host: String,
        password_used: &'static str,
    },

    #[error("Access denied for user '{user}'@'{host}' (using password: YES)")]
    WrongPassword { user: String, host: String },

    #[error("Unknown database '{db}'")]
    UnknownDatabase { db: String },

    #[error("Access without SSL denied")]
    SslRequired,

    #[error("Too many connections")]
    TooManyConnections,

    #[error("Host '{host}' is blocked because of many connection errors")]
    HostBlocked { host: String },

    #[error("Bad handshake")]
    BadHandshake,
}

impl AuthFailure {
    /// MySQL error number for this failure
    pub fn error_code(&self) -> u16 {
        match self {
            AuthFailure::UserNotFound { .. }
            | AuthFailure::WrongPassword { .. }
            | AuthFailure::SslRequired => 1045,
            AuthFailure::UnknownDatabase { .. } => 1049,
            AuthFailure::TooManyConnections => 1040,
            AuthFailure::HostBlocked { .. } => 1129,
            AuthFailure::BadHandshake => 1043,
        }
    }

    pub fn sql_state(&self) -> &'static str {
        match self {
            AuthFailure::UnknownDatabase { .. } => "42000",
            AuthFailure::TooManyConnections => "08004",
            AuthFailure::HostBlocked { .. } | AuthFailure::BadHandshake => "08S01",
            _ => "28000",
        }
    }

    /// Failures worth one out-of-band cache reload before reporting: the
    /// grants may simply have changed since the last load
    pub fn retry_after_reload(&self) -> bool {
        matches!(
            self,
            AuthFailure::UserNotFound { .. }
                | AuthFailure::WrongPassword { .. }
                | AuthFailure::UnknownDatabase { .. }
        )
    }
}

/// Per-host consecutive authentication failure tracking
pub struct HostBlocker {
    failures: DashMap<String, u32>,
    max_failures: u32,
}

impl HostBlocker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: DashMap::new(),
            max_failures,
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.max_failures > 0
            && self
                .failures
                .get(host)
                .map(|count| *count >= self.max_failures)
                .unwrap_or(false)
    }

    /// Record a failure; returns true when the host just became blocked
    pub fn record_failure(&self, host: &str) -> bool {
        if self.max_failures == 0 {
            return false;
        }
        let mut entry = self.failures.entry(host.to_string()).or_insert(0);
        *entry += 1;
        *entry == self.max_failures
    }

    pub fn record_success(&self, host: &str) {
        self.failures.remove(host);
    }
}

/// Server side of client authentication
pub struct Authenticator {
    cache: Arc<UserCache>,
    blocker: Arc<HostBlocker>,
    fetcher: Arc<UserFetcher>,
}

impl Authenticator {
    pub fn new(
        cache: Arc<UserCache>,
        blocker: Arc<HostBlocker>,
        fetcher: Arc<UserFetcher>,
    ) -> Self {
        Self {
            cache,
            blocker,
            fetcher,
        }
    }

    /// Validate one challenge/response exchange
    ///
    /// On a failure that could stem from stale grants, one rate-limited
    /// out-of-band reload runs before the failure is reported.
    pub async fn authenticate(
        &self,
        user: &str,
        host: &str,
        db: Option<&str>,
        scramble: &[u8],
        token: &[u8],
    ) -> Result<UserEntry, AuthFailure> {
        if self.blocker.is_blocked(host) {
            return Err(AuthFailure::HostBlocked {
                host: host.to_string(),
            });
        }

        match self.verify(user, host, db, scramble, token) {
            Ok(entry) => {
                self.blocker.record_success(host);
                Ok(entry)
            }
            Err(failure) if failure.retry_after_reload() => {
                if self.cache.failure_reload_permitted() {
                    debug!(user = %user, "Auth failed, reloading users before reporting");
                    self.fetcher.reload(&self.cache).await;
                    if let Ok(entry) = self.verify(user, host, db, scramble, token) {
                        self.blocker.record_success(host);
                        return Ok(entry);
                    }
                }
                self.note_failure(host);
                Err(failure)
            }
            Err(failure) => {
                self.note_failure(host);
                Err(failure)
            }
        }
    }

    fn note_failure(&self, host: &str) {
        if self.blocker.record_failure(host) {
            warn!(host = %host, "Host blocked after repeated authentication failures");
        }
    }

    fn verify(
        &self,
        user: &str,
        host: &str,
        db: Option<&str>,
        scramble: &[u8],
        token: &[u8],
    ) -> Result<UserEntry, AuthFailure> {
        let entry = self.cache.find(user, host, db).map_err(|e| match e {
            LookupError::UserNotFound => AuthFailure::UserNotFound {
                user: user.to_string(),
                host: host.to_string(),
                password_used: if token.is_empty() { "NO" } else { "YES" },
            },
            LookupError::UnknownDatabase => AuthFailure::UnknownDatabase {
                db: db.unwrap_or_default().to_string(),
            },
        })?;

        match entry.stored_hash() {
            None => {
                if token.is_empty() {
                    Ok(entry)
                } else {
                    Err(AuthFailure::WrongPassword {
                        user: user.to_string(),
                        host: host.to_string(),
                    })
                }
            }
            Some(stored) => {
                if verify_auth_response(&stored, scramble, token) {
                    Ok(entry)
                } else {
                    Err(AuthFailure::WrongPassword {
                        user: user.to_string(),
                        host: host.to_string(),
                    })
                }
            }
        }
    }
}

/// Replicates account rows from one reachable backend into the cache
pub struct UserFetcher {
    servers: Vec<Arc<ServerDescriptor>>,
    auth: BackendAuth,
    connect_timeout: Duration,
}

impl UserFetcher {
    pub fn new(
        servers: Vec<Arc<ServerDescriptor>>,
        auth: BackendAuth,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            servers,
            auth,
            connect_timeout,
        }
    }

    /// Reload the cache from the first backend that answers
    pub async fn reload(&self, cache: &UserCache) {
        for server in &self.servers {
            match self.fetch_from(server.clone()).await {
                Ok((users, databases)) => {
                    info!(
                        server = %server.name,
                        users = users.len(),
                        "User accounts loaded"
                    );
                    cache.replace(users, databases);
                    return;
                }
                Err(e) => {
                    debug!(server = %server.name, error = %e, "User load failed, trying next");
                }
            }
        }
        warn!("User account reload failed against every backend");
    }

    async fn fetch_from(
        &self,
        server: Arc<ServerDescriptor>,
    ) -> Result<(Vec<UserEntry>, Vec<String>), BackendError> {
        let mut conn = BackendConnection::connect(
            server,
            &self.auth,
            None,
            None,
            self.connect_timeout,
        )
        .await?;

        let mut users = Vec::new();

        // Global grant rows; Select_priv approximates "any database"
        let result = conn
            .query("SELECT user, host, password, select_priv FROM mysql.user")
            .await?;
        for row in &result.rows {
            users.push(UserEntry {
                user: row.first().cloned().flatten().unwrap_or_default(),
                host: row.get(1).cloned().flatten().unwrap_or_default(),
                db: None,
                any_db: row.get(3).cloned().flatten().as_deref() == Some("Y"),
                password_hash: row.get(2).cloned().flatten().unwrap_or_default(),
            });
        }

        // Per-database grant rows
        let result = conn
            .query("SELECT user, host, db FROM mysql.db")
            .await?;
        for row in &result.rows {
            let user = row.first().cloned().flatten().unwrap_or_default();
            let host = row.get(1).cloned().flatten().unwrap_or_default();
            let db = row.get(2).cloned().flatten();
            let hash = users
                .iter()
                .find(|u| u.user == user && u.host == host && u.db.is_none())
                .map(|u| u.password_hash.clone())
                .unwrap_or_default();
            users.push(UserEntry {
                user,
                host,
                db,
                any_db: false,
                password_hash: hash,
            });
        }

        let result = conn.query("SHOW DATABASES").await?;
        let databases = result
            .rows
            .iter()
            .filter_map(|row| row.first().cloned().flatten())
            .collect();

        Ok((users, databases))
    }
}
