//! Cross-worker KILL dispatch
//!
//! A KILL statement must reach the worker owning the target session. The
//! issuing session broadcasts a request to every worker's inbox; each worker
//! scans its own session table and signals matches. Signals are delivered on
//! the target worker's next loop turn.

use crate::classifier::{KillCommand, KillKind, KillTarget};

/// A kill request on its way to every worker
#[derive(Debug, Clone)]
pub struct KillRequest {
    pub command: KillCommand,
    /// Session that issued the KILL; it never kills itself for KILL USER
    pub issuer: u64,
}

/// Signal delivered to a matching session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSignal {
    pub kind: KillKind,
    /// HARD closes immediately; SOFT awaits the in-flight reply first
    pub hard: bool,
}

impl KillRequest {
    /// Whether this request targets the given session
    pub fn matches(&self, session_id: u64, username: &str) -> bool {
        match &self.command.target {
            KillTarget::Id(id) => *id == session_id,
            KillTarget::User(user) => {
                session_id != self.issuer && user.eq_ignore_ascii_case(username)
            }
        }
    }

    pub fn signal(&self) -> KillSignal {
        KillSignal {
            kind: self.command.kind,
            hard: self.command.hard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kill_id(id: u64) -> KillRequest {
        KillRequest {
            command: KillCommand {
                target: KillTarget::Id(id),
                kind: KillKind::Connection,
                hard: true,
            },
            issuer: 99,
        }
    }

    #[test]
    fn test_match_by_id() {
        let req = kill_id(7);
        assert!(req.matches(7, "anyone"));
        assert!(!req.matches(8, "anyone"));
    }

    #[test]
    fn test_match_by_user_skips_issuer() {
        let req = KillRequest {
            command: KillCommand {
                target: KillTarget::User("app".into()),
                kind: KillKind::Connection,
                hard: true,
            },
            issuer: 5,
        };
        assert!(req.matches(6, "app"));
        assert!(req.matches(7, "APP"));
        assert!(!req.matches(5, "app")); // issuer survives
        assert!(!req.matches(6, "other"));
    }

}
