//! Session registry: secrets ↔ connections ↔ players
//!
//! This module handles the bookkeeping that makes player identity outlive
//! any single TCP connection:
//! - Which connection currently owns each session secret
//! - Which players have a pending removal deadline after disconnecting
//! - Which connections are owed, or have received, their WELCOME
//!
//! The registry is plain synchronous state. Time enters only as explicit
//! `Instant` arguments, so every lifecycle path is unit-testable without
//! a runtime.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use couchplay_shared::{derive_player_id, ConnectionId, PlayerId};

/// A scheduled permanent removal for a disconnected player.
#[derive(Debug, Clone)]
struct CleanupTimer {
    /// Kept so the session entry can be deleted when the timer fires.
    secret: String,
    deadline: Instant,
}

/// Result of resolving a disconnect against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The connection never joined; nothing to do.
    Unknown,
    /// The session was already adopted by a newer connection; the late
    /// disconnect must not touch the player.
    Superseded,
    /// The player genuinely left; schedule their cleanup.
    Departed {
        player_id: PlayerId,
        secret: String,
    },
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// secret → connection currently owning the session.
    sessions: HashMap<String, ConnectionId>,
    /// connection → secret, for disconnect resolution.
    reverse: HashMap<ConnectionId, String>,
    /// player → scheduled removal.
    cleanup: HashMap<PlayerId, CleanupTimer>,
    /// connection → player owed a WELCOME on the next state change.
    pending_welcome: HashMap<ConnectionId, PlayerId>,
    /// Connections that already received their WELCOME.
    welcomed: HashSet<ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points the session at a (new) connection. The latest JOIN always
    /// wins ownership; an older connection for the same secret becomes a
    /// stale entry that the disconnect race guard recognizes.
    pub fn adopt(&mut self, secret: &str, conn: &ConnectionId) {
        self.sessions.insert(secret.to_string(), conn.clone());
        self.reverse.insert(conn.clone(), secret.to_string());
    }

    /// The secret a connection joined with, if it has joined.
    pub fn secret_for(&self, conn: &ConnectionId) -> Option<&str> {
        self.reverse.get(conn).map(String::as_str)
    }

    /// Cancels a pending removal. Returns whether one existed.
    pub fn cancel_cleanup(&mut self, player_id: &str) -> bool {
        self.cleanup.remove(player_id).is_some()
    }

    /// Queues the WELCOME owed to a freshly joined connection. A re-JOIN
    /// on an already-welcomed connection moves it back to pending, so a
    /// connection is never in both sets at once.
    pub fn queue_welcome(&mut self, conn: &ConnectionId, player_id: &str) {
        self.welcomed.remove(conn);
        self.pending_welcome
            .insert(conn.clone(), player_id.to_string());
    }

    /// Drains the pending WELCOME queue, marking each connection as
    /// welcomed.
    pub fn drain_welcomes(&mut self) -> Vec<(ConnectionId, PlayerId)> {
        let drained: Vec<_> = self.pending_welcome.drain().collect();
        for (conn, _) in &drained {
            self.welcomed.insert(conn.clone());
        }
        drained
    }

    /// Resolves a closed connection. Applies the race guard: when the
    /// session has already been adopted by a newer connection, the stale
    /// disconnect is reported as [`DisconnectOutcome::Superseded`] and no
    /// state may change.
    pub fn release(&mut self, conn: &ConnectionId) -> DisconnectOutcome {
        self.welcomed.remove(conn);
        self.pending_welcome.remove(conn);

        let Some(secret) = self.reverse.remove(conn) else {
            return DisconnectOutcome::Unknown;
        };
        if self.sessions.get(&secret) != Some(conn) {
            return DisconnectOutcome::Superseded;
        }
        DisconnectOutcome::Departed {
            player_id: derive_player_id(&secret),
            secret,
        }
    }

    /// Schedules permanent removal of a departed player.
    pub fn schedule_cleanup(&mut self, player_id: &str, secret: &str, deadline: Instant) {
        self.cleanup.insert(
            player_id.to_string(),
            CleanupTimer {
                secret: secret.to_string(),
                deadline,
            },
        );
    }

    pub fn has_cleanup(&self, player_id: &str) -> bool {
        self.cleanup.contains_key(player_id)
    }

    /// Earliest scheduled removal, if any. The driver sleeps until this.
    pub fn next_cleanup_deadline(&self) -> Option<Instant> {
        self.cleanup.values().map(|t| t.deadline).min()
    }

    /// Fires every removal whose deadline has passed: the session entry
    /// is deleted and the affected player IDs are returned for the
    /// removal dispatch.
    pub fn expire_cleanups(&mut self, now: Instant) -> Vec<PlayerId> {
        let due: Vec<PlayerId> = self
            .cleanup
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(pid, _)| pid.clone())
            .collect();
        for pid in &due {
            if let Some(timer) = self.cleanup.remove(pid) {
                self.sessions.remove(&timer.secret);
            }
        }
        due
    }

    /// Whether this connection owes or already got a WELCOME (used by
    /// tests to check the disjointness invariant).
    #[cfg(test)]
    fn welcome_state(&self, conn: &ConnectionId) -> (bool, bool) {
        (
            self.pending_welcome.contains_key(conn),
            self.welcomed.contains(conn),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SECRET: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn conn(n: u32) -> ConnectionId {
        format!("conn-{}", n)
    }

    #[test]
    fn test_adopt_and_resolve() {
        let mut registry = SessionRegistry::new();
        registry.adopt(SECRET, &conn(1));
        assert_eq!(registry.secret_for(&conn(1)), Some(SECRET));
        assert_eq!(registry.secret_for(&conn(2)), None);
    }

    #[test]
    fn test_release_unknown_connection() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.release(&conn(9)), DisconnectOutcome::Unknown);
    }

    #[test]
    fn test_release_departs_current_owner() {
        let mut registry = SessionRegistry::new();
        registry.adopt(SECRET, &conn(1));
        match registry.release(&conn(1)) {
            DisconnectOutcome::Departed { player_id, secret } => {
                assert_eq!(player_id, "aaaaaaaaaaaaaaaa");
                assert_eq!(secret, SECRET);
            }
            other => panic!("expected departure, got {:?}", other),
        }
    }

    #[test]
    fn test_race_guard_on_superseded_connection() {
        let mut registry = SessionRegistry::new();
        registry.adopt(SECRET, &conn(1));
        // The same session is re-adopted by a newer connection before
        // the first connection's FIN arrives.
        registry.adopt(SECRET, &conn(2));
        assert_eq!(registry.release(&conn(1)), DisconnectOutcome::Superseded);
        // The newer connection still owns the session.
        assert_eq!(registry.secret_for(&conn(2)), Some(SECRET));
        match registry.release(&conn(2)) {
            DisconnectOutcome::Departed { .. } => {}
            other => panic!("expected departure, got {:?}", other),
        }
    }

    #[test]
    fn test_welcome_queue_disjoint_from_welcomed() {
        let mut registry = SessionRegistry::new();
        registry.queue_welcome(&conn(1), "aaaaaaaaaaaaaaaa");
        assert_eq!(registry.welcome_state(&conn(1)), (true, false));

        let drained = registry.drain_welcomes();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.welcome_state(&conn(1)), (false, true));

        // Re-JOIN on the same connection: moves back to pending, never
        // in both sets.
        registry.queue_welcome(&conn(1), "aaaaaaaaaaaaaaaa");
        assert_eq!(registry.welcome_state(&conn(1)), (true, false));
    }

    #[test]
    fn test_release_clears_welcome_tracking() {
        let mut registry = SessionRegistry::new();
        registry.adopt(SECRET, &conn(1));
        registry.queue_welcome(&conn(1), "aaaaaaaaaaaaaaaa");
        registry.release(&conn(1));
        assert_eq!(registry.welcome_state(&conn(1)), (false, false));
    }

    #[test]
    fn test_cleanup_schedule_and_expiry() {
        let mut registry = SessionRegistry::new();
        registry.adopt(SECRET, &conn(1));
        let now = Instant::now();

        let outcome = registry.release(&conn(1));
        let DisconnectOutcome::Departed { player_id, secret } = outcome else {
            panic!("expected departure");
        };
        registry.schedule_cleanup(&player_id, &secret, now + Duration::from_secs(300));

        assert!(registry.has_cleanup(&player_id));
        assert_eq!(registry.expire_cleanups(now), Vec::<PlayerId>::new());

        let fired = registry.expire_cleanups(now + Duration::from_secs(301));
        assert_eq!(fired, vec!["aaaaaaaaaaaaaaaa".to_string()]);
        assert!(!registry.has_cleanup(&player_id));
        // The session entry went with the timer: a fresh JOIN with the
        // same secret starts a brand new player lifecycle.
        assert_eq!(registry.secret_for(&conn(1)), None);
    }

    #[test]
    fn test_cancel_cleanup_on_rejoin() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.schedule_cleanup("aaaaaaaaaaaaaaaa", SECRET, now + Duration::from_secs(300));
        assert!(registry.cancel_cleanup("aaaaaaaaaaaaaaaa"));
        assert!(!registry.cancel_cleanup("aaaaaaaaaaaaaaaa"));
        assert_eq!(registry.next_cleanup_deadline(), None);
    }

    #[test]
    fn test_next_cleanup_deadline_is_earliest() {
        let mut registry = SessionRegistry::new();
        let now = Instant::now();
        registry.schedule_cleanup("p1", "a1", now + Duration::from_secs(50));
        registry.schedule_cleanup("p2", "a2", now + Duration::from_secs(10));
        assert_eq!(
            registry.next_cleanup_deadline(),
            Some(now + Duration::from_secs(10))
        );
    }
}
