//! # Couchplay Shared Library
//!
//! Shared contracts between the couchplay game host and its phone
//! controllers. The host (a television device) runs the authoritative
//! session server; controllers are browsers on the same LAN speaking a
//! JSON-over-WebSocket protocol. This crate holds everything both sides
//! must agree on:
//!
//! - **Wire protocol** (`protocol`): the complete message vocabulary in
//!   both directions, as adjacently tagged serde enums, plus the player
//!   record that lives inside every broadcast state snapshot.
//! - **Identity** (`identity`): session-secret validation and the
//!   deterministic derivation of public player IDs, which is what makes
//!   reconnection after a page refresh possible.
//! - **Time sync** (`timesync`): the controller-side clock-offset
//!   estimator driven by the host's PONG replies.
//! - **Reconnect backoff** (`backoff`): the controller's exponential
//!   retry schedule and the close codes that suppress it.
//!
//! ## Design Philosophy
//!
//! The protocol is deliberately small: plain JSON objects with a `type`
//! string and a `payload`, full state snapshots rather than deltas, and a
//! single authoritative host per session. Controllers carry a long-lived
//! client-generated secret; everything public is derived from it so the
//! secret itself never crosses the wire in a broadcast.
//!
//! All tunable protocol constants live at the crate root so embedders and
//! controllers read the same defaults.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod backoff;
pub mod identity;
pub mod protocol;
pub mod timesync;

pub use identity::{derive_player_id, validate_secret};
pub use protocol::{
    ActionEnvelope, ClientMessage, ConnectionId, ErrorCode, PlayerId, PlayerRecord, ServerMessage,
};

/// Default port of the static HTTP server that ships controller assets.
///
/// The HTTP server itself is outside this crate; the constant exists so
/// the WebSocket default below can be expressed relative to it.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default WebSocket port: HTTP port + 2.
///
/// The +2 offset sidesteps 8081, which the bundler ecosystem customarily
/// claims for itself.
pub const DEFAULT_WS_PORT: u16 = DEFAULT_HTTP_PORT + 2;

/// Maximum accepted WebSocket frame payload in bytes (1 MiB).
///
/// Frames declaring a larger payload are a transport-fatal error: the
/// connection is destroyed before any payload byte is read.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Interval between host-initiated keepalive pings.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Grace window after the keepalive interval before a silent connection
/// is forcefully destroyed.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a disconnected player's record survives before permanent
/// removal. A rejoin with the same secret inside this window resumes the
/// existing record.
pub const STALE_REMOVAL_DELAY: Duration = Duration::from_secs(5 * 60);

/// Coalescing window for state broadcasts (~30 Hz).
///
/// Fast games can reduce many times per frame; only the latest snapshot
/// matters, so at most one STATE_UPDATE leaves per window.
pub const BROADCAST_THROTTLE: Duration = Duration::from_millis(33);

/// Controller-side interval between time-sync pings.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on time-sync pings awaiting a PONG before the oldest is
/// dropped.
pub const MAX_PENDING_PINGS: usize = 50;

/// Maximum controller reconnect attempts before giving up.
pub const MAX_RETRIES: u32 = 5;

/// First reconnect delay; doubles each attempt.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling on the reconnect delay.
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Used for every `serverTime`/`timestamp` field on the wire.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_port_offset() {
        assert_eq!(DEFAULT_WS_PORT, 8082);
        assert_eq!(DEFAULT_WS_PORT, DEFAULT_HTTP_PORT + 2);
    }

    #[test]
    fn test_unix_millis_advances() {
        let a = unix_millis();
        std::thread::sleep(Duration::from_millis(2));
        let b = unix_millis();
        assert!(b > a);
    }
}
