//! Wire protocol for host ↔ controller communication
//!
//! Every message is a JSON text frame shaped `{"type": ..., "payload": ...}`,
//! modeled here as adjacently tagged serde enums. Controllers send
//! [`ClientMessage`]; the host replies with [`ServerMessage`]. State
//! snapshots travel as opaque JSON values: the host serializes its game
//! state once per broadcast and the protocol layer never looks inside
//! beyond the `players` table contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable public identifier for a player, derived from their session
/// secret (see [`crate::identity::derive_player_id`]). Safe to broadcast.
pub type PlayerId = String;

/// Server-assigned identifier for a single TCP connection. Lives exactly
/// as long as the connection does.
pub type ConnectionId = String;

/// A player's entry in the state object's `players` mapping.
///
/// The engine owns the lifecycle fields (`connected`, insertion and
/// removal); `name` and `avatar` come from the JOIN payload and survive
/// reconnects untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_host: bool,
    pub connected: bool,
}

/// The inner shape of an ACTION payload: a game-defined type tag plus an
/// arbitrary payload the user reducer interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Messages a controller may send to the host.
///
/// Anything that fails to deserialize into one of these variants is a
/// malformed message and earns an `INVALID_MESSAGE` error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Join (or rejoin) the session under a client-generated secret.
    #[serde(rename = "JOIN")]
    Join {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        secret: String,
    },

    /// A game action for the user reducer. The type must not use the
    /// reserved `__…__` namespace.
    #[serde(rename = "ACTION")]
    Action(ActionEnvelope),

    /// Time-sync probe; answered immediately with a PONG, no state touch.
    #[serde(rename = "PING")]
    Ping { id: String, timestamp: f64 },

    /// Controller finished preloading its assets. Payload must be `true`.
    #[serde(rename = "ASSETS_LOADED")]
    AssetsLoaded(bool),
}

/// Messages the host sends to controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// First reply after a JOIN: the joining player's ID and a state
    /// snapshot that already contains them.
    #[serde(rename = "WELCOME", rename_all = "camelCase")]
    Welcome {
        player_id: PlayerId,
        state: Value,
        server_time: u64,
    },

    /// Throttled authoritative snapshot broadcast. `action` echoes the
    /// last dispatched action in wire form when one exists.
    #[serde(rename = "STATE_UPDATE", rename_all = "camelCase")]
    StateUpdate {
        new_state: Value,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<Value>,
    },

    /// Reply to a controller PING, carrying both timestamps the
    /// controller needs for its offset estimate.
    #[serde(rename = "PONG", rename_all = "camelCase")]
    Pong {
        id: String,
        orig_timestamp: f64,
        server_time: u64,
    },

    /// Reserved by the protocol. The current host conveys reconnection
    /// through a fresh WELCOME instead and never emits this.
    #[serde(rename = "RECONNECTED", rename_all = "camelCase")]
    Reconnected { player_id: PlayerId, state: Value },

    /// Rejection of a controller message; the connection stays open.
    #[serde(rename = "ERROR")]
    Error { code: ErrorCode, message: String },
}

/// Machine-readable rejection codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Wire structure did not match any known message shape.
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
    /// JOIN secret failed the format rule.
    #[serde(rename = "INVALID_SECRET")]
    InvalidSecret,
    /// ACTION used the reserved `__…__` type namespace.
    #[serde(rename = "FORBIDDEN_ACTION")]
    ForbiddenAction,
}

/// WebSocket close codes after which a controller must not auto-reconnect.
///
/// 1008 is policy violation, 1011 is server error; retrying either would
/// just repeat the failure.
pub const NO_RECONNECT_CLOSE_CODES: [u16; 2] = [1008, 1011];
