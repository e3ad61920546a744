//! Reducer wrapper and the action model
//!
//! Embedders supply a pure reduction function over their own game state.
//! The engine wraps it so the built-in lifecycle events — hydrate, player
//! joined / left / reconnected / removed — maintain the `players` table
//! automatically, while the user reducer only ever sees game actions.
//!
//! Internally the lifecycle events are typed variants; their
//! double-underscore wire names exist only at the protocol edge (the
//! reserved-namespace check on incoming actions, and the action echo on
//! broadcasts).

use std::collections::HashMap;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use couchplay_shared::{PlayerId, PlayerRecord};

/// Contract a game state must satisfy for the engine to manage it: it is
/// a serializable value exposing the `players` mapping. Everything else
/// in the state is game-specific and opaque to the engine.
pub trait GameState: Clone + Serialize + DeserializeOwned + Send + 'static {
    fn players(&self) -> &HashMap<PlayerId, PlayerRecord>;
    fn players_mut(&mut self) -> &mut HashMap<PlayerId, PlayerRecord>;
}

/// A game action as the user reducer receives it: the wire envelope plus
/// the submitter's resolved player ID (`None` when the client acted
/// before joining).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientAction {
    pub kind: String,
    pub payload: Option<Value>,
    pub player_id: Option<PlayerId>,
}

/// Framework-internal lifecycle events, handled by the wrapper itself.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Replace the state wholesale.
    Hydrate { state: Value },
    PlayerJoined {
        id: PlayerId,
        name: String,
        avatar: Option<String>,
    },
    PlayerLeft { id: PlayerId },
    PlayerReconnected { id: PlayerId },
    PlayerRemoved { id: PlayerId },
}

impl LifecycleEvent {
    /// The reserved wire name of this event.
    pub fn wire_type(&self) -> &'static str {
        match self {
            LifecycleEvent::Hydrate { .. } => "__HYDRATE__",
            LifecycleEvent::PlayerJoined { .. } => "__PLAYER_JOINED__",
            LifecycleEvent::PlayerLeft { .. } => "__PLAYER_LEFT__",
            LifecycleEvent::PlayerReconnected { .. } => "__PLAYER_RECONNECTED__",
            LifecycleEvent::PlayerRemoved { .. } => "__PLAYER_REMOVED__",
        }
    }
}

/// Everything the engine can dispatch into the wrapped reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Lifecycle(LifecycleEvent),
    Client(ClientAction),
}

impl Action {
    /// Wire form of the action, as echoed on STATE_UPDATE broadcasts.
    pub fn to_wire(&self) -> Value {
        match self {
            Action::Lifecycle(event) => {
                let payload = match event {
                    LifecycleEvent::Hydrate { state } => state.clone(),
                    LifecycleEvent::PlayerJoined { id, name, avatar } => json!({
                        "id": id,
                        "name": name,
                        "avatar": avatar,
                    }),
                    LifecycleEvent::PlayerLeft { id }
                    | LifecycleEvent::PlayerReconnected { id }
                    | LifecycleEvent::PlayerRemoved { id } => json!({ "id": id }),
                };
                json!({ "type": event.wire_type(), "payload": payload })
            }
            Action::Client(action) => json!({
                "type": action.kind,
                "payload": action.payload,
                "playerId": action.player_id,
            }),
        }
    }
}

/// Whether an incoming ACTION type trespasses on the framework's
/// reserved namespace.
pub fn is_reserved_action(kind: &str) -> bool {
    kind.starts_with("__")
}

/// The wrapped reducer: lifecycle events maintain the player table,
/// everything else is delegated to the user reducer. Pure — the only
/// state it touches is the one passed in.
pub fn apply_action<S, R>(reduce: &R, state: S, action: &Action) -> S
where
    S: GameState,
    R: Fn(S, &ClientAction) -> S,
{
    match action {
        Action::Lifecycle(event) => apply_lifecycle(state, event),
        Action::Client(client_action) => reduce(state, client_action),
    }
}

fn apply_lifecycle<S: GameState>(mut state: S, event: &LifecycleEvent) -> S {
    match event {
        LifecycleEvent::Hydrate { state: snapshot } => {
            match serde_json::from_value::<S>(snapshot.clone()) {
                Ok(hydrated) => hydrated,
                Err(e) => {
                    warn!("Ignoring hydrate with undecodable state: {}", e);
                    state
                }
            }
        }
        LifecycleEvent::PlayerJoined { id, name, avatar } => {
            state.players_mut().insert(
                id.clone(),
                PlayerRecord {
                    id: id.clone(),
                    name: name.clone(),
                    avatar: avatar.clone(),
                    is_host: false,
                    connected: true,
                },
            );
            state
        }
        LifecycleEvent::PlayerLeft { id } => {
            if let Some(player) = state.players_mut().get_mut(id) {
                player.connected = false;
            }
            state
        }
        LifecycleEvent::PlayerReconnected { id } => {
            if let Some(player) = state.players_mut().get_mut(id) {
                player.connected = true;
            }
            state
        }
        LifecycleEvent::PlayerRemoved { id } => {
            state.players_mut().remove(id);
            state
        }
    }
}
