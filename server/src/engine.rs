//! State engine and protocol glue
//!
//! Owns the single authoritative game state. Wire messages come in as
//! decoded JSON, get validated against the protocol, and turn into
//! reducer dispatches plus direct replies; state changes mark a pending
//! broadcast that the session driver sends after the throttle window.
//!
//! The engine is deliberately synchronous: time arrives as explicit
//! arguments and outgoing messages are returned to the caller, so the
//! whole JOIN / ACTION / disconnect lifecycle is testable without any
//! sockets or runtime. The async side lives in [`crate::session`].

use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde_json::Value;

use couchplay_shared::{
    derive_player_id, validate_secret, ClientMessage, ConnectionId, ErrorCode, PlayerId,
    ServerMessage, STALE_REMOVAL_DELAY,
};

use crate::reducer::{
    apply_action, is_reserved_action, Action, ClientAction, GameState, LifecycleEvent,
};
use crate::registry::{DisconnectOutcome, SessionRegistry};

type PlayerObserver = Box<dyn Fn(&str) + Send + Sync>;
type JoinObserver = Box<dyn Fn(&str, &str) + Send + Sync>;

/// The authoritative session state machine.
///
/// `S` is the embedder's game state, `R` its reduction function. All
/// mutation funnels through the wrapped reducer in [`crate::reducer`].
pub struct SessionEngine<S, R> {
    state: S,
    reduce: R,
    registry: SessionRegistry,
    stale_removal_delay: Duration,
    /// Wire form of the last dispatched action, echoed on the next
    /// broadcast.
    last_action: Option<Value>,
    /// A state change happened since the last broadcast was taken.
    dirty: bool,
    on_player_joined: Option<JoinObserver>,
    on_player_left: Option<PlayerObserver>,
    on_assets_loaded: Option<PlayerObserver>,
}

impl<S, R> SessionEngine<S, R>
where
    S: GameState,
    R: Fn(S, &ClientAction) -> S,
{
    pub fn new(initial_state: S, reduce: R) -> Self {
        Self {
            state: initial_state,
            reduce,
            registry: SessionRegistry::new(),
            stale_removal_delay: STALE_REMOVAL_DELAY,
            last_action: None,
            dirty: false,
            on_player_joined: None,
            on_player_left: None,
            on_assets_loaded: None,
        }
    }

    /// Overrides the 5-minute stale-player removal delay.
    pub fn with_stale_removal_delay(mut self, delay: Duration) -> Self {
        self.stale_removal_delay = delay;
        self
    }

    /// Observer fired after every JOIN (fresh or reconnecting), with the
    /// player ID and display name.
    pub fn on_player_joined(mut self, observer: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_player_joined = Some(Box::new(observer));
        self
    }

    /// Observer fired when a player genuinely disconnects (the race
    /// guard filters stale disconnects out first).
    pub fn on_player_left(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_player_left = Some(Box::new(observer));
        self
    }

    /// Observer fired when a controller reports its assets are loaded.
    /// Receives the player ID when the controller has joined already.
    pub fn on_assets_loaded(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_assets_loaded = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Runs an action through the wrapped reducer and schedules a
    /// broadcast. This is also the embedder's entry point for
    /// server-driven actions (including hydration).
    pub fn dispatch(&mut self, action: Action) {
        self.last_action = Some(action.to_wire());
        self.state = apply_action(&self.reduce, self.state.clone(), &action);
        self.dirty = true;
    }

    /// Validates and executes one wire message from a connection.
    /// Returns the direct replies to send; broadcasts are signalled via
    /// [`Self::broadcast_pending`] instead.
    pub fn handle_message(
        &mut self,
        conn: &ConnectionId,
        value: Value,
        now_ms: u64,
    ) -> Vec<(ConnectionId, ServerMessage)> {
        let message = match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => message,
            Err(e) => {
                debug!("Malformed message from {}: {}", conn, e);
                return vec![(
                    conn.clone(),
                    error_reply(ErrorCode::InvalidMessage, "Malformed message"),
                )];
            }
        };

        match message {
            ClientMessage::Join {
                name,
                avatar,
                secret,
            } => self.handle_join(conn, name, avatar, secret, now_ms),
            ClientMessage::Action(envelope) => {
                self.handle_action(conn, envelope.kind, envelope.payload, now_ms)
            }
            ClientMessage::Ping { id, timestamp } => vec![(
                conn.clone(),
                ServerMessage::Pong {
                    id,
                    orig_timestamp: timestamp,
                    server_time: now_ms,
                },
            )],
            ClientMessage::AssetsLoaded(true) => {
                if let Some(observer) = &self.on_assets_loaded {
                    if let Some(secret) = self.registry.secret_for(conn) {
                        observer(&derive_player_id(secret));
                    }
                }
                Vec::new()
            }
            ClientMessage::AssetsLoaded(false) => vec![(
                conn.clone(),
                error_reply(ErrorCode::InvalidMessage, "Malformed message"),
            )],
        }
    }

    fn handle_join(
        &mut self,
        conn: &ConnectionId,
        name: String,
        avatar: Option<String>,
        secret: String,
        now_ms: u64,
    ) -> Vec<(ConnectionId, ServerMessage)> {
        if !validate_secret(&secret) {
            return vec![(
                conn.clone(),
                error_reply(
                    ErrorCode::InvalidSecret,
                    "Secret must be at least 32 hex characters",
                ),
            )];
        }

        let player_id = derive_player_id(&secret);
        self.registry.adopt(&secret, conn);
        self.registry.cancel_cleanup(&player_id);

        let event = if self.state.players().contains_key(&player_id) {
            info!("Player {} reconnected on {}", player_id, conn);
            LifecycleEvent::PlayerReconnected {
                id: player_id.clone(),
            }
        } else {
            info!("Player {} ({}) joined on {}", player_id, name, conn);
            LifecycleEvent::PlayerJoined {
                id: player_id.clone(),
                name: name.clone(),
                avatar,
            }
        };
        self.dispatch(Action::Lifecycle(event));
        self.registry.queue_welcome(conn, &player_id);

        if let Some(observer) = &self.on_player_joined {
            observer(&player_id, &name);
        }

        self.flush_welcomes(now_ms)
    }

    fn handle_action(
        &mut self,
        conn: &ConnectionId,
        kind: String,
        payload: Option<Value>,
        now_ms: u64,
    ) -> Vec<(ConnectionId, ServerMessage)> {
        if is_reserved_action(&kind) {
            debug!("Rejecting reserved action {:?} from {}", kind, conn);
            return vec![(
                conn.clone(),
                error_reply(ErrorCode::ForbiddenAction, "Reserved action type"),
            )];
        }

        // A client that acts before joining has no resolvable player;
        // the action is still dispatched, with no attribution.
        let player_id: Option<PlayerId> = self.registry.secret_for(conn).map(derive_player_id);
        self.dispatch(Action::Client(ClientAction {
            kind,
            payload,
            player_id,
        }));

        self.flush_welcomes(now_ms)
    }

    /// Resolves a destroyed connection. Stale disconnects of sessions
    /// that were adopted by a newer connection change nothing.
    pub fn handle_disconnect(
        &mut self,
        conn: &ConnectionId,
        now: Instant,
        now_ms: u64,
    ) -> Vec<(ConnectionId, ServerMessage)> {
        match self.registry.release(conn) {
            DisconnectOutcome::Unknown => Vec::new(),
            DisconnectOutcome::Superseded => {
                debug!("Ignoring stale disconnect of superseded connection {}", conn);
                Vec::new()
            }
            DisconnectOutcome::Departed { player_id, secret } => {
                info!("Player {} disconnected", player_id);
                self.dispatch(Action::Lifecycle(LifecycleEvent::PlayerLeft {
                    id: player_id.clone(),
                }));
                if let Some(observer) = &self.on_player_left {
                    observer(&player_id);
                }
                self.registry
                    .schedule_cleanup(&player_id, &secret, now + self.stale_removal_delay);
                self.flush_welcomes(now_ms)
            }
        }
    }

    /// Sends the WELCOMEs owed after a state change. Running this after
    /// the dispatch is what guarantees a joining player sees themselves
    /// in their own first snapshot.
    fn flush_welcomes(&mut self, now_ms: u64) -> Vec<(ConnectionId, ServerMessage)> {
        let pending = self.registry.drain_welcomes();
        if pending.is_empty() {
            return Vec::new();
        }
        let snapshot = self.snapshot();
        pending
            .into_iter()
            .map(|(conn, player_id)| {
                (
                    conn,
                    ServerMessage::Welcome {
                        player_id,
                        state: snapshot.clone(),
                        server_time: now_ms,
                    },
                )
            })
            .collect()
    }

    /// Whether a broadcast should be (re)scheduled.
    pub fn broadcast_pending(&self) -> bool {
        self.dirty
    }

    /// Builds the STATE_UPDATE for the throttle timer and clears the
    /// pending flag. `None` when nothing changed since the last take.
    pub fn take_broadcast(&mut self, now_ms: u64) -> Option<ServerMessage> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(ServerMessage::StateUpdate {
            new_state: self.snapshot(),
            timestamp: now_ms,
            action: self.last_action.take(),
        })
    }

    /// Earliest pending stale-removal deadline, for the driver's timer.
    pub fn next_cleanup_deadline(&self) -> Option<Instant> {
        self.registry.next_cleanup_deadline()
    }

    /// Fires every stale-removal deadline that has passed. Returns
    /// whether any player was removed (and a broadcast is thus pending).
    pub fn expire_stale(&mut self, now: Instant) -> bool {
        let due = self.registry.expire_cleanups(now);
        let fired = !due.is_empty();
        for player_id in due {
            info!("Removing stale player {}", player_id);
            self.dispatch(Action::Lifecycle(LifecycleEvent::PlayerRemoved {
                id: player_id,
            }));
        }
        fired
    }

    /// Current state serialized for the wire.
    fn snapshot(&self) -> Value {
        match serde_json::to_value(&self.state) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize game state: {}", e);
                Value::Null
            }
        }
    }
}

fn error_reply(code: ErrorCode, message: &str) -> ServerMessage {
    ServerMessage::Error {
        code,
        message: message.to_string(),
    }
}
