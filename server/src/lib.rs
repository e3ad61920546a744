//! # Couchplay Session Server
//!
//! The authoritative host of a couchplay game session. A television
//! device embeds this library, supplies an initial game state and a pure
//! reduction function, and phones on the same LAN connect as controllers
//! over a handcrafted WebSocket transport.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! One canonical state object lives on the host. Every mutation flows
//! through the embedder's reducer, wrapped so that framework lifecycle
//! events (join, leave, reconnect, removal, hydration) maintain the
//! player table automatically. Controllers only ever receive full
//! snapshots; there is no delta protocol to get out of sync.
//!
//! ### Connection Multiplexing
//! An arbitrary number of controllers connect over TCP. The transport
//! layer implements RFC 6455 itself: upgrade handshake, masked client
//! frames, multi-frame packets, control frames, keepalive pings, and a
//! hard frame-size limit.
//!
//! ### Durable Player Identity
//! Controllers hold a long-lived client-generated secret; the host
//! derives a stable public player ID from it. Page refreshes and flaky
//! Wi-Fi therefore reconnect into the same player record, and a player
//! only disappears after staying away for the stale-removal window.
//!
//! ## Module Organization
//!
//! - [`frame`]: RFC 6455 frame codec (pure)
//! - [`buffer`]: growing per-connection receive buffer
//! - [`handshake`]: HTTP upgrade parsing and the accept-key digest
//! - [`ws`]: the WebSocket server and its event channel
//! - [`registry`]: secret ↔ connection ↔ player bookkeeping
//! - [`reducer`]: the action model and the wrapped reducer
//! - [`engine`]: protocol validation and the authoritative state machine
//! - [`session`]: the single-threaded driver loop tying it all together
//!
//! ## Concurrency Model
//!
//! Network reads and writes run on per-connection tokio tasks, but they
//! only communicate with the rest of the system through an event
//! channel whose single consumer is the session driver. State, registry,
//! and timers are all owned by that one task — no locks around game
//! state, no reentrancy surprises in reducers.

pub mod buffer;
pub mod engine;
pub mod frame;
pub mod handshake;
pub mod reducer;
pub mod registry;
pub mod session;
pub mod ws;

pub use engine::SessionEngine;
pub use reducer::{Action, ClientAction, GameState, LifecycleEvent};
pub use session::{GameSession, SessionConfig};
pub use ws::{ServerEvent, WsConfig, WsServer};
