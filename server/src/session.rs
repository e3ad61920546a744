//! Session driver: one task, all the state
//!
//! Composes the WebSocket server and the state engine. Network tasks
//! deliver events over a channel; this loop is their single consumer, so
//! every registry and state mutation is serialized on one logical thread.
//! The loop also owns the two engine-side timers: the resettable
//! broadcast throttle and the earliest stale-player removal deadline.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use couchplay_shared::{unix_millis, ConnectionId, ServerMessage, BROADCAST_THROTTLE};

use crate::engine::SessionEngine;
use crate::reducer::{ClientAction, GameState};
use crate::ws::{ServerEvent, WsConfig, WsServer};

/// Full configuration of a hosted session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws: WsConfig,
    /// Coalescing window for STATE_UPDATE broadcasts.
    pub broadcast_throttle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws: WsConfig::default(),
            broadcast_throttle: BROADCAST_THROTTLE,
        }
    }
}

/// A running game session: transport plus engine.
pub struct GameSession<S, R> {
    ws: WsServer,
    events: tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
    engine: SessionEngine<S, R>,
    throttle: Duration,
}

impl<S, R> GameSession<S, R>
where
    S: GameState,
    R: Fn(S, &ClientAction) -> S,
{
    pub fn new(engine: SessionEngine<S, R>, config: SessionConfig) -> Self {
        let (ws, events) = WsServer::new(config.ws);
        Self {
            ws,
            events,
            engine,
            throttle: config.broadcast_throttle,
        }
    }

    /// Binds the listener. Returns the bound port so embedders (and
    /// tests binding port 0) can tell controllers where to go.
    pub async fn start(&mut self) -> io::Result<u16> {
        self.ws.start().await
    }

    /// Drives the session until the transport goes away. All engine
    /// access happens here.
    pub async fn run(mut self) {
        let mut broadcast_at: Option<Instant> = None;

        loop {
            // select! needs concrete deadlines even for disabled arms.
            let far_off = Instant::now() + Duration::from_secs(3600);
            let broadcast_deadline = broadcast_at.unwrap_or(far_off);
            let cleanup_at = self.engine.next_cleanup_deadline();
            let cleanup_deadline = cleanup_at.unwrap_or(far_off);

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed, session loop exiting");
                        break;
                    };
                    match event {
                        ServerEvent::Listening { port } => {
                            info!("Session accepting controllers on port {}", port);
                        }
                        ServerEvent::Connection { conn } => {
                            debug!("Controller connected: {}", conn);
                        }
                        ServerEvent::Message { conn, value } => {
                            let replies =
                                self.engine.handle_message(&conn, value, unix_millis());
                            self.deliver(replies).await;
                            if self.engine.broadcast_pending() {
                                // Every change resets the window; only the
                                // latest snapshot matters.
                                broadcast_at = Some(Instant::now() + self.throttle);
                            }
                        }
                        ServerEvent::Disconnect { conn } => {
                            let replies = self.engine.handle_disconnect(
                                &conn,
                                Instant::now(),
                                unix_millis(),
                            );
                            self.deliver(replies).await;
                            if self.engine.broadcast_pending() {
                                broadcast_at = Some(Instant::now() + self.throttle);
                            }
                        }
                        ServerEvent::Error { context } => {
                            warn!("Transport error: {}", context);
                        }
                    }
                }

                _ = tokio::time::sleep_until(broadcast_deadline.into()),
                    if broadcast_at.is_some() =>
                {
                    broadcast_at = None;
                    if let Some(update) = self.engine.take_broadcast(unix_millis()) {
                        self.broadcast(&update).await;
                    }
                }

                _ = tokio::time::sleep_until(cleanup_deadline.into()),
                    if cleanup_at.is_some() =>
                {
                    if self.engine.expire_stale(Instant::now()) {
                        broadcast_at = Some(Instant::now() + self.throttle);
                    }
                }
            }
        }
    }

    async fn deliver(&self, replies: Vec<(ConnectionId, ServerMessage)>) {
        for (conn, message) in replies {
            match serde_json::to_value(&message) {
                Ok(value) => self.ws.send(&conn, &value).await,
                Err(e) => error!("Failed to serialize reply for {}: {}", conn, e),
            }
        }
    }

    async fn broadcast(&self, message: &ServerMessage) {
        match serde_json::to_value(message) {
            Ok(value) => self.ws.broadcast(&value, None).await,
            Err(e) => error!("Failed to serialize broadcast: {}", e),
        }
    }
}
