//! Handcrafted WebSocket server
//!
//! Accepts TCP connections, performs the HTTP upgrade handshake, drives
//! the frame codec over a per-connection receive buffer, and reports
//! everything interesting upward as [`ServerEvent`]s on a channel. Each
//! connection gets a read task and a write task; the layer above (the
//! session driver) is the single consumer of the event channel, which is
//! what keeps all game-state mutation on one logical thread.
//!
//! Keepalive: the server pings every connection on an interval and
//! destroys any that has not answered within the interval plus a grace
//! window.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use couchplay_shared::{
    ConnectionId, DEFAULT_WS_PORT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, MAX_FRAME_SIZE,
};

use crate::buffer::ConnBuffer;
use crate::frame::{self, Opcode};
use crate::handshake;

/// Transport-level tunables.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Port to bind on `0.0.0.0`. Use 0 to let the OS pick (tests).
    pub port: u16,
    /// Frames declaring a larger payload destroy the connection.
    pub max_frame_size: usize,
    /// Interval between server pings. Zero disables keepalive.
    pub keepalive_interval: Duration,
    /// Grace window past the interval before a silent peer is dropped.
    pub keepalive_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_WS_PORT,
            max_frame_size: MAX_FRAME_SIZE,
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
        }
    }
}

/// Events delivered to the layer above, in per-connection arrival order.
#[derive(Debug)]
pub enum ServerEvent {
    /// The listener is bound and accepting.
    Listening { port: u16 },
    /// A connection completed its handshake.
    Connection { conn: ConnectionId },
    /// A text frame parsed as JSON.
    Message { conn: ConnectionId, value: Value },
    /// A connection was destroyed, for any reason.
    Disconnect { conn: ConnectionId },
    /// A non-fatal server-side problem worth surfacing to the embedder.
    Error { context: String },
}

struct ConnectionHandle {
    /// Pre-encoded frames queued for the write task.
    writer: UnboundedSender<Vec<u8>>,
    /// Wakes the read task so the connection tears down promptly.
    kill: Arc<Notify>,
    /// Updated whenever a PONG frame arrives; read by keepalive.
    last_pong: Instant,
}

type ConnectionTable = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>;

/// The WebSocket endpoint of a game session.
pub struct WsServer {
    config: WsConfig,
    connections: ConnectionTable,
    events_tx: UnboundedSender<ServerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl WsServer {
    /// Creates the server and the event channel its owner will consume.
    pub fn new(config: WsConfig) -> (Self, UnboundedReceiver<ServerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                connections: Arc::new(Mutex::new(HashMap::new())),
                events_tx,
                tasks: Vec::new(),
            },
            events_rx,
        )
    }

    /// Binds the TCP listener and spawns the accept loop and keepalive
    /// task. Returns the actually bound port. A bind failure is returned
    /// to the embedder; nothing panics.
    pub async fn start(&mut self) -> io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let port = listener.local_addr()?.port();
        info!("WebSocket server listening on 0.0.0.0:{}", port);
        let _ = self.events_tx.send(ServerEvent::Listening { port });

        let connections = Arc::clone(&self.connections);
        let events_tx = self.events_tx.clone();
        let config = self.config.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted TCP connection from {}", peer);
                        tokio::spawn(run_connection(
                            stream,
                            Arc::clone(&connections),
                            events_tx.clone(),
                            config.clone(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        }));

        if self.config.keepalive_interval > Duration::ZERO {
            let connections = Arc::clone(&self.connections);
            let events_tx = self.events_tx.clone();
            let interval = self.config.keepalive_interval;
            let timeout = self.config.keepalive_timeout;
            self.tasks.push(tokio::spawn(run_keepalive(
                connections,
                events_tx,
                interval,
                timeout,
            )));
        }

        Ok(port)
    }

    /// Sends one JSON value to one connection as a text frame. Failures
    /// are logged and emitted as [`ServerEvent::Error`], never returned:
    /// a broken controller must not take the game loop down with it.
    pub async fn send(&self, conn: &ConnectionId, value: &Value) {
        let bytes = frame::encode_text_frame(&value.to_string());
        let table = self.connections.lock().await;
        match table.get(conn) {
            Some(handle) => {
                if handle.writer.send(bytes).is_err() {
                    warn!("Failed to queue message for connection {}", conn);
                    let _ = self.events_tx.send(ServerEvent::Error {
                        context: format!("send to {} failed", conn),
                    });
                }
            }
            None => debug!("Dropping message for unknown connection {}", conn),
        }
    }

    /// Serializes the value once and writes the identical frame to every
    /// connection except `exclude`. One broken recipient never aborts
    /// the rest.
    pub async fn broadcast(&self, value: &Value, exclude: Option<&ConnectionId>) {
        let bytes = frame::encode_text_frame(&value.to_string());
        let table = self.connections.lock().await;
        for (id, handle) in table.iter() {
            if Some(id) == exclude {
                continue;
            }
            if handle.writer.send(bytes.clone()).is_err() {
                warn!("Failed to queue broadcast for connection {}", id);
            }
        }
    }

    /// Number of handshaken connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stops the accept loop and keepalive, writes a close frame to
    /// every connection, and destroys them all.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let mut table = self.connections.lock().await;
        for (id, handle) in table.drain() {
            debug!("Closing connection {}", id);
            let _ = handle.writer.send(frame::close_frame());
            handle.kill.notify_one();
        }
        info!("WebSocket server stopped");
    }
}

/// Owns one connection from accept to teardown: handshake, then the
/// frame loop. Runs on its own task; everything it learns goes out the
/// event channel.
async fn run_connection(
    stream: TcpStream,
    connections: ConnectionTable,
    events_tx: UnboundedSender<ServerEvent>,
    config: WsConfig,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buffer = ConnBuffer::new();
    let mut chunk = [0u8; 4096];

    // Handshake phase: accumulate until the header terminator shows up,
    // then answer inline. The write task only exists after upgrade.
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("Read error during handshake: {}", e);
                return;
            }
        };
        buffer.append(&chunk[..n]);

        if let Some(header_len) = handshake::find_header_end(buffer.as_slice()) {
            let request = String::from_utf8_lossy(&buffer.as_slice()[..header_len]).into_owned();
            match handshake::upgrade_response(&request) {
                Ok(response) => {
                    if let Err(e) = write_half.write_all(response.as_bytes()).await {
                        debug!("Failed to write handshake response: {}", e);
                        return;
                    }
                    // Compact by byte length: frames may already trail
                    // the header in the same packet.
                    buffer.compact(header_len);
                    break;
                }
                Err(e) => {
                    warn!("Rejecting connection: {}", e);
                    return;
                }
            }
        }
    }

    let conn_id: ConnectionId = Uuid::new_v4().to_string();
    let kill = Arc::new(Notify::new());
    let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    {
        let mut table = connections.lock().await;
        table.insert(
            conn_id.clone(),
            ConnectionHandle {
                writer: writer_tx.clone(),
                kill: Arc::clone(&kill),
                last_pong: Instant::now(),
            },
        );
    }
    tokio::spawn(run_writer(write_half, writer_rx, conn_id.clone(), Arc::clone(&kill)));
    info!("Connection {} established", conn_id);
    let _ = events_tx.send(ServerEvent::Connection {
        conn: conn_id.clone(),
    });

    loop {
        // Drain whatever is buffered first; the handshake packet may
        // have carried frames.
        if !process_buffered_frames(
            &conn_id,
            &mut buffer,
            &writer_tx,
            &connections,
            &events_tx,
            &config,
        )
        .await
        {
            break;
        }

        tokio::select! {
            _ = kill.notified() => break,
            result = read_half.read(&mut chunk) => match result {
                Ok(0) => break,
                Ok(n) => buffer.append(&chunk[..n]),
                Err(e) => {
                    debug!("Read error on {}: {}", conn_id, e);
                    break;
                }
            },
        }
    }

    // Whoever removes the handle owns the disconnect event; keepalive
    // expiry and stop() remove it themselves before notifying us.
    let removed = connections.lock().await.remove(&conn_id).is_some();
    if removed {
        info!("Connection {} closed", conn_id);
        let _ = events_tx.send(ServerEvent::Disconnect { conn: conn_id });
    }
}

/// Decodes every complete frame currently buffered and dispatches by
/// opcode. Returns `false` when the connection must be destroyed.
async fn process_buffered_frames(
    conn_id: &ConnectionId,
    buffer: &mut ConnBuffer,
    writer: &UnboundedSender<Vec<u8>>,
    connections: &ConnectionTable,
    events_tx: &UnboundedSender<ServerEvent>,
    config: &WsConfig,
) -> bool {
    let mut offset = 0;
    let mut alive = true;

    loop {
        match frame::decode_frame(&buffer.as_slice()[offset..], config.max_frame_size) {
            Ok(None) => break,
            Err(e) => {
                warn!("Destroying connection {}: {}", conn_id, e);
                alive = false;
                break;
            }
            Ok(Some(f)) => {
                offset += f.consumed;
                match f.opcode {
                    Opcode::Text => match serde_json::from_slice::<Value>(&f.payload) {
                        Ok(value) => {
                            let _ = events_tx.send(ServerEvent::Message {
                                conn: conn_id.clone(),
                                value,
                            });
                        }
                        // Transport-transient: this frame only, the
                        // connection survives.
                        Err(e) => debug!("Ignoring unparseable text frame on {}: {}", conn_id, e),
                    },
                    Opcode::Close => {
                        let _ = writer.send(frame::close_frame());
                        alive = false;
                        break;
                    }
                    Opcode::Ping => {
                        let _ = writer.send(frame::encode_frame(Opcode::Pong, &f.payload));
                    }
                    Opcode::Pong => {
                        if let Some(handle) = connections.lock().await.get_mut(conn_id) {
                            handle.last_pong = Instant::now();
                        }
                    }
                    Opcode::Binary | Opcode::Continuation | Opcode::Other(_) => {
                        debug!("Discarding {:?} frame on {}", f.opcode, conn_id);
                    }
                }
            }
        }
    }

    buffer.compact(offset);
    alive
}

/// Write task: drains queued frames onto the socket. A write error wakes
/// the read task so the whole connection tears down.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: UnboundedReceiver<Vec<u8>>,
    conn_id: ConnectionId,
    kill: Arc<Notify>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            debug!("Write error on {}: {}", conn_id, e);
            kill.notify_one();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Keepalive task: every interval, destroy connections whose last PONG
/// is older than interval + timeout, ping the rest.
async fn run_keepalive(
    connections: ConnectionTable,
    events_tx: UnboundedSender<ServerEvent>,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // interval() fires immediately; swallow that tick so fresh
    // connections are not pinged at time zero.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut expired = Vec::new();
        {
            let mut table = connections.lock().await;
            let now = Instant::now();
            table.retain(|id, handle| {
                if now.duration_since(handle.last_pong) > interval + timeout {
                    handle.kill.notify_one();
                    expired.push(id.clone());
                    false
                } else {
                    let _ = handle.writer.send(frame::encode_frame(Opcode::Ping, &[]));
                    true
                }
            });
        }
        for id in expired {
            warn!("Connection {} missed keepalive window, destroying", id);
            let _ = events_tx.send(ServerEvent::Disconnect { conn: id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> WsConfig {
        WsConfig {
            port: 0,
            keepalive_interval: Duration::ZERO,
            ..WsConfig::default()
        }
    }

    /// Masks a text frame the way a client must.
    fn client_text_frame(text: &str) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let payload = text.as_bytes();
        let mut out = vec![0x81];
        assert!(payload.len() <= 125, "test helper handles short frames only");
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    async fn handshaken_client(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(
                b"GET / HTTP/1.1\r\nHost: localhost\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();
        // Read the 101 response (ends with a blank line).
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        while !collected.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            collected.push(byte[0]);
        }
        assert!(collected.starts_with(b"HTTP/1.1 101"));
        stream
    }

    #[tokio::test]
    async fn test_handshake_then_message_event() {
        let (mut server, mut events) = WsServer::new(quiet_config());
        let port = server.start().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ServerEvent::Listening { .. })
        ));

        let mut client = handshaken_client(port).await;
        let conn = match events.recv().await {
            Some(ServerEvent::Connection { conn }) => conn,
            other => panic!("expected connection event, got {:?}", other),
        };

        client
            .write_all(&client_text_frame(r#"{"type":"PING","payload":{"id":"a","timestamp":1}}"#))
            .await
            .unwrap();

        match events.recv().await {
            Some(ServerEvent::Message { conn: from, value }) => {
                assert_eq!(from, conn);
                assert_eq!(value["type"], "PING");
            }
            other => panic!("expected message event, got {:?}", other),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_without_key_is_rejected() {
        let (mut server, mut events) = WsServer::new(quiet_config());
        let port = server.start().await.unwrap();
        let _ = events.recv().await; // Listening

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        // The server destroys the socket without upgrading.
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.connection_count().await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_connection_open() {
        let (mut server, mut events) = WsServer::new(quiet_config());
        let port = server.start().await.unwrap();
        let _ = events.recv().await; // Listening

        let mut client = handshaken_client(port).await;
        let _ = events.recv().await; // Connection

        client
            .write_all(&client_text_frame("this is not json"))
            .await
            .unwrap();
        client
            .write_all(&client_text_frame(r#"{"ok":true}"#))
            .await
            .unwrap();

        // Only the valid frame becomes an event; the connection survived
        // the bad one.
        match events.recv().await {
            Some(ServerEvent::Message { value, .. }) => assert_eq!(value["ok"], true),
            other => panic!("expected message event, got {:?}", other),
        }
        assert_eq!(server.connection_count().await, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_harmless() {
        let (mut server, _events) = WsServer::new(quiet_config());
        let _ = server.start().await.unwrap();
        server
            .send(&"no-such-connection".to_string(), &serde_json::json!({"x": 1}))
            .await;
        server.stop().await;
    }
}
