//! Probe controller: a terminal stand-in for a phone
//!
//! Speaks the controller side of the protocol over a hand-rolled
//! WebSocket client: joins with a persistent secret, buzzes on demand,
//! keeps a clock-offset estimate running, and reconnects with backoff
//! when the host drops it. Useful for poking at a live session without a
//! browser.

use std::io::{self, Write as _};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use log::{info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use couchplay_server::buffer::ConnBuffer;
use couchplay_server::frame::{decode_frame, Opcode};
use couchplay_shared::backoff::{default_reconnect_delay, should_reconnect};
use couchplay_shared::timesync::TimeSync;
use couchplay_shared::{unix_millis, DEFAULT_WS_PORT, MAX_FRAME_SIZE, MAX_RETRIES, SYNC_INTERVAL};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Host running the session
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// WebSocket port of the session
    #[clap(short, long, default_value_t = DEFAULT_WS_PORT)]
    port: u16,

    /// Display name to join with
    #[clap(short, long, default_value = "probe")]
    name: String,

    /// Send a BUZZ this many milliseconds after joining (0 = never)
    #[clap(long, default_value = "0")]
    buzz_after: u64,
}

/// Builds a masked client frame; clients must mask, servers must not.
fn client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let key_source = Uuid::new_v4();
    let key: [u8; 4] = key_source.as_bytes()[..4].try_into().unwrap_or([7, 7, 7, 7]);
    let mut out = vec![0x80 | opcode.as_u8()];
    if payload.len() <= 125 {
        out.push(0x80 | payload.len() as u8);
    } else if payload.len() <= 65_535 {
        out.push(0x80 | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(&key);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    out
}

fn text(value: &Value) -> Vec<u8> {
    client_frame(Opcode::Text, value.to_string().as_bytes())
}

/// One connection lifetime: handshake, join, then pump frames until the
/// host closes or the socket fails.
async fn run_once(args: &Args, secret: &str, sync: &mut TimeSync) -> io::Result<()> {
    let mut stream = TcpStream::connect((args.host.as_str(), args.port)).await?;

    let ws_key = STANDARD.encode(Uuid::new_v4().as_bytes());
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        args.host, args.port, ws_key
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await?;
        response.push(byte[0]);
        if response.len() > 8192 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "handshake response too long"));
        }
    }
    if !response.starts_with(b"HTTP/1.1 101") {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "upgrade refused"));
    }
    info!("Connected to ws://{}:{}", args.host, args.port);

    let join = json!({
        "type": "JOIN",
        "payload": {"name": args.name, "secret": secret}
    });
    stream.write_all(&text(&join)).await?;

    let mut buffer = ConnBuffer::new();
    let mut chunk = [0u8; 4096];
    let mut sync_ticker = tokio::time::interval(SYNC_INTERVAL);
    let buzz_at = (args.buzz_after > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_millis(args.buzz_after));
    let mut buzzed = false;

    loop {
        let buzz_deadline =
            buzz_at.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            result = stream.read(&mut chunk) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                buffer.append(&chunk[..n]);
                if !drain_frames(&mut buffer, &mut stream, sync).await? {
                    return Ok(());
                }
            }

            _ = sync_ticker.tick() => {
                let id = Uuid::new_v4().to_string();
                let now = unix_millis() as f64;
                sync.record_ping(&id, now);
                let ping = json!({"type": "PING", "payload": {"id": id, "timestamp": now}});
                stream.write_all(&text(&ping)).await?;
            }

            _ = tokio::time::sleep_until(buzz_deadline), if buzz_at.is_some() && !buzzed => {
                buzzed = true;
                let buzz = json!({"type": "ACTION", "payload": {"type": "BUZZ"}});
                stream.write_all(&text(&buzz)).await?;
                info!("BUZZ sent");
            }
        }
    }
}

/// Processes buffered server frames. Returns `false` on a close frame.
async fn drain_frames(
    buffer: &mut ConnBuffer,
    stream: &mut TcpStream,
    sync: &mut TimeSync,
) -> io::Result<bool> {
    let mut offset = 0;
    let mut open = true;
    loop {
        match decode_frame(&buffer.as_slice()[offset..], MAX_FRAME_SIZE) {
            Ok(None) => break,
            Err(e) => {
                buffer.compact(buffer.len());
                return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
            }
            Ok(Some(frame)) => {
                offset += frame.consumed;
                match frame.opcode {
                    Opcode::Text => {
                        if let Ok(value) = serde_json::from_slice::<Value>(&frame.payload) {
                            report(&value, sync);
                        }
                    }
                    Opcode::Ping => {
                        stream
                            .write_all(&client_frame(Opcode::Pong, &frame.payload))
                            .await?;
                    }
                    Opcode::Close => {
                        open = false;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    buffer.compact(offset);
    Ok(open)
}

fn report(message: &Value, sync: &mut TimeSync) {
    match message["type"].as_str() {
        Some("WELCOME") => {
            println!(
                "joined as {} (server time {})",
                message["payload"]["playerId"], message["payload"]["serverTime"]
            );
        }
        Some("STATE_UPDATE") => {
            println!("state: {}", message["payload"]["newState"]);
        }
        Some("PONG") => {
            let payload = &message["payload"];
            if let (Some(id), Some(server_time)) =
                (payload["id"].as_str(), payload["serverTime"].as_f64())
            {
                if let Some(offset) = sync.handle_pong(id, server_time, unix_millis() as f64) {
                    println!("clock offset: {:+.1} ms", offset);
                }
            }
        }
        Some("ERROR") => {
            println!("host rejected us: {}", message["payload"]);
        }
        _ => {}
    }
    let _ = io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    // The secret outlives connections; that is the whole point.
    let secret = Uuid::new_v4().to_string();
    let mut sync = TimeSync::default();

    let mut attempt = 0;
    loop {
        match run_once(&args, &secret, &mut sync).await {
            Ok(()) => {
                info!("Connection closed by host");
                return Ok(());
            }
            Err(e) => {
                if !should_reconnect(None, attempt, MAX_RETRIES) {
                    warn!("Giving up after {} attempts: {}", attempt, e);
                    return Err(e.into());
                }
                let delay = default_reconnect_delay(attempt);
                warn!("Connection lost ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
