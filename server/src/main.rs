//! Demo host: a buzzer party game
//!
//! Runs a complete couchplay session with the smallest useful game: every
//! controller gets one big button, first buzz wins the round, RESET opens
//! the next one. Doubles as the reference for embedding the engine.

use std::collections::HashMap;
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};

use couchplay_server::{ClientAction, GameSession, GameState, SessionConfig, SessionEngine, WsConfig};
use couchplay_shared::{PlayerId, PlayerRecord, DEFAULT_WS_PORT};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket port to listen on
    #[clap(short, long, default_value_t = DEFAULT_WS_PORT)]
    port: u16,

    /// Seconds between keepalive pings (0 disables keepalive)
    #[clap(long, default_value = "30")]
    keepalive: u64,

    /// Seconds a disconnected player survives before removal
    #[clap(long, default_value = "300")]
    stale_delay: u64,
}

/// State of the buzzer game. `status` and `players` are the fields the
/// engine contract requires; the rest is game logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuzzerState {
    status: String,
    players: HashMap<PlayerId, PlayerRecord>,
    /// Who buzzed first this round, if anyone.
    winner: Option<PlayerId>,
    round: u32,
}

impl BuzzerState {
    fn new() -> Self {
        Self {
            status: "lobby".into(),
            players: HashMap::new(),
            winner: None,
            round: 1,
        }
    }
}

impl GameState for BuzzerState {
    fn players(&self) -> &HashMap<PlayerId, PlayerRecord> {
        &self.players
    }
    fn players_mut(&mut self) -> &mut HashMap<PlayerId, PlayerRecord> {
        &mut self.players
    }
}

/// The game's pure reducer: first BUZZ of a round locks in the winner,
/// RESET opens the next round.
fn reduce(mut state: BuzzerState, action: &ClientAction) -> BuzzerState {
    match action.kind.as_str() {
        "BUZZ" => {
            if state.winner.is_none() {
                if let Some(player_id) = &action.player_id {
                    state.winner = Some(player_id.clone());
                    state.status = "buzzed".into();
                }
            }
        }
        "RESET" => {
            state.winner = None;
            state.status = "lobby".into();
            state.round += 1;
        }
        _ => {}
    }
    state
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();

    let engine = SessionEngine::new(BuzzerState::new(), reduce)
        .with_stale_removal_delay(Duration::from_secs(args.stale_delay))
        .on_player_joined(|player_id, name| info!("{} is in as {}", name, player_id))
        .on_player_left(|player_id| info!("{} stepped away", player_id));

    let config = SessionConfig {
        ws: WsConfig {
            port: args.port,
            keepalive_interval: Duration::from_secs(args.keepalive),
            ..WsConfig::default()
        },
        ..SessionConfig::default()
    };

    let mut session = GameSession::new(engine, config);
    let port = session.start().await?;
    info!("Buzzer game hosted on ws://0.0.0.0:{}", port);

    session.run().await;
    Ok(())
}
