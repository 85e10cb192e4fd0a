use std::io::{self, BufRead};
use std::net::IpAddr;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use duel_rtc::config::{ClientConfig, LinkConfig, RelayConfig};
use duel_rtc::game::{GameAction, MoveTroops, TurnState};
use duel_rtc::model::session::SessionId;
use duel_rtc::peer::Peer;
use duel_rtc::server::start_relay;
use duel_rtc::util;
use duel_rtc::RelayClient;

const TICK: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "duel-rtc", about = "Two-player turn sync over WebRTC with a relay fallback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay service
    Relay {
        #[arg(long, env = "DUEL_RELAY_BIND", default_value = "0.0.0.0:3000")]
        bind: String,
        #[arg(long, default_value_t = 20_000)]
        poll_wait_ms: u64,
        #[arg(long, default_value_t = 30)]
        liveness_secs: u64,
    },
    /// Create a room and wait for an opponent
    Host {
        /// Room name prefix; a timestamp is appended
        #[arg(long)]
        room: Option<String>,
        #[command(flatten)]
        peer: PeerArgs,
    },
    /// Join a room from its share link or id
    Join {
        link: String,
        #[command(flatten)]
        peer: PeerArgs,
    },
}

#[derive(Args, Debug)]
struct PeerArgs {
    #[arg(long, env = "DUEL_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay: String,
    /// Only use 127.0.0.1 for the direct link
    #[arg(long, env = "DUEL_LOOPBACK")]
    loopback: bool,
    /// Advertise this address instead of the detected one
    #[arg(long)]
    host_ip: Option<IpAddr>,
    /// Base of the printed share link
    #[arg(long, default_value = "http://localhost:3000/")]
    origin: String,
}

impl PeerArgs {
    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            loopback: self.loopback,
            host: self.host_ip,
        }
    }
}

fn main() -> anyhow::Result<()> {
    util::init_log();
    let cli = Cli::parse();

    match cli.command {
        Command::Relay {
            bind,
            poll_wait_ms,
            liveness_secs,
        } => {
            let config = RelayConfig {
                bind,
                poll_wait: Duration::from_millis(poll_wait_ms),
                liveness: Duration::from_secs(liveness_secs),
                ..Default::default()
            };
            let handle = start_relay(config).context("starting relay")?;
            println!("Relay running at {}", handle.url());
            handle.wait();
            Ok(())
        }
        Command::Host { room, peer } => {
            let mut session = connect(&peer)?;
            let id = session.host(room.as_deref())?;
            println!("Share this link: {}", id.share_link(&peer.origin));
            play(session)
        }
        Command::Join { link, peer } => {
            let mut session = connect(&peer)?;
            let id: SessionId = session.join(&link)?;
            println!("Joined {}", id);
            play(session)
        }
    }
}

fn connect(args: &PeerArgs) -> anyhow::Result<Peer<RelayClient, TurnState>> {
    let relay = RelayClient::connect(ClientConfig::new(args.relay.clone()))
        .with_context(|| format!("relay at {}", args.relay))?;
    Ok(Peer::new(relay, TurnState::new(), args.link_config()))
}

fn read_commands() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn parse_command(line: &str) -> anyhow::Result<Option<GameAction>> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("end") => Ok(None),
        Some("move") => {
            let (Some(from), Some(to), Some(count)) = (words.next(), words.next(), words.next())
            else {
                bail!("usage: move <from> <to> <count>");
            };
            Ok(Some(GameAction::MoveTroops(MoveTroops {
                from: from.into(),
                to: to.into(),
                count: count.parse().context("troop count")?,
            })))
        }
        Some("say") => {
            let text = line.trim_start().trim_start_matches("say").trim();
            if text.is_empty() {
                bail!("usage: say <text>");
            }
            Ok(Some(GameAction::chat(text)))
        }
        _ => bail!("commands: end | move <from> <to> <count> | say <text> | quit"),
    }
}

fn play(mut peer: Peer<RelayClient, TurnState>) -> anyhow::Result<()> {
    let status = peer.subscribe();
    let commands = read_commands();
    let mut printed = 0;

    println!("Commands: end | move <from> <to> <count> | say <text> | quit");

    loop {
        peer.tick();

        for update in status.try_iter() {
            println!("* {}", update);
        }

        let messages = &peer.game().messages;
        for message in &messages[printed..] {
            println!("{}", message);
        }
        printed = messages.len();

        for line in commands.try_iter() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "quit" {
                peer.leave();
                info!("Bye");
                return Ok(());
            }

            let action = match parse_command(line) {
                Ok(Some(action)) => action,
                Ok(None) => peer.game_mut().end_turn(),
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };

            match peer.broadcast(&action) {
                Ok(route) => info!("{:?} sent {:?}", action.kind(), route),
                Err(e) => warn!("{:?} not sent: {}", action.kind(), e),
            }
        }

        thread::sleep(TICK);
    }
}
