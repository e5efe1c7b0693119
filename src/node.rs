//! Interactive chat node: wires the signaling channel, the registry and a
//! relay transport together and drives them from stdin.

use anyhow::{Context, Result};
use peerlink::app::Settings;
use peerlink::core::connection::{PeerEvent, RelayTransportFactory, Role};
use peerlink::core::signaling::{SignalSink, SignalingChannel, SignalingEvent};
use peerlink::utils::sos::SignalOfStop;
use peerlink::{ChunkTransport, PeerConnectionRegistry, TimerManager};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Close(String),
    Peers,
    Help,
    Quit,
    Say { peer: String, text: String },
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Command::Empty);
        }

        if let Some(rest) = line.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            let cmd = parts.next().unwrap_or_default();
            let arg = parts.next().map(str::to_string);
            return match (cmd, arg) {
                ("connect", Some(peer)) => Ok(Command::Connect(peer)),
                ("close", Some(peer)) => Ok(Command::Close(peer)),
                ("connect" | "close", None) => Err(format!("usage: /{cmd} <peer-id>")),
                ("peers", _) => Ok(Command::Peers),
                ("help", _) => Ok(Command::Help),
                ("quit" | "exit", _) => Ok(Command::Quit),
                _ => Err(format!("unknown command /{cmd}, try /help")),
            };
        }

        match line.split_once(':') {
            Some((peer, text)) if !peer.trim().is_empty() && !text.trim().is_empty() => Ok(Command::Say {
                peer: peer.trim().to_string(),
                text: text.trim().to_string(),
            }),
            _ => Err("expected `<peer-id>: <message>`".to_string()),
        }
    }
}

const HELP: &str = "commands: /connect <id>  /close <id>  /peers  /quit  |  <id>: <message>";

pub struct ChatNode {
    local_id: String,
    timers: TimerManager,
    signaling: SignalingChannel,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    registry: PeerConnectionRegistry,
}

impl ChatNode {
    /// Build the node and open the signaling connection.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let local_id = settings.args.peer_id_or_random();
        let url = settings.args.signaling_url().to_string();
        let timers = TimerManager::new();

        let (signaling, signaling_events) =
            SignalingChannel::new(&url, &local_id, &settings.transport, timers.clone());
        let sink: Arc<dyn SignalSink> = Arc::new(signaling.clone());
        let registry = PeerConnectionRegistry::new(
            &local_id,
            Arc::new(RelayTransportFactory::new(&local_id, sink.clone())),
            sink,
            ChunkTransport::from_config(&settings.transport),
        );

        signaling
            .connect()
            .await
            .with_context(|| format!("cannot reach signaling server at {url}"))?;
        info!(event = "node_started", peer_id = %local_id, url = %url, "Node started");

        Ok(Self {
            local_id,
            timers,
            signaling,
            signaling_events,
            registry,
        })
    }

    /// Run until `/quit`, end of input, Ctrl+C or a lost signaling server.
    pub async fn run(mut self, initial_peers: &[String], sos: SignalOfStop) -> Result<()> {
        println!("you are {}. {HELP}", self.local_id);
        for peer in initial_peers {
            self.open(peer);
        }

        let mut peer_events = self.registry.events().channel();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                Some(event) = self.signaling_events.recv() => {
                    if !self.on_signaling(event) {
                        break;
                    }
                }
                Some(event) = peer_events.recv() => print_peer_event(&event),
                line = lines.next_line() => {
                    let Some(line) = line.context("stdin read failed")? else {
                        break;
                    };
                    match Command::parse(&line) {
                        Ok(Command::Quit) => break,
                        Ok(cmd) => self.execute(cmd).await,
                        Err(msg) => println!("! {msg}"),
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Returns `false` once the signaling channel is gone for good.
    fn on_signaling(&self, event: SignalingEvent) -> bool {
        match &event {
            SignalingEvent::StatusChanged(true) => println!("* signaling online"),
            SignalingEvent::StatusChanged(false) => println!("* signaling offline, retrying"),
            SignalingEvent::ReconnectFailed { attempts } => {
                println!("! signaling server unreachable after {attempts} attempts");
                return false;
            }
            SignalingEvent::Message(_) => {}
        }
        self.registry.handle_signaling_event(&event);
        true
    }

    async fn execute(&self, cmd: Command) {
        match cmd {
            Command::Connect(peer) => self.open(&peer),
            Command::Close(peer) => {
                if !self.registry.close_connection(&peer) {
                    println!("! no connection to {peer}");
                }
            }
            Command::Peers => {
                let peers = self.registry.connected_peers();
                if peers.is_empty() {
                    println!("* no connected peers");
                } else {
                    println!("* connected: {}", peers.join(", "));
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Say { peer, text } => {
                let message = json!({
                    "type": "chat",
                    "from": self.local_id,
                    "text": text,
                    "sentAt": chrono::Utc::now().to_rfc3339(),
                });
                if let Err(e) = self.registry.send(&peer, &message).await {
                    println!("! {e}");
                }
            }
            Command::Quit | Command::Empty => {}
        }
    }

    fn open(&self, peer: &str) {
        match self.registry.get_connection(peer, Role::Initiator) {
            Ok(_) => println!("* connecting to {peer}"),
            Err(e) => {
                warn!(event = "open_failed", peer, error = %e, "Cannot open connection");
                println!("! {e}");
            }
        }
    }

    fn shutdown(&self) {
        let closed = self.registry.close_all();
        self.signaling.disconnect();
        self.timers.stop_all_tasks();
        info!(event = "node_stopped", closed, "Node stopped");
    }
}

fn print_peer_event(event: &PeerEvent) {
    match event {
        PeerEvent::ConnectionEstablished { peer_id } => println!("* connected to {peer_id}"),
        PeerEvent::ConnectionClosed { peer_id } => println!("* {peer_id} left"),
        PeerEvent::ConnectionFailed { peer_id, reason } => println!("! {peer_id} failed: {reason}"),
        PeerEvent::DataReceived { peer_id, message } => match chat_text(message) {
            Some(text) => println!("[{peer_id}] {text}"),
            None => println!("[{peer_id}] {message}"),
        },
        PeerEvent::RemoteStreamReceived { peer_id, stream } => {
            println!("* {peer_id} attached a {} stream", stream.kind)
        }
    }
}

fn chat_text(message: &Value) -> Option<&str> {
    if message.get("type").and_then(Value::as_str) != Some("chat") {
        return None;
    }
    message.get("text").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/connect bob"), Ok(Command::Connect("bob".into())));
        assert_eq!(Command::parse(" /close  bob "), Ok(Command::Close("bob".into())));
        assert_eq!(Command::parse("/peers"), Ok(Command::Peers));
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
        assert_eq!(Command::parse("   "), Ok(Command::Empty));
        assert!(Command::parse("/connect").is_err());
        assert!(Command::parse("/dance").is_err());
    }

    #[test]
    fn parses_messages() {
        assert_eq!(
            Command::parse("bob: see you at 10:30"),
            Ok(Command::Say {
                peer: "bob".into(),
                text: "see you at 10:30".into()
            })
        );
        assert!(Command::parse("no separator").is_err());
        assert!(Command::parse("bob:   ").is_err());
    }

    #[test]
    fn chat_text_only_for_chat_messages() {
        assert_eq!(chat_text(&json!({"type": "chat", "text": "hi"})), Some("hi"));
        assert_eq!(chat_text(&json!({"type": "typing"})), None);
    }
}
