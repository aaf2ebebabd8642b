//! Implements the outbound persona: originate a connection, authenticate,
//! and hand the caller a live handle once the player has spawned.

use crate::{
    auth::{self, IdentityProvider, LoginChain, Payload, Profile},
    crypto::{jwt, keys::KeyPair},
    error::SessionError,
    protocol::{
        packet::{GamePacket, StartGame},
        PROTOCOL_VERSION,
    },
    session::{PacketFrame, Session, SessionConfig, SessionEvent, SessionState},
    transport::{Connector, DatagramReceiver},
};
use anyhow::Context;
use bytes::Bytes;
use std::{net::SocketAddr, sync::Arc};
use tokio::task;

#[derive(Clone)]
pub struct ClientOptions {
    pub username: String,
    /// Local address reported to the transport.
    pub local_address: SocketAddr,
    pub protocol_version: i32,
    pub view_radius: i32,
    /// `None` logs in offline with a self-signed chain.
    pub identity_provider: Option<Arc<dyn IdentityProvider>>,
}

impl ClientOptions {
    pub fn offline(username: &str) -> Self {
        Self {
            username: username.to_owned(),
            local_address: "127.0.0.1:0".parse().expect("valid literal"),
            protocol_version: PROTOCOL_VERSION,
            view_radius: 10,
            identity_provider: None,
        }
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Packet(PacketFrame),
    Disconnected { reason: Option<String> },
}

/// A connected, spawned player.
pub struct Client {
    pub profile: Profile,
    pub start_game: StartGame,
    commands: flume::Sender<Command>,
    events: flume::Receiver<ClientEvent>,
}

#[derive(Debug)]
enum Command {
    Send(GamePacket),
    SendRaw(Bytes),
    Queue(GamePacket),
    Flush,
    Disconnect(Option<String>),
}

impl Client {
    /// Connects, authenticates and drives the session through the spawn
    /// sequence. Resolves once the player is in the world; the session
    /// keeps running on a background task afterwards.
    pub async fn connect(connector: &dyn Connector, options: ClientOptions) -> anyhow::Result<Client> {
        let keypair = KeyPair::generate();
        let destination = connector.destination().to_string();
        let payload = Payload::offline(&options.username, &destination);

        // Authentication may block on external I/O; it happens before the
        // transport is opened and buffers nothing.
        let chain = match &options.identity_provider {
            Some(provider) => {
                let provider = Arc::clone(provider);
                let keypair = keypair.clone();
                let payload = payload.clone();
                task::spawn_blocking(move || auth::create_online(&*provider, &keypair, &payload))
                    .await
                    .context("auth task panicked")??
            }
            None => auth::create_offline(&keypair, &options.username, &payload)?,
        };
        let profile = profile_from_chain(&chain)
            .unwrap_or_else(|| Profile {
                display_name: options.username.clone(),
                identity: auth::offline_identity(&options.username),
                xuid: "0".to_owned(),
            });

        let endpoint = connector.connect(options.local_address)?;
        let (sender, receiver) = endpoint.split();
        let config = SessionConfig {
            protocol_version: options.protocol_version,
            server_address: destination,
            view_radius: options.view_radius,
            ..SessionConfig::default()
        };
        let mut session = Session::new_client(sender, keypair, chain, config);
        session.start()?;

        let (start_game, early_packets) = drive_until_spawned(&mut session, &receiver).await?;

        let (commands_tx, commands_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        // game packets that raced the spawn sequence are not lost
        for frame in early_packets {
            events_tx.send(ClientEvent::Packet(frame)).ok();
        }
        task::spawn(async move {
            pump(session, receiver, commands_rx, events_tx).await;
        });

        Ok(Client {
            profile,
            start_game,
            commands: commands_tx,
            events: events_rx,
        })
    }

    pub fn send(&self, packet: GamePacket) {
        self.commands.send(Command::Send(packet)).ok();
    }

    pub fn send_raw(&self, frame: Bytes) {
        self.commands.send(Command::SendRaw(frame)).ok();
    }

    /// Adds to the pending batch; [`Client::flush`] ships it as one batch.
    pub fn queue(&self, packet: GamePacket) {
        self.commands.send(Command::Queue(packet)).ok();
    }

    pub fn flush(&self) {
        self.commands.send(Command::Flush).ok();
    }

    pub fn disconnect(&self, reason: Option<String>) {
        self.commands.send(Command::Disconnect(reason)).ok();
    }

    pub async fn next_event(&self) -> Option<ClientEvent> {
        self.events.recv_async().await.ok()
    }
}

/// Pulls the profile out of the deepest chain token. Offline chains are
/// self-issued so the claims are trusted as our own.
fn profile_from_chain(chain: &LoginChain) -> Option<Profile> {
    let token = chain.identity_chain.last()?;
    let (_, claims) = jwt::decode_unverified(token).ok()?;
    let extra = claims.get("extraData")?;
    Some(Profile {
        display_name: extra.get("displayName")?.as_str()?.to_owned(),
        identity: extra
            .get("identity")?
            .as_str()
            .and_then(|s| uuid::Uuid::parse_str(s).ok())?,
        xuid: extra
            .get("XUID")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("0")
            .to_owned(),
    })
}

async fn drive_until_spawned(
    session: &mut Session,
    receiver: &DatagramReceiver,
) -> anyhow::Result<(StartGame, Vec<PacketFrame>)> {
    let mut start_game = None;
    let mut early_packets = Vec::new();
    loop {
        let datagram = receiver
            .recv()
            .await
            .context("connection closed during login")?;
        let mut events = Vec::new();
        if let Err(e) = session.on_datagram(&datagram, &mut events) {
            session.fail(&e);
            return Err(anyhow::Error::from(e).context("login failed"));
        }
        for event in events {
            match event {
                SessionEvent::StartGame(data) => start_game = Some(*data),
                SessionEvent::Packet(frame) => early_packets.push(frame),
                SessionEvent::Spawned => {
                    let start_game = start_game.context("spawned without StartGame")?;
                    return Ok((start_game, early_packets));
                }
                SessionEvent::Disconnected { reason } => {
                    anyhow::bail!(
                        "disconnected during login: {}",
                        reason.unwrap_or_else(|| "no reason given".to_owned())
                    );
                }
                _ => {}
            }
        }
    }
}

async fn pump(
    mut session: Session,
    receiver: DatagramReceiver,
    commands: flume::Receiver<Command>,
    events: flume::Sender<ClientEvent>,
) {
    loop {
        tokio::select! {
            datagram = receiver.recv() => {
                let Some(datagram) = datagram else {
                    session.disconnect(None);
                    events.send(ClientEvent::Disconnected { reason: None }).ok();
                    break;
                };
                let mut session_events = Vec::new();
                if let Err(e) = session.on_datagram(&datagram, &mut session_events) {
                    tracing::warn!("Session failed: {e}");
                    session.fail(&e);
                    events
                        .send(ClientEvent::Disconnected { reason: Some(e.to_string()) })
                        .ok();
                    break;
                }
                let mut closed = false;
                for event in session_events {
                    match event {
                        SessionEvent::Packet(frame) => {
                            events.send(ClientEvent::Packet(frame)).ok();
                        }
                        SessionEvent::Disconnected { reason } => {
                            events.send(ClientEvent::Disconnected { reason }).ok();
                            closed = true;
                        }
                        _ => {}
                    }
                }
                if closed || session.state() == SessionState::Disconnected {
                    break;
                }
            }
            command = commands.recv_async() => {
                let Ok(command) = command else {
                    // handle dropped: keep the session alive for the peer
                    session.disconnect(None);
                    break;
                };
                if let Err(e) = apply(&mut session, command, &events) {
                    tracing::warn!("Command failed: {e}");
                }
                if session.state() == SessionState::Disconnected {
                    break;
                }
            }
        }
    }
}

fn apply(
    session: &mut Session,
    command: Command,
    events: &flume::Sender<ClientEvent>,
) -> Result<(), SessionError> {
    match command {
        Command::Send(packet) => session.send(&packet),
        Command::SendRaw(frame) => session.send_raw_frames(&[&frame]),
        Command::Queue(packet) => {
            session.queue(&packet);
            Ok(())
        }
        Command::Flush => session.flush(),
        Command::Disconnect(reason) => {
            session.disconnect(reason.as_deref());
            events
                .send(ClientEvent::Disconnected { reason: None })
                .ok();
            Ok(())
        }
    }
}
