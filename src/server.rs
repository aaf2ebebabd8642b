//! Implements the inbound persona: accept RakNet connections, wrap each in
//! a server-role [`Session`] and drive it through spawn.
//!
//! The facade owns the post-login niceties a stock client expects — the
//! empty resource-pack exchange, StartGame and the spawn play status — and
//! surfaces everything else to the caller as events.

use crate::{
    crypto::keys::KeyPair,
    protocol::{
        catalog::{default_catalog, Catalog},
        compression::CompressionMethod,
        packet::{
            GamePacket, PacketName, PlayStatus, PlayStatusKind, ResourcePackClientResponse,
            ResourcePackResponse, ResourcePackStack, ResourcePacksInfo, StartGame,
        },
        GAME_VERSION, PROTOCOL_VERSION,
    },
    auth::Profile,
    session::{PacketFrame, Session, SessionConfig, SessionEvent},
    transport::{DatagramReceiver, MemoryListener},
};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::task;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub protocol_version: i32,
    pub compression_method: CompressionMethod,
    pub compression_threshold: u16,
    /// Reject self-signed (offline) login chains.
    pub require_trusted: bool,
    /// Reject logins whose `ServerAddress` payload field is not this
    /// listener's address. On by default; relax it only when clients
    /// reach this server through an address-rewriting frontend.
    pub verify_server_address: bool,
    /// Template for the StartGame sent to every player.
    pub start_game: StartGame,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            compression_method: CompressionMethod::Zlib,
            compression_threshold: 512,
            require_trusted: false,
            verify_server_address: true,
            start_game: StartGame {
                entity_unique_id: 1,
                runtime_entity_id: 1,
                player_gamemode: 0,
                position: (0.0, 64.0, 0.0),
                pitch: 0.0,
                yaw: 0.0,
                rest: Bytes::new(),
            },
        }
    }
}

/// Things a connected player's driver accepts from the embedding code.
#[derive(Debug)]
pub enum PlayerCommand {
    Send(GamePacket),
    SendRaw(Bytes),
    Disconnect(Option<String>),
}

/// Handle for talking back to one connected player.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    peer: SocketAddr,
    commands: flume::Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, packet: GamePacket) {
        self.commands.send(PlayerCommand::Send(packet)).ok();
    }

    pub fn send_raw(&self, frame: Bytes) {
        self.commands.send(PlayerCommand::SendRaw(frame)).ok();
    }

    pub fn disconnect(&self, reason: Option<String>) {
        self.commands.send(PlayerCommand::Disconnect(reason)).ok();
    }
}

#[derive(Debug)]
pub enum ServerEvent {
    /// A login chain verified; the player is about to finish its handshake.
    PlayerConnect {
        player: PlayerHandle,
        profile: Profile,
    },
    PlayerSpawn {
        peer: SocketAddr,
    },
    /// Post-login game traffic the facade did not consume.
    PlayerPacket {
        peer: SocketAddr,
        frame: PacketFrame,
    },
    PlayerDisconnect {
        peer: SocketAddr,
        reason: Option<String>,
    },
}

pub struct Server {
    listener: MemoryListener,
    options: ServerOptions,
}

/// Receiving side of a started server.
pub struct ServerHandle {
    events: flume::Receiver<ServerEvent>,
}

impl ServerHandle {
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.events.recv_async().await.ok()
    }

    /// Wraps an already-filtered event stream; embedders use this to
    /// interpose on events without losing the handle shape.
    pub fn from_events(events: flume::Receiver<ServerEvent>) -> Self {
        Self { events }
    }
}

impl Server {
    pub fn new(listener: MemoryListener, options: ServerOptions) -> Self {
        Self { listener, options }
    }

    /// Starts the accept loop. Each connection gets its own driver task.
    pub fn start(self) -> ServerHandle {
        let (events_tx, events_rx) = flume::unbounded();
        let Server { listener, options } = self;

        task::spawn(async move {
            while let Some(endpoint) = listener.accept().await {
                let peer = endpoint.peer();
                tracing::info!("Accepted connection from {peer}");
                let (sender, receiver) = endpoint.split();
                let config = SessionConfig {
                    protocol_version: options.protocol_version,
                    server_address: listener.address().to_string(),
                    compression_method: options.compression_method,
                    compression_threshold: options.compression_threshold,
                    require_trusted: options.require_trusted,
                    verify_server_address: options.verify_server_address,
                    ..SessionConfig::default()
                };
                let session = Session::new_server(sender, KeyPair::generate(), config);
                let events = events_tx.clone();
                let options = options.clone();
                task::spawn(async move {
                    drive_player(session, receiver, events, options).await;
                });
            }
        });

        ServerHandle { events: events_rx }
    }
}

async fn drive_player(
    mut session: Session,
    receiver: DatagramReceiver,
    events: flume::Sender<ServerEvent>,
    options: ServerOptions,
) {
    let peer = receiver.peer();
    let (commands_tx, commands_rx) = flume::unbounded();
    let catalog = default_catalog();

    loop {
        tokio::select! {
            datagram = receiver.recv() => {
                let Some(datagram) = datagram else {
                    session.disconnect(None);
                    events.send(ServerEvent::PlayerDisconnect { peer, reason: None }).ok();
                    break;
                };
                let mut session_events = Vec::new();
                if let Err(e) = session.on_datagram(&datagram, &mut session_events) {
                    tracing::warn!("Connection {peer} failed: {e}");
                    session.fail(&e);
                    events
                        .send(ServerEvent::PlayerDisconnect {
                            peer,
                            reason: Some(e.to_string()),
                        })
                        .ok();
                    break;
                }
                for event in session_events {
                    handle_session_event(
                        &mut session,
                        event,
                        peer,
                        &commands_tx,
                        &events,
                        &options,
                        &catalog,
                    );
                }
                if session.state() == crate::session::SessionState::Disconnected {
                    break;
                }
            }
            command = commands_rx.recv_async() => {
                match command {
                    Ok(PlayerCommand::Send(packet)) => {
                        if let Err(e) = session.send(&packet) {
                            tracing::warn!("Send to {peer} failed: {e}");
                        }
                    }
                    Ok(PlayerCommand::SendRaw(frame)) => {
                        if let Err(e) = session.send_raw_frames(&[&frame]) {
                            tracing::warn!("Send to {peer} failed: {e}");
                        }
                    }
                    Ok(PlayerCommand::Disconnect(reason)) => {
                        session.disconnect(reason.as_deref());
                        events.send(ServerEvent::PlayerDisconnect { peer, reason }).ok();
                        break;
                    }
                    Err(_) => unreachable!("a sender is held by this task"),
                }
            }
        }
    }
}

fn handle_session_event(
    session: &mut Session,
    event: SessionEvent,
    peer: SocketAddr,
    commands_tx: &flume::Sender<PlayerCommand>,
    events: &flume::Sender<ServerEvent>,
    options: &ServerOptions,
    catalog: &Catalog,
) {
    match event {
        SessionEvent::LoginReceived { profile, .. } => {
            events
                .send(ServerEvent::PlayerConnect {
                    player: PlayerHandle {
                        peer,
                        commands: commands_tx.clone(),
                    },
                    profile,
                })
                .ok();
        }
        SessionEvent::LoggedIn => {
            if let Err(e) = session.send(&GamePacket::ResourcePacksInfo(ResourcePacksInfo::empty()))
            {
                tracing::warn!("Resource pack advertisement to {peer} failed: {e}");
            }
        }
        SessionEvent::Spawned => {
            events.send(ServerEvent::PlayerSpawn { peer }).ok();
        }
        SessionEvent::Packet(frame) => {
            if !drive_pack_exchange(session, &frame, options, catalog) {
                events.send(ServerEvent::PlayerPacket { peer, frame }).ok();
            }
        }
        SessionEvent::Disconnected { reason } => {
            events
                .send(ServerEvent::PlayerDisconnect { peer, reason })
                .ok();
        }
        SessionEvent::EncryptionEnabled => {}
        // only client sessions surface StartGame
        SessionEvent::StartGame(_) => {}
    }
}

/// Walks a freshly logged-in client through the empty pack exchange and
/// into the world. Returns whether the packet was consumed.
fn drive_pack_exchange(
    session: &mut Session,
    frame: &PacketFrame,
    options: &ServerOptions,
    catalog: &Catalog,
) -> bool {
    match frame.name {
        Some(PacketName::ResourcePackClientResponse) => {
            let response = match catalog.deserialize(&frame.bytes) {
                Ok(GamePacket::ResourcePackClientResponse(ResourcePackClientResponse {
                    response,
                    ..
                })) => response,
                _ => return false,
            };
            let result = match response {
                ResourcePackResponse::HaveAllPacks => session.send(&GamePacket::ResourcePackStack(
                    ResourcePackStack::empty(GAME_VERSION),
                )),
                ResourcePackResponse::Completed => {
                    let result = session
                        .send(&GamePacket::StartGame(options.start_game.clone()));
                    session.mark_in_game();
                    result
                }
                ResourcePackResponse::Refused => {
                    session.disconnect(Some("disconnectionScreen.resourcePack"));
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!("Pack exchange failed: {e}");
            }
            true
        }
        Some(PacketName::RequestChunkRadius) => {
            if let Err(e) = session.send(&GamePacket::PlayStatus(PlayStatus {
                status: PlayStatusKind::PlayerSpawn,
            })) {
                tracing::warn!("Spawn status failed: {e}");
            }
            true
        }
        _ => false,
    }
}
