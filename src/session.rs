//! The per-connection state machine.
//!
//! A session owns its framing, compression and cipher state and drives the
//! login sequence for one peer. It is single-threaded: the driver feeds it
//! datagrams one at a time and reacts to the events each batch produced.
//! Packets the state machine does not consume surface as raw
//! [`PacketFrame`]s so pass-through paths (the bridge) keep byte identity.

use crate::{
    auth::{self, LoginChain, Payload, Profile},
    crypto::{
        encryptor::{derive_secret_hash, Encryptor, HANDSHAKE_SALT},
        jwt::{self, SignOptions},
        keys::{self, KeyPair},
    },
    dispatcher::Dispatcher,
    error::{AuthError, Fatality, SessionError, TransportError},
    protocol::{
        catalog::{default_catalog, Catalog},
        compression::{CompressionMethod, Compressor},
        framer,
        packet::{
            ClientToServerHandshake, Disconnect, GamePacket, Login, NetworkSettings, PacketName,
            PlayStatus, PlayStatusKind, RequestChunkRadius, RequestNetworkSettings,
            ResourcePackClientResponse, ResourcePackResponse, ServerToClientHandshake,
            ServerboundLoadingScreen, SetLocalPlayerAsInitialized, StartGame,
        },
        GAME_PACKET_HEADER, PROTOCOL_VERSION,
    },
    transport::DatagramSender,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;

/// Which side of the connection this session plays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Login progress. Ordered so gates can compare against milestones.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitNetworkSettings,
    AwaitLogin,
    AwaitHandshake,
    Encrypted,
    LoggedIn,
    InGame,
    Spawned,
}

/// Per-session knobs. The server-role fields (compression choice,
/// trust requirements) are ignored by client sessions and vice versa.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol_version: i32,
    /// `host:port` this connection is advertised as; bound into the login
    /// payload's `ServerAddress`.
    pub server_address: String,
    pub compression_method: CompressionMethod,
    pub compression_threshold: u16,
    /// Reject self-signed chains.
    pub require_trusted: bool,
    /// Reject logins whose `ServerAddress` is not `server_address`.
    /// On by default: a payload addressed elsewhere is the invariant real
    /// servers enforce. Turn off only behind address-rewriting frontends.
    pub verify_server_address: bool,
    pub view_radius: i32,
    /// Stop automatic handling (resource packs, play-status responses)
    /// once logged in; everything past that point surfaces raw. The
    /// bridge sets this on its upstream session.
    pub cancel_past_login: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            server_address: String::new(),
            compression_method: CompressionMethod::Zlib,
            compression_threshold: 512,
            require_trusted: false,
            verify_server_address: true,
            view_radius: 10,
            cancel_past_login: false,
        }
    }
}

/// One sub-packet surfaced to the driver, undecoded.
#[derive(Debug, Clone)]
pub struct PacketFrame {
    pub id: u32,
    pub name: Option<PacketName>,
    /// Header varint included.
    pub bytes: Bytes,
}

/// What a batch of inbound data caused.
#[derive(Debug)]
pub enum SessionEvent {
    /// Server role: a login chain verified successfully.
    LoginReceived { profile: Profile, verified: bool },
    EncryptionEnabled,
    LoggedIn,
    StartGame(Box<StartGame>),
    Spawned,
    /// A packet the state machine did not consume.
    Packet(PacketFrame),
    Disconnected { reason: Option<String> },
}

pub struct Session {
    role: Role,
    state: SessionState,
    config: SessionConfig,
    catalog: Arc<Catalog>,
    dispatcher: Dispatcher,
    keypair: KeyPair,
    /// Client role: the chains sent in Login.
    login_chain: Option<LoginChain>,
    compressor: Option<Compressor>,
    encryptor: Option<Encryptor>,
    sender: Option<DatagramSender>,
    queued: Vec<Vec<u8>>,
    profile: Option<Profile>,
    /// Server role: the client payload from the user chain.
    peer_payload: Option<Payload>,
    runtime_entity_id: u64,
    packets_sent: u64,
    packets_received: u64,
}

impl Session {
    /// Builds the outbound persona. Call [`Session::start`] to begin the
    /// handshake.
    pub fn new_client(
        sender: DatagramSender,
        keypair: KeyPair,
        login_chain: LoginChain,
        config: SessionConfig,
    ) -> Self {
        Self::new(Role::Client, sender, keypair, Some(login_chain), config)
    }

    /// Builds the inbound persona; it waits for RequestNetworkSettings.
    pub fn new_server(sender: DatagramSender, keypair: KeyPair, config: SessionConfig) -> Self {
        let mut session = Self::new(Role::Server, sender, keypair, None, config);
        session.state = SessionState::AwaitNetworkSettings;
        session
    }

    fn new(
        role: Role,
        sender: DatagramSender,
        keypair: KeyPair,
        login_chain: Option<LoginChain>,
        config: SessionConfig,
    ) -> Self {
        Self {
            role,
            state: SessionState::Connecting,
            config,
            catalog: default_catalog(),
            dispatcher: Dispatcher::new(),
            keypair,
            login_chain,
            compressor: None,
            encryptor: None,
            sender: Some(sender),
            queued: Vec::new(),
            profile: None,
            peer_payload: None,
            runtime_entity_id: 0,
            packets_sent: 0,
            packets_received: 0,
        }
    }

    /// Replaces the catalog, e.g. with one carrying forgiving decoders.
    pub fn set_catalog(&mut self, catalog: Arc<Catalog>) {
        self.catalog = catalog;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<std::net::SocketAddr> {
        self.sender.as_ref().map(DatagramSender::peer)
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn peer_payload(&self) -> Option<&Payload> {
        self.peer_payload.as_ref()
    }

    pub fn runtime_entity_id(&self) -> u64 {
        self.runtime_entity_id
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Client role: kicks off the handshake.
    pub fn start(&mut self) -> Result<(), SessionError> {
        debug_assert_eq!(self.role, Role::Client);
        self.send(&GamePacket::RequestNetworkSettings(RequestNetworkSettings {
            protocol_version: self.config.protocol_version,
        }))?;
        self.state = SessionState::AwaitNetworkSettings;
        Ok(())
    }

    /// Serializes and sends one packet as its own batch.
    pub fn send(&mut self, packet: &GamePacket) -> Result<(), SessionError> {
        let frame = Catalog::serialize(packet);
        self.send_raw_frames(&[&frame])
    }

    /// Sends already-serialized sub-packets (header varint included) as
    /// one batch, byte-for-byte.
    pub fn send_raw_frames(&mut self, frames: &[&[u8]]) -> Result<(), SessionError> {
        let framed = framer::frame(frames.iter().copied());
        self.send_framed(framed)
    }

    /// Adds a packet to the pending batch; [`Session::flush`] sends it.
    pub fn queue(&mut self, packet: &GamePacket) {
        self.queued.push(Catalog::serialize(packet));
    }

    /// Adds an already-serialized sub-packet to the pending batch.
    pub fn queue_raw(&mut self, frame: &[u8]) {
        self.queued.push(frame.to_vec());
    }

    /// Sends every queued sub-packet as a single batch.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        if self.queued.is_empty() {
            return Ok(());
        }
        let queued = std::mem::take(&mut self.queued);
        let framed = framer::frame(queued.iter().map(Vec::as_slice));
        self.send_framed(framed)
    }

    fn send_framed(&mut self, framed: Vec<u8>) -> Result<(), SessionError> {
        let mut batch = Vec::with_capacity(framed.len() + 16);
        batch.push(GAME_PACKET_HEADER);
        match (&mut self.encryptor, &self.compressor) {
            (Some(encryptor), Some(compressor)) => {
                let bare = compressor.compress_bare(&framed)?;
                batch.extend(encryptor.encrypt(&bare));
            }
            (Some(encryptor), None) => batch.extend(encryptor.encrypt(&framed)),
            (None, Some(compressor)) => batch.extend(compressor.compress_prefixed(&framed)?),
            (None, None) => batch.extend(framed),
        }

        let sender = self.sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(Bytes::from(batch))?;
        self.packets_sent += 1;
        Ok(())
    }

    /// Feeds one encapsulated datagram through decrypt → inflate →
    /// unframe → per-packet processing. Errors returned here are fatal;
    /// per-packet problems are logged and swallowed.
    pub fn on_datagram(
        &mut self,
        datagram: &[u8],
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        let Some((&leader, body)) = datagram.split_first() else {
            return Ok(());
        };
        if leader != GAME_PACKET_HEADER {
            tracing::debug!("Dropping non-game datagram with leader {leader:#04x}");
            return Ok(());
        }

        let framed = match (&mut self.encryptor, &self.compressor) {
            (Some(encryptor), Some(compressor)) => {
                let bare = encryptor.decrypt(body)?;
                compressor.decompress_bare(&bare)?
            }
            (Some(encryptor), None) => encryptor.decrypt(body)?,
            (None, Some(compressor)) => compressor.decompress_prefixed(body)?,
            (None, None) => body.to_vec(),
        };

        for frame in framer::unframe(&framed) {
            let frame = match frame {
                Ok(frame) => frame,
                // A bad length prefix makes the rest of the batch
                // unreadable, but only the batch: drop it and carry on.
                Err(e) => {
                    tracing::warn!("Dropping malformed batch remainder: {e}");
                    break;
                }
            };
            self.process_frame(frame, events)?;
            if self.state == SessionState::Disconnected {
                break;
            }
        }
        Ok(())
    }

    fn process_frame(
        &mut self,
        frame: &[u8],
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        self.packets_received += 1;
        let id = match Catalog::peek_id(frame) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Dropping sub-packet with unreadable header: {e}");
                return Ok(());
            }
        };
        let name = PacketName::from_id(id);

        if let Some(name) = name {
            if self.handle_handshake(name, frame, events)? {
                return Ok(());
            }
        }

        // Nothing but the handshake may flow before encryption is up.
        if self.state < SessionState::Encrypted {
            return Err(SessionError::Protocol(format!(
                "packet {id:#04x} received in state {:?}",
                self.state
            )));
        }

        let mut bytes = Bytes::copy_from_slice(frame);
        if self.dispatcher.has_listeners(name) {
            match self.catalog.deserialize(frame) {
                Ok(mut packet) => {
                    let signal = self.dispatcher.emit(&mut packet);
                    if signal.cancelled {
                        return Ok(());
                    }
                    if signal.modified {
                        bytes = Bytes::from(Catalog::serialize(&packet));
                    }
                }
                // Per-packet failure: observers miss it, pass-through
                // still gets the original bytes.
                Err(e) => tracing::warn!("Undecodable packet {id:#04x}: {e}"),
            }
        }
        events.push(SessionEvent::Packet(PacketFrame { id, name, bytes }));
        Ok(())
    }

    /// Runs the state machine for one handshake-relevant packet. Returns
    /// whether the packet was consumed.
    fn handle_handshake(
        &mut self,
        name: PacketName,
        frame: &[u8],
        events: &mut Vec<SessionEvent>,
    ) -> Result<bool, SessionError> {
        use PacketName as N;

        // Disconnect is honored in any state, on both roles.
        if name == N::Disconnect {
            let reason = match self.catalog.deserialize(frame) {
                Ok(GamePacket::Disconnect(disconnect)) if !disconnect.hide_message => {
                    Some(disconnect.message)
                }
                _ => None,
            };
            events.push(SessionEvent::Disconnected { reason });
            self.teardown();
            return Ok(true);
        }

        // A bridge-owned upstream stops sequencing once logged in; later
        // packets are forwarded verbatim by the owner.
        if self.config.cancel_past_login && self.state >= SessionState::LoggedIn {
            return Ok(false);
        }

        match (self.role, name) {
            (Role::Client, N::NetworkSettings) => {
                self.expect_state(SessionState::AwaitNetworkSettings, name)?;
                let settings = match self.decode(frame) {
                    Some(GamePacket::NetworkSettings(settings)) => settings,
                    _ => return Ok(true),
                };
                self.enable_compression(&settings)?;
                let chain = self
                    .login_chain
                    .as_ref()
                    .expect("client sessions carry a login chain");
                let login = GamePacket::Login(Login {
                    protocol_version: self.config.protocol_version,
                    chain_json: chain.chain_json(),
                    user_jwt: chain.user_chain.clone(),
                });
                self.send(&login)?;
                self.state = SessionState::AwaitHandshake;
                Ok(true)
            }

            (Role::Client, N::ServerToClientHandshake) => {
                self.expect_state(SessionState::AwaitHandshake, name)?;
                let token = match self.decode(frame) {
                    Some(GamePacket::ServerToClientHandshake(ServerToClientHandshake {
                        token,
                    })) => token,
                    _ => return Ok(true),
                };
                self.complete_client_handshake(&token)?;
                events.push(SessionEvent::EncryptionEnabled);
                self.send(&GamePacket::ClientToServerHandshake(ClientToServerHandshake))?;
                self.state = SessionState::Encrypted;
                Ok(true)
            }

            (Role::Client, N::PlayStatus) => {
                let status = match self.decode(frame) {
                    Some(GamePacket::PlayStatus(PlayStatus { status })) => status,
                    _ => return Ok(true),
                };
                match status {
                    PlayStatusKind::LoginSuccess => {
                        self.expect_state(SessionState::Encrypted, name)?;
                        self.state = SessionState::LoggedIn;
                        events.push(SessionEvent::LoggedIn);
                    }
                    PlayStatusKind::PlayerSpawn => {
                        self.expect_state(SessionState::InGame, name)?;
                        self.send(&GamePacket::SetLocalPlayerAsInitialized(
                            SetLocalPlayerAsInitialized {
                                runtime_entity_id: self.runtime_entity_id,
                            },
                        ))?;
                        self.send(&GamePacket::ServerboundLoadingScreen(
                            ServerboundLoadingScreen::end(),
                        ))?;
                        self.state = SessionState::Spawned;
                        events.push(SessionEvent::Spawned);
                    }
                    failed => {
                        events.push(SessionEvent::Disconnected {
                            reason: Some(format!("play status {failed:?}")),
                        });
                        self.teardown();
                    }
                }
                Ok(true)
            }

            (Role::Client, N::ResourcePacksInfo) => {
                self.expect_state(SessionState::LoggedIn, name)?;
                self.send(&GamePacket::ResourcePackClientResponse(
                    ResourcePackClientResponse::new(ResourcePackResponse::HaveAllPacks),
                ))?;
                Ok(true)
            }

            (Role::Client, N::ResourcePackStack) => {
                self.expect_state(SessionState::LoggedIn, name)?;
                self.send(&GamePacket::ResourcePackClientResponse(
                    ResourcePackClientResponse::new(ResourcePackResponse::Completed),
                ))?;
                Ok(true)
            }

            (Role::Client, N::StartGame) => {
                self.expect_state(SessionState::LoggedIn, name)?;
                let start_game = match self.decode(frame) {
                    Some(GamePacket::StartGame(start_game)) => start_game,
                    _ => return Ok(true),
                };
                self.runtime_entity_id = start_game.runtime_entity_id;
                self.send(&GamePacket::RequestChunkRadius(RequestChunkRadius {
                    radius: self.config.view_radius,
                    max_radius: 32,
                }))?;
                self.state = SessionState::InGame;
                events.push(SessionEvent::StartGame(Box::new(start_game)));
                Ok(true)
            }

            (Role::Server, N::RequestNetworkSettings) => {
                self.expect_state(SessionState::AwaitNetworkSettings, name)?;
                let request = match self.decode(frame) {
                    Some(GamePacket::RequestNetworkSettings(request)) => request,
                    _ => return Ok(true),
                };
                if request.protocol_version != self.config.protocol_version {
                    let status = if request.protocol_version < self.config.protocol_version {
                        PlayStatusKind::FailedClient
                    } else {
                        PlayStatusKind::FailedServer
                    };
                    self.send(&GamePacket::PlayStatus(PlayStatus { status }))?;
                    events.push(SessionEvent::Disconnected {
                        reason: Some("protocol version mismatch".to_owned()),
                    });
                    self.teardown();
                    return Ok(true);
                }
                let settings = NetworkSettings {
                    compression_threshold: self.config.compression_threshold,
                    compression_algorithm: self.config.compression_method.to_settings(),
                    client_throttle: false,
                    throttle_threshold: 0,
                    throttle_scalar: 0.0,
                };
                // The response itself is uncompressed; compression starts
                // with the next outgoing batch on both sides.
                self.send(&GamePacket::NetworkSettings(settings.clone()))?;
                self.enable_compression(&settings)?;
                self.state = SessionState::AwaitLogin;
                Ok(true)
            }

            (Role::Server, N::Login) => {
                self.expect_state(SessionState::AwaitLogin, name)?;
                let login = match self.decode(frame) {
                    Some(GamePacket::Login(login)) => login,
                    _ => return Ok(true),
                };
                let chain = LoginChain::parse_chain_json(&login.chain_json, &login.user_jwt)?;
                let verified = auth::verify_login(&chain, self.config.require_trusted)?;
                if self.config.verify_server_address
                    && verified.payload.server_address != self.config.server_address
                {
                    return Err(AuthError::ServerAddressMismatch {
                        presented: verified.payload.server_address.clone(),
                        expected: self.config.server_address.clone(),
                    }
                    .into());
                }

                events.push(SessionEvent::LoginReceived {
                    profile: verified.profile.clone(),
                    verified: verified.verified,
                });
                self.profile = Some(verified.profile);
                self.peer_payload = Some(verified.payload);
                self.complete_server_handshake(&verified.identity_public_key)?;
                events.push(SessionEvent::EncryptionEnabled);
                self.state = SessionState::AwaitHandshake;
                Ok(true)
            }

            (Role::Server, N::ClientToServerHandshake) => {
                self.expect_state(SessionState::AwaitHandshake, name)?;
                self.state = SessionState::LoggedIn;
                self.send(&GamePacket::PlayStatus(PlayStatus {
                    status: PlayStatusKind::LoginSuccess,
                }))?;
                events.push(SessionEvent::LoggedIn);
                Ok(true)
            }

            (Role::Server, N::SetLocalPlayerAsInitialized) => {
                if self.state >= SessionState::InGame {
                    self.state = SessionState::Spawned;
                    events.push(SessionEvent::Spawned);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }

            // Receiving the peer's own handshake packets back is a
            // sequencing violation.
            (Role::Client, N::RequestNetworkSettings | N::Login | N::ClientToServerHandshake)
            | (Role::Server, N::NetworkSettings | N::ServerToClientHandshake | N::PlayStatus) => {
                Err(SessionError::Protocol(format!(
                    "{} is not valid toward a {:?} session",
                    name.as_ref(),
                    self.role
                )))
            }

            _ => Ok(false),
        }
    }

    /// Marks the server session as in-game; called by the facade when it
    /// sends StartGame.
    pub fn mark_in_game(&mut self) {
        if self.role == Role::Server && self.state == SessionState::LoggedIn {
            self.state = SessionState::InGame;
        }
    }

    /// Deserialize failures are per-packet even for handshake packets:
    /// the packet is logged and dropped, the state machine stays put.
    fn decode(&self, frame: &[u8]) -> Option<GamePacket> {
        match self.catalog.deserialize(frame) {
            Ok(packet) => Some(packet),
            Err(e) => {
                tracing::warn!("Dropping undecodable handshake packet: {e}");
                None
            }
        }
    }

    fn expect_state(&self, expected: SessionState, name: PacketName) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::Protocol(format!(
                "{} received in state {:?}, expected {expected:?}",
                name.as_ref(),
                self.state
            )))
        }
    }

    fn enable_compression(&mut self, settings: &NetworkSettings) -> Result<(), SessionError> {
        let method = CompressionMethod::from_settings(settings.compression_algorithm)?;
        self.compressor = Some(Compressor::new(method, settings.compression_threshold));
        Ok(())
    }

    /// Client side of the key agreement: the peer's handshake token holds
    /// its public key (header `x5u`) and the salt (claims).
    fn complete_client_handshake(&mut self, token: &str) -> Result<(), SessionError> {
        let (header, claims) = jwt::decode_unverified(token).map_err(AuthError::from)?;
        let x5u = header
            .x5u
            .ok_or(AuthError::from(crate::error::JwtError::MissingX5u))?;
        let salt = claims
            .get("salt")
            .and_then(serde_json::Value::as_str)
            .ok_or(AuthError::MissingClaim("salt"))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|e| AuthError::from(crate::error::JwtError::from(e)))?;

        // The token is signed by the same key it carries; checking it
        // proves possession, not identity.
        jwt::verify_with_x5u(token, &x5u).map_err(AuthError::from)?;

        let server_key = keys::public_key_from_x5u(&x5u).map_err(AuthError::from)?;
        let shared_secret = self.keypair.diffie_hellman(&server_key);
        let secret_hash = derive_secret_hash(&salt, &*shared_secret);
        self.encryptor = Some(Encryptor::new(&secret_hash));
        Ok(())
    }

    /// Server side: derive the key from the client's identity key, send
    /// the salt token, then encrypt everything that follows.
    fn complete_server_handshake(&mut self, identity_public_key: &str) -> Result<(), SessionError> {
        let client_key = keys::public_key_from_x5u(identity_public_key).map_err(AuthError::from)?;
        let shared_secret = self.keypair.diffie_hellman(&client_key);
        let secret_hash = derive_secret_hash(&HANDSHAKE_SALT, &*shared_secret);

        let token = jwt::sign(
            json!({
                "salt": BASE64.encode(HANDSHAKE_SALT),
                "signedToken": self.keypair.x5u(),
            }),
            &self.keypair,
            &SignOptions::default(),
        )
        .map_err(AuthError::from)?;

        self.send(&GamePacket::ServerToClientHandshake(
            ServerToClientHandshake { token },
        ))?;
        self.encryptor = Some(Encryptor::new(&secret_hash));
        Ok(())
    }

    /// Closes the session. Idempotent; the first call wins. With a reason,
    /// a Disconnect packet is sent first (best effort).
    pub fn disconnect(&mut self, reason: Option<&str>) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Some(reason) = reason {
            let disconnect = GamePacket::Disconnect(Disconnect {
                reason: 0,
                hide_message: false,
                message: reason.to_owned(),
            });
            if let Err(e) = self.send(&disconnect) {
                tracing::debug!("Disconnect packet not delivered: {e}");
            }
        }
        self.teardown();
    }

    /// Applies the error taxonomy to this session: disconnect packet or
    /// silent close. Per-packet errors never reach here.
    pub fn fail(&mut self, error: &SessionError) {
        match error.fatality() {
            Fatality::PerPacket => {}
            Fatality::DisconnectWith(message) => self.disconnect(Some(message)),
            Fatality::SilentClose => self.disconnect(None),
        }
    }

    /// Key material and transport handle go away together; the cipher key
    /// zeroizes on drop.
    fn teardown(&mut self) {
        self.state = SessionState::Disconnected;
        self.encryptor = None;
        self.compressor = None;
        self.sender = None;
        self.queued.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer())
            .field("encrypted", &self.encryptor.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn client_session() -> (Session, crate::transport::DatagramReceiver) {
        let (local, remote) = transport::link(addr(1), addr(2));
        let keypair = KeyPair::generate();
        let payload = Payload::offline("Steve", "127.0.0.1:2");
        let chain = auth::create_offline(&keypair, "Steve", &payload).unwrap();
        let session = Session::new_client(
            local.sender,
            keypair,
            chain,
            SessionConfig::default(),
        );
        (session, remote.receiver)
    }

    #[test]
    fn client_sends_request_network_settings_first() {
        let (mut session, peer_rx) = client_session();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::AwaitNetworkSettings);

        let datagram = peer_rx.try_recv().expect("expected a datagram");
        assert_eq!(datagram[0], GAME_PACKET_HEADER);
        // pre-NetworkSettings there is neither compression nor encryption
        let frames: Vec<_> = framer::unframe(&datagram[1..])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            Catalog::peek_id(frames[0]).unwrap(),
            PacketName::RequestNetworkSettings.id()
        );
    }

    #[test]
    fn game_packet_before_handshake_is_a_protocol_error() {
        let (mut session, _peer_rx) = client_session();
        session.start().unwrap();

        let frame = Catalog::serialize(&GamePacket::Text(crate::protocol::packet::Text::chat(
            "x", "y",
        )));
        let mut batch = vec![GAME_PACKET_HEADER];
        batch.extend(framer::frame([frame.as_slice()]));

        let mut events = Vec::new();
        let err = session.on_datagram(&batch, &mut events).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut session, peer_rx) = client_session();
        session.start().unwrap();
        let _ = peer_rx.try_recv();

        session.disconnect(Some("going away"));
        assert_eq!(session.state(), SessionState::Disconnected);
        let first = peer_rx.pending();

        session.disconnect(Some("again"));
        session.disconnect(None);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(peer_rx.pending(), first, "second disconnect sent nothing");
    }
}
