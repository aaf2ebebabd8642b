//! The man-in-the-middle persona.
//!
//! One bridged connection couples two sessions: a downstream server-role
//! session facing the real client and an upstream client-role session the
//! bridge owns toward the real server. Packets nobody observes are
//! forwarded byte-for-byte; observed packets take one round-trip through
//! the catalog so listeners can cancel or modify them.
//!
//! Two bridge-mandated exceptions to transparency: ClientCacheStatus is
//! always forced to disabled (the bridge cannot honor blob caching), and
//! clientbound chunks arriving before StartGame are held and replayed
//! after it, in arrival order.

use crate::{
    auth::{self, Payload, Profile},
    crypto::keys::KeyPair,
    dispatcher::{Dispatcher, Listener, Signal},
    error::SessionError,
    protocol::{
        catalog::Catalog,
        compression::CompressionMethod,
        packet::{ClientCacheStatus, GamePacket, LevelChunk, PacketName, UnknownPacket},
        Decode as _, Decoder, PROTOCOL_VERSION,
    },
    session::{PacketFrame, Session, SessionConfig, SessionEvent, SessionState},
    transport::{Connector, DatagramReceiver, Endpoint, MemoryListener},
};
use bytes::Bytes;
use mini_moka::sync::Cache;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::task;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub protocol_version: i32,
    pub compression_method: CompressionMethod,
    pub compression_threshold: u16,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            compression_method: CompressionMethod::Zlib,
            compression_threshold: 512,
        }
    }
}

/// Which way a packet is travelling through the pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Real server → real client.
    Clientbound,
    /// Real client → real server.
    Serverbound,
}

/// Listeners are shared across every pair the bridge accepts, so they
/// live behind a lock instead of being owned by one dispatcher.
pub type SharedListener =
    Arc<Mutex<dyn FnMut(&mut GamePacket, &mut Signal) -> anyhow::Result<()> + Send>>;

type Registration = (Direction, Option<PacketName>, SharedListener);

#[derive(Debug)]
pub enum BridgeEvent {
    Connect { peer: SocketAddr, profile: Profile },
    Disconnect { peer: SocketAddr, reason: Option<String> },
}

pub struct Bridge {
    listener: MemoryListener,
    connector: Arc<dyn Connector>,
    options: BridgeOptions,
    registrations: Vec<Registration>,
}

pub struct BridgeHandle {
    events: flume::Receiver<BridgeEvent>,
}

impl BridgeHandle {
    pub async fn next_event(&self) -> Option<BridgeEvent> {
        self.events.recv_async().await.ok()
    }
}

impl Bridge {
    pub fn new(
        listener: MemoryListener,
        connector: Arc<dyn Connector>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            listener,
            connector,
            options,
            registrations: Vec::new(),
        }
    }

    /// Observes one clientbound packet name on every pair.
    pub fn on_clientbound(
        &mut self,
        name: PacketName,
        listener: impl FnMut(&mut GamePacket, &mut Signal) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.registrations
            .push((Direction::Clientbound, Some(name), Arc::new(Mutex::new(listener))));
    }

    /// Observes one serverbound packet name on every pair.
    pub fn on_serverbound(
        &mut self,
        name: PacketName,
        listener: impl FnMut(&mut GamePacket, &mut Signal) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.registrations
            .push((Direction::Serverbound, Some(name), Arc::new(Mutex::new(listener))));
    }

    /// Observes every packet in the given direction.
    pub fn on_all(
        &mut self,
        direction: Direction,
        listener: impl FnMut(&mut GamePacket, &mut Signal) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.registrations
            .push((direction, None, Arc::new(Mutex::new(listener))));
    }

    /// Starts accepting clients. Each accepted client becomes a pair task.
    pub fn start(self) -> BridgeHandle {
        let (events_tx, events_rx) = flume::unbounded();
        let Bridge {
            listener,
            connector,
            options,
            registrations,
        } = self;
        let registrations = Arc::new(registrations);

        task::spawn(async move {
            while let Some(endpoint) = listener.accept().await {
                let peer = endpoint.peer();
                tracing::info!("Bridging connection from {peer}");
                let connector = Arc::clone(&connector);
                let registrations = Arc::clone(&registrations);
                let events = events_tx.clone();
                let options = options.clone();
                let local_address = listener.address();
                task::spawn(async move {
                    if let Err(e) =
                        drive_pair(endpoint, local_address, connector, options, registrations, events)
                            .await
                    {
                        tracing::warn!("Bridged connection from {peer} ended: {e:#}");
                    }
                });
            }
        });

        BridgeHandle { events: events_rx }
    }
}

/// A catalog whose chunk and cache-status decoders never fail: anything
/// unparseable stays raw and is forwarded as-is.
pub fn forgiving_catalog() -> Arc<Catalog> {
    let mut catalog = Catalog::bedrock();

    let chunk_id = PacketName::LevelChunk.id();
    catalog.override_decoder(chunk_id, move |decoder| {
        let body = decoder.buffer();
        let mut attempt = Decoder::new(body);
        match LevelChunk::decode(&mut attempt) {
            Ok(chunk) if attempt.is_finished() => {
                decoder.consume_rest();
                Ok(GamePacket::LevelChunk(chunk))
            }
            _ => Ok(GamePacket::Unknown(UnknownPacket {
                id: chunk_id,
                body: Bytes::copy_from_slice(decoder.consume_rest()),
            })),
        }
    });

    // Tolerates both historical encodings of the flag byte.
    catalog.override_decoder(PacketName::ClientCacheStatus.id(), |decoder| {
        let enabled = decoder.read_u8().map(|raw| raw != 0).unwrap_or(false);
        decoder.consume_rest();
        Ok(GamePacket::ClientCacheStatus(ClientCacheStatus { enabled }))
    });

    Arc::new(catalog)
}

struct Pair {
    downstream: Session,
    upstream: Session,
    post_start_game: bool,
    upstream_ready: bool,
    pending_serverbound: Vec<PacketFrame>,
    deferred_chunks: Vec<PacketFrame>,
    reserialize_cache: Cache<(u32, Bytes), Bytes>,
    clientbound: Dispatcher,
    serverbound: Dispatcher,
    catalog: Arc<Catalog>,
}

async fn drive_pair(
    endpoint: Endpoint,
    local_address: SocketAddr,
    connector: Arc<dyn Connector>,
    options: BridgeOptions,
    registrations: Arc<Vec<Registration>>,
    events: flume::Sender<BridgeEvent>,
) -> anyhow::Result<()> {
    let peer = endpoint.peer();
    let catalog = forgiving_catalog();

    // Phase one: let the real client log in against the downstream
    // session. The pair is born once it is logged in.
    let (d_sender, d_receiver) = endpoint.split();
    let mut downstream = Session::new_server(
        d_sender,
        KeyPair::generate(),
        SessionConfig {
            protocol_version: options.protocol_version,
            server_address: local_address.to_string(),
            compression_method: options.compression_method,
            compression_threshold: options.compression_threshold,
            ..SessionConfig::default()
        },
    );
    downstream.set_catalog(Arc::clone(&catalog));

    let mut pending_serverbound = Vec::new();
    let mut profile = None;
    'login: loop {
        let Some(datagram) = d_receiver.recv().await else {
            return Ok(());
        };
        let mut session_events = Vec::new();
        if let Err(e) = downstream.on_datagram(&datagram, &mut session_events) {
            downstream.fail(&e);
            return Err(anyhow::Error::from(e).context("downstream login"));
        }
        let mut logged_in = false;
        for event in session_events {
            match event {
                SessionEvent::LoginReceived { profile: p, .. } => profile = Some(p),
                SessionEvent::LoggedIn => logged_in = true,
                SessionEvent::Packet(frame) => pending_serverbound.push(frame),
                SessionEvent::Disconnected { reason } => {
                    events.send(BridgeEvent::Disconnect { peer, reason }).ok();
                    return Ok(());
                }
                _ => {}
            }
        }
        if logged_in {
            break 'login;
        }
    }
    let profile = profile.ok_or_else(|| anyhow::anyhow!("logged in without a login"))?;

    // Phase two: open the upstream leg, impersonating the client. The
    // inherited payload keeps skin, device and input metadata intact; only
    // the destination address is rewritten, since real servers reject a
    // ServerAddress that is not their own.
    let upstream_key = KeyPair::generate();
    let mut payload = downstream
        .peer_payload()
        .cloned()
        .unwrap_or_else(|| Payload::offline(&profile.display_name, ""));
    payload.server_address = connector.destination().to_string();
    let chain = auth::create_offline(&upstream_key, &profile.display_name, &payload)?;

    let (u_sender, u_receiver) = connector.connect(peer)?.split();
    let mut upstream = Session::new_client(
        u_sender,
        upstream_key,
        chain,
        SessionConfig {
            protocol_version: options.protocol_version,
            server_address: connector.destination().to_string(),
            cancel_past_login: true,
            ..SessionConfig::default()
        },
    );
    upstream.set_catalog(Arc::clone(&catalog));
    upstream.start()?;

    events
        .send(BridgeEvent::Connect {
            peer,
            profile: profile.clone(),
        })
        .ok();

    let mut pair = Pair {
        downstream,
        upstream,
        post_start_game: false,
        upstream_ready: false,
        pending_serverbound,
        deferred_chunks: Vec::new(),
        reserialize_cache: Cache::builder().max_capacity(256).build(),
        clientbound: build_dispatcher(&registrations, Direction::Clientbound),
        serverbound: build_dispatcher(&registrations, Direction::Serverbound),
        catalog,
    };

    let reason = pair.run(&d_receiver, &u_receiver).await;
    events.send(BridgeEvent::Disconnect { peer, reason }).ok();
    Ok(())
}

fn build_dispatcher(registrations: &[Registration], direction: Direction) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    for (registered_direction, name, listener) in registrations {
        if *registered_direction != direction {
            continue;
        }
        let listener = Arc::clone(listener);
        let adapted: Listener = Box::new(move |packet, signal| {
            let mut guard = listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard(packet, signal)
        });
        match name {
            Some(name) => dispatcher.on(*name, adapted),
            None => dispatcher.on_all(adapted),
        }
    }
    dispatcher
}

impl Pair {
    /// Pumps both legs until either side goes away. Returns the reason to
    /// report, if any.
    async fn run(
        &mut self,
        d_receiver: &DatagramReceiver,
        u_receiver: &DatagramReceiver,
    ) -> Option<String> {
        loop {
            tokio::select! {
                datagram = d_receiver.recv() => {
                    let Some(datagram) = datagram else {
                        self.upstream.disconnect(Some("client connection lost"));
                        return None;
                    };
                    if let Some(reason) = self.pump_downstream(&datagram) {
                        return reason;
                    }
                }
                datagram = u_receiver.recv() => {
                    let Some(datagram) = datagram else {
                        self.downstream.disconnect(Some("server connection lost"));
                        return None;
                    };
                    if let Some(reason) = self.pump_upstream(&datagram) {
                        return reason;
                    }
                }
            }
            if self.downstream.state() == SessionState::Disconnected
                || self.upstream.state() == SessionState::Disconnected
            {
                return None;
            }
        }
    }

    /// Returns `Some(reason)` once the pair is finished.
    fn pump_downstream(&mut self, datagram: &[u8]) -> Option<Option<String>> {
        let mut session_events = Vec::new();
        if let Err(e) = self.downstream.on_datagram(datagram, &mut session_events) {
            tracing::warn!("Downstream failed: {e}");
            self.downstream.fail(&e);
            self.upstream.disconnect(Some("client connection lost"));
            return Some(Some(e.to_string()));
        }
        for event in session_events {
            match event {
                SessionEvent::Packet(frame) => {
                    let result = if self.upstream_ready {
                        self.forward(Direction::Serverbound, frame)
                    } else {
                        self.pending_serverbound.push(frame);
                        Ok(())
                    };
                    if let Err(e) = result {
                        tracing::warn!("Serverbound forward failed: {e}");
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    self.upstream
                        .disconnect(reason.as_deref().or(Some("client disconnected")));
                    return Some(reason);
                }
                _ => {}
            }
        }
        None
    }

    fn pump_upstream(&mut self, datagram: &[u8]) -> Option<Option<String>> {
        let mut session_events = Vec::new();
        if let Err(e) = self.upstream.on_datagram(datagram, &mut session_events) {
            tracing::warn!("Upstream failed: {e}");
            self.upstream.fail(&e);
            self.downstream.disconnect(Some("server connection lost"));
            return Some(Some(e.to_string()));
        }
        for event in session_events {
            match event {
                SessionEvent::LoggedIn => {
                    self.upstream_ready = true;
                    for frame in std::mem::take(&mut self.pending_serverbound) {
                        if let Err(e) = self.forward(Direction::Serverbound, frame) {
                            tracing::warn!("Serverbound replay failed: {e}");
                        }
                    }
                }
                SessionEvent::Packet(frame) => {
                    if let Err(e) = self.forward_clientbound(frame) {
                        tracing::warn!("Clientbound forward failed: {e}");
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    self.downstream
                        .disconnect(reason.as_deref().or(Some("server disconnected")));
                    return Some(reason);
                }
                _ => {}
            }
        }
        None
    }

    /// Clientbound routing: chunks ahead of StartGame wait in the deferred
    /// queue and replay after it, in arrival order.
    fn forward_clientbound(&mut self, frame: PacketFrame) -> Result<(), SessionError> {
        if !self.post_start_game {
            if frame.name == Some(PacketName::LevelChunk) {
                self.deferred_chunks.push(frame);
                return Ok(());
            }
            if frame.name == Some(PacketName::StartGame) {
                self.forward(Direction::Clientbound, frame)?;
                self.post_start_game = true;
                for chunk in std::mem::take(&mut self.deferred_chunks) {
                    self.forward(Direction::Clientbound, chunk)?;
                }
                return Ok(());
            }
        }
        self.forward(Direction::Clientbound, frame)
    }

    /// The interception path. No listener and no mandated normalization
    /// means the original bytes go out untouched.
    fn forward(&mut self, direction: Direction, frame: PacketFrame) -> Result<(), SessionError> {
        let always_intercepted = frame.name == Some(PacketName::ClientCacheStatus);
        let has_listeners = match direction {
            Direction::Clientbound => self.clientbound.has_listeners(frame.name),
            Direction::Serverbound => self.serverbound.has_listeners(frame.name),
        };
        if !has_listeners && !always_intercepted {
            return self.send_to(direction, frame.bytes);
        }

        let mut packet = match self.catalog.deserialize(&frame.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                // Observers miss it; transparency wins.
                tracing::warn!("Undecodable packet {:#04x}: {e}", frame.id);
                return self.send_to(direction, frame.bytes);
            }
        };

        let signal = match direction {
            Direction::Clientbound => self.clientbound.emit(&mut packet),
            Direction::Serverbound => self.serverbound.emit(&mut packet),
        };
        if signal.cancelled {
            tracing::debug!("Cancelled packet {:#04x}", frame.id);
            return Ok(());
        }

        let normalized = normalize(&mut packet);
        let bytes = if signal.modified || normalized {
            self.reserialize(&frame, &packet)
        } else {
            frame.bytes
        };
        self.send_to(direction, bytes)
    }

    fn send_to(&mut self, direction: Direction, bytes: Bytes) -> Result<(), SessionError> {
        match direction {
            Direction::Clientbound => self.downstream.send_raw_frames(&[&bytes]),
            Direction::Serverbound => self.upstream.send_raw_frames(&[&bytes]),
        }
    }

    /// Serialization of identical intercepted packets is memoized on the
    /// original bytes.
    fn reserialize(&mut self, frame: &PacketFrame, packet: &GamePacket) -> Bytes {
        let key = (frame.id, frame.bytes.clone());
        if let Some(cached) = self.reserialize_cache.get(&key) {
            return cached.clone();
        }
        let bytes = Bytes::from(Catalog::serialize(packet));
        self.reserialize_cache.insert(key, bytes.clone());
        bytes
    }
}

/// Bridge-mandated edits that apply regardless of listeners: blob caching
/// is disabled because the bridge cannot answer cache-miss requests.
fn normalize(packet: &mut GamePacket) -> bool {
    match packet {
        GamePacket::ClientCacheStatus(status) if status.enabled => {
            status.enabled = false;
            true
        }
        GamePacket::LevelChunk(chunk) if chunk.cache_enabled => {
            chunk.cache_enabled = false;
            chunk.blob_hashes.clear();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Text;

    #[test]
    fn forgiving_catalog_keeps_garbage_chunks_raw() {
        let catalog = forgiving_catalog();
        let mut frame = Vec::new();
        let mut encoder = crate::protocol::Encoder::new(&mut frame);
        encoder.write_var_u32(PacketName::LevelChunk.id());
        encoder.write_slice(&[0xFF; 3]); // not a valid chunk body
        match catalog.deserialize(&frame).unwrap() {
            GamePacket::Unknown(unknown) => {
                assert_eq!(unknown.id, PacketName::LevelChunk.id());
                assert_eq!(Catalog::serialize(&GamePacket::Unknown(unknown)), frame);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn forgiving_cache_status_accepts_any_flag_byte() {
        let catalog = forgiving_catalog();
        let mut frame = Vec::new();
        let mut encoder = crate::protocol::Encoder::new(&mut frame);
        encoder.write_var_u32(PacketName::ClientCacheStatus.id());
        encoder.write_u8(0x02); // strict decoder would reject this bool
        match catalog.deserialize(&frame).unwrap() {
            GamePacket::ClientCacheStatus(status) => assert!(status.enabled),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn normalize_strips_cache_fields() {
        let mut packet = GamePacket::ClientCacheStatus(ClientCacheStatus { enabled: true });
        assert!(normalize(&mut packet));
        assert!(!normalize(&mut packet), "second pass is a no-op");

        let mut chunk = GamePacket::LevelChunk(LevelChunk {
            x: 0,
            z: 0,
            dimension: 0,
            sub_chunk_count: 1,
            cache_enabled: true,
            blob_hashes: vec![9],
            payload: Bytes::from_static(b"p"),
        });
        assert!(normalize(&mut chunk));
        match chunk {
            GamePacket::LevelChunk(chunk) => {
                assert!(!chunk.cache_enabled);
                assert!(chunk.blob_hashes.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }

        let mut text = GamePacket::Text(Text::chat("a", "b"));
        assert!(!normalize(&mut text));
    }
}
