//! Enumerates the game packets the pipeline understands.
//!
//! Full parsing of game packets is _not_ implemented. The handshake set is
//! decoded completely; large gameplay packets decode only the fields needed
//! for session sequencing and bridge interception, with the remainder kept
//! as a `Bytes` blob. (This enables roundtrip encoding/decoding without loss
//! of information.)
//!
//! Each sub-packet on the wire starts with a VarInt header whose low ten
//! bits are the packet id; the upper bits carry sub-client routing and are
//! written as zero.

use crate::protocol::{
    decoder::{Decode, DecodeError, Decoder},
    encoder::{Encode, Encoder},
};
use bytes::Bytes;

/// Mask extracting the packet id from the sub-packet header VarInt.
pub const HEADER_ID_MASK: u32 = 0x3FF;

/// Names of the packets the catalog can fully type.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum::AsRefStr,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum PacketName {
    Login,
    PlayStatus,
    ServerToClientHandshake,
    ClientToServerHandshake,
    Disconnect,
    ResourcePacksInfo,
    ResourcePackStack,
    ResourcePackClientResponse,
    Text,
    StartGame,
    LevelChunk,
    RequestChunkRadius,
    SetLocalPlayerAsInitialized,
    ClientCacheStatus,
    NetworkSettings,
    RequestNetworkSettings,
    ServerboundLoadingScreen,
}

impl PacketName {
    pub fn id(self) -> u32 {
        match self {
            Self::Login => 0x01,
            Self::PlayStatus => 0x02,
            Self::ServerToClientHandshake => 0x03,
            Self::ClientToServerHandshake => 0x04,
            Self::Disconnect => 0x05,
            Self::ResourcePacksInfo => 0x06,
            Self::ResourcePackStack => 0x07,
            Self::ResourcePackClientResponse => 0x08,
            Self::Text => 0x09,
            Self::StartGame => 0x0B,
            Self::LevelChunk => 0x3A,
            Self::RequestChunkRadius => 0x45,
            Self::SetLocalPlayerAsInitialized => 0x71,
            Self::ClientCacheStatus => 0x81,
            Self::NetworkSettings => 0x8F,
            Self::RequestNetworkSettings => 0xC1,
            Self::ServerboundLoadingScreen => 0x138,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|name| name.id() == id)
    }
}

/// A deserialized game packet, or an opaque `(id, bytes)` pair for ids the
/// catalog does not know.
#[derive(Debug, Clone, strum::AsRefStr)]
pub enum GamePacket {
    Login(Login),
    PlayStatus(PlayStatus),
    ServerToClientHandshake(ServerToClientHandshake),
    ClientToServerHandshake(ClientToServerHandshake),
    Disconnect(Disconnect),
    ResourcePacksInfo(ResourcePacksInfo),
    ResourcePackStack(ResourcePackStack),
    ResourcePackClientResponse(ResourcePackClientResponse),
    Text(Text),
    StartGame(StartGame),
    LevelChunk(LevelChunk),
    RequestChunkRadius(RequestChunkRadius),
    SetLocalPlayerAsInitialized(SetLocalPlayerAsInitialized),
    ClientCacheStatus(ClientCacheStatus),
    NetworkSettings(NetworkSettings),
    RequestNetworkSettings(RequestNetworkSettings),
    ServerboundLoadingScreen(ServerboundLoadingScreen),
    Unknown(UnknownPacket),
}

impl GamePacket {
    pub fn id(&self) -> u32 {
        match self {
            Self::Unknown(unknown) => unknown.id,
            _ => self.name().expect("typed packets have a name").id(),
        }
    }

    pub fn name(&self) -> Option<PacketName> {
        Some(match self {
            Self::Login(_) => PacketName::Login,
            Self::PlayStatus(_) => PacketName::PlayStatus,
            Self::ServerToClientHandshake(_) => PacketName::ServerToClientHandshake,
            Self::ClientToServerHandshake(_) => PacketName::ClientToServerHandshake,
            Self::Disconnect(_) => PacketName::Disconnect,
            Self::ResourcePacksInfo(_) => PacketName::ResourcePacksInfo,
            Self::ResourcePackStack(_) => PacketName::ResourcePackStack,
            Self::ResourcePackClientResponse(_) => PacketName::ResourcePackClientResponse,
            Self::Text(_) => PacketName::Text,
            Self::StartGame(_) => PacketName::StartGame,
            Self::LevelChunk(_) => PacketName::LevelChunk,
            Self::RequestChunkRadius(_) => PacketName::RequestChunkRadius,
            Self::SetLocalPlayerAsInitialized(_) => PacketName::SetLocalPlayerAsInitialized,
            Self::ClientCacheStatus(_) => PacketName::ClientCacheStatus,
            Self::NetworkSettings(_) => PacketName::NetworkSettings,
            Self::RequestNetworkSettings(_) => PacketName::RequestNetworkSettings,
            Self::ServerboundLoadingScreen(_) => PacketName::ServerboundLoadingScreen,
            Self::Unknown(_) => return None,
        })
    }
}

/// An id the catalog has no decoder for. The body excludes the header
/// VarInt; callers may still route it by id.
#[derive(Debug, Clone)]
pub struct UnknownPacket {
    pub id: u32,
    pub body: Bytes,
}

/// First packet of the client, requesting NetworkSettings. The protocol
/// version is big-endian so servers can read it before knowing the
/// negotiated endianness of anything else.
#[derive(Debug, Clone)]
pub struct RequestNetworkSettings {
    pub protocol_version: i32,
}

impl Encode for RequestNetworkSettings {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_be(self.protocol_version);
    }
}

impl Decode for RequestNetworkSettings {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: decoder.read_i32_be()?,
        })
    }
}

/// Server response enabling compression. Compression applies from the next
/// batch onward, in both directions.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub compression_threshold: u16,
    pub compression_algorithm: u16,
    pub client_throttle: bool,
    pub throttle_threshold: u8,
    pub throttle_scalar: f32,
}

impl Encode for NetworkSettings {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u16(self.compression_threshold);
        encoder.write_u16(self.compression_algorithm);
        encoder.write_bool(self.client_throttle);
        encoder.write_u8(self.throttle_threshold);
        encoder.write_f32(self.throttle_scalar);
    }
}

impl Decode for NetworkSettings {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            compression_threshold: decoder.read_u16()?,
            compression_algorithm: decoder.read_u16()?,
            client_throttle: decoder.read_bool()?,
            throttle_threshold: decoder.read_u8()?,
            throttle_scalar: decoder.read_f32()?,
        })
    }
}

/// Carries the identity chain JSON and the user-chain JWT.
#[derive(Debug, Clone)]
pub struct Login {
    pub protocol_version: i32,
    /// `{"chain":[...]}` JSON document.
    pub chain_json: String,
    /// Single JWT with the client payload (skin, device, inputs).
    pub user_jwt: String,
}

impl Encode for Login {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_be(self.protocol_version);
        let blob_len = 4 + self.chain_json.len() + 4 + self.user_jwt.len();
        encoder.write_var_u32(blob_len.try_into().unwrap_or(u32::MAX));
        encoder.write_u32_string(&self.chain_json);
        encoder.write_u32_string(&self.user_jwt);
    }
}

impl Decode for Login {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let protocol_version = decoder.read_i32_be()?;
        let _blob_len = decoder.read_var_u32()?;
        Ok(Self {
            protocol_version,
            chain_json: decoder.read_u32_string()?.to_owned(),
            user_jwt: decoder.read_u32_string()?.to_owned(),
        })
    }
}

/// JWS carrying the server's public key and the key-derivation salt.
#[derive(Debug, Clone)]
pub struct ServerToClientHandshake {
    pub token: String,
}

impl Encode for ServerToClientHandshake {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(&self.token);
    }
}

impl Decode for ServerToClientHandshake {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            token: decoder.read_string()?.to_owned(),
        })
    }
}

/// Zero-body acknowledgement; the client's first encrypted frame.
#[derive(Debug, Clone)]
pub struct ClientToServerHandshake;

impl Encode for ClientToServerHandshake {
    fn encode(&self, _encoder: &mut Encoder) {}
}

impl Decode for ClientToServerHandshake {
    fn decode(_decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlayStatusKind {
    LoginSuccess,
    FailedClient,
    FailedServer,
    PlayerSpawn,
    FailedInvalidTenant,
    FailedVanillaEdu,
    FailedEduVanilla,
    FailedServerFull,
    FailedEditorVanillaMismatch,
    FailedVanillaEditorMismatch,
}

impl PlayStatusKind {
    pub fn from_i32(raw: i32) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => Self::LoginSuccess,
            1 => Self::FailedClient,
            2 => Self::FailedServer,
            3 => Self::PlayerSpawn,
            4 => Self::FailedInvalidTenant,
            5 => Self::FailedVanillaEdu,
            6 => Self::FailedEduVanilla,
            7 => Self::FailedServerFull,
            8 => Self::FailedEditorVanillaMismatch,
            9 => Self::FailedVanillaEditorMismatch,
            other => {
                return Err(DecodeError::UnknownDiscriminant(other as i64, "PlayStatus"))
            }
        })
    }

    pub fn to_i32(self) -> i32 {
        match self {
            Self::LoginSuccess => 0,
            Self::FailedClient => 1,
            Self::FailedServer => 2,
            Self::PlayerSpawn => 3,
            Self::FailedInvalidTenant => 4,
            Self::FailedVanillaEdu => 5,
            Self::FailedEduVanilla => 6,
            Self::FailedServerFull => 7,
            Self::FailedEditorVanillaMismatch => 8,
            Self::FailedVanillaEditorMismatch => 9,
        }
    }

    /// Whether this status ends the login attempt.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::LoginSuccess | Self::PlayerSpawn)
    }
}

/// Major lifecycle signal from the server (login success, player spawn,
/// or one of the failure codes).
#[derive(Debug, Clone)]
pub struct PlayStatus {
    pub status: PlayStatusKind,
}

impl Encode for PlayStatus {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_be(self.status.to_i32());
    }
}

impl Decode for PlayStatus {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            status: PlayStatusKind::from_i32(decoder.read_i32_be()?)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Disconnect {
    /// Raw reason code; the client only displays the message.
    pub reason: i32,
    pub hide_message: bool,
    pub message: String,
}

impl Encode for Disconnect {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_i32(self.reason);
        encoder.write_bool(self.hide_message);
        if !self.hide_message {
            encoder.write_string(&self.message);
        }
    }
}

impl Decode for Disconnect {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let reason = decoder.read_var_i32()?;
        let hide_message = decoder.read_bool()?;
        let message = if hide_message {
            String::new()
        } else {
            decoder.read_string()?.to_owned()
        };
        Ok(Self {
            reason,
            hide_message,
            message,
        })
    }
}

/// Advertises the server's resource and behavior packs. Pack entries are
/// kept opaque; only the leading flags and counts are typed.
#[derive(Debug, Clone)]
pub struct ResourcePacksInfo {
    pub must_accept: bool,
    pub has_addons: bool,
    pub has_scripts: bool,
    pub behavior_packs: u16,
    pub resource_packs: u16,
    pub rest: Bytes,
}

impl ResourcePacksInfo {
    /// The "no packs" advertisement our own server persona sends.
    pub fn empty() -> Self {
        Self {
            must_accept: false,
            has_addons: false,
            has_scripts: false,
            behavior_packs: 0,
            resource_packs: 0,
            rest: Bytes::new(),
        }
    }
}

impl Encode for ResourcePacksInfo {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_bool(self.must_accept);
        encoder.write_bool(self.has_addons);
        encoder.write_bool(self.has_scripts);
        encoder.write_u16(self.behavior_packs);
        encoder.write_u16(self.resource_packs);
        encoder.write_slice(&self.rest);
    }
}

impl Decode for ResourcePacksInfo {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            must_accept: decoder.read_bool()?,
            has_addons: decoder.read_bool()?,
            has_scripts: decoder.read_bool()?,
            behavior_packs: decoder.read_u16()?,
            resource_packs: decoder.read_u16()?,
            rest: Bytes::copy_from_slice(decoder.consume_rest()),
        })
    }
}

/// The order packs are applied in, ending the pack exchange.
#[derive(Debug, Clone)]
pub struct ResourcePackStack {
    pub must_accept: bool,
    pub behavior_packs: u32,
    pub resource_packs: u32,
    pub game_version: String,
    /// Experiments blob and the toggled-before flag, opaque.
    pub rest: Bytes,
}

impl ResourcePackStack {
    pub fn empty(game_version: &str) -> Self {
        Self {
            must_accept: false,
            behavior_packs: 0,
            resource_packs: 0,
            game_version: game_version.to_owned(),
            // zero experiments (LE u32) + previously-toggled false
            rest: Bytes::from_static(&[0, 0, 0, 0, 0]),
        }
    }
}

impl Encode for ResourcePackStack {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_bool(self.must_accept);
        encoder.write_var_u32(self.behavior_packs);
        encoder.write_var_u32(self.resource_packs);
        encoder.write_string(&self.game_version);
        encoder.write_slice(&self.rest);
    }
}

impl Decode for ResourcePackStack {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            must_accept: decoder.read_bool()?,
            behavior_packs: decoder.read_var_u32()?,
            resource_packs: decoder.read_var_u32()?,
            game_version: decoder.read_string()?.to_owned(),
            rest: Bytes::copy_from_slice(decoder.consume_rest()),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourcePackResponse {
    None,
    Refused,
    SendPacks,
    HaveAllPacks,
    Completed,
}

impl ResourcePackResponse {
    fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Refused,
            2 => Self::SendPacks,
            3 => Self::HaveAllPacks,
            4 => Self::Completed,
            other => {
                return Err(DecodeError::UnknownDiscriminant(
                    other as i64,
                    "ResourcePackClientResponse",
                ))
            }
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Refused => 1,
            Self::SendPacks => 2,
            Self::HaveAllPacks => 3,
            Self::Completed => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourcePackClientResponse {
    pub response: ResourcePackResponse,
    pub pack_ids: Vec<String>,
}

impl ResourcePackClientResponse {
    pub fn new(response: ResourcePackResponse) -> Self {
        Self {
            response,
            pack_ids: Vec::new(),
        }
    }
}

impl Encode for ResourcePackClientResponse {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.response.to_u8());
        encoder.write_u16(self.pack_ids.len().try_into().unwrap_or(u16::MAX));
        for id in &self.pack_ids {
            encoder.write_string(id);
        }
    }
}

impl Decode for ResourcePackClientResponse {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let response = ResourcePackResponse::from_u8(decoder.read_u8()?)?;
        let count = decoder.read_u16()?;
        let mut pack_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pack_ids.push(decoder.read_string()?.to_owned());
        }
        Ok(Self { response, pack_ids })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextKind {
    Raw,
    Chat,
    Translation,
    Popup,
    JukeboxPopup,
    Tip,
    SystemMessage,
    Whisper,
    Announcement,
    ObjectWhisper,
    Object,
    ObjectAnnouncement,
}

impl TextKind {
    fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        Ok(match raw {
            0 => Self::Raw,
            1 => Self::Chat,
            2 => Self::Translation,
            3 => Self::Popup,
            4 => Self::JukeboxPopup,
            5 => Self::Tip,
            6 => Self::SystemMessage,
            7 => Self::Whisper,
            8 => Self::Announcement,
            9 => Self::ObjectWhisper,
            10 => Self::Object,
            11 => Self::ObjectAnnouncement,
            other => return Err(DecodeError::UnknownDiscriminant(other as i64, "Text")),
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::Chat => 1,
            Self::Translation => 2,
            Self::Popup => 3,
            Self::JukeboxPopup => 4,
            Self::Tip => 5,
            Self::SystemMessage => 6,
            Self::Whisper => 7,
            Self::Announcement => 8,
            Self::ObjectWhisper => 9,
            Self::Object => 10,
            Self::ObjectAnnouncement => 11,
        }
    }

    fn has_source(self) -> bool {
        matches!(self, Self::Chat | Self::Whisper | Self::Announcement)
    }

    fn has_parameters(self) -> bool {
        matches!(self, Self::Translation | Self::Popup | Self::JukeboxPopup)
    }
}

/// Chat and system text in either direction.
#[derive(Debug, Clone)]
pub struct Text {
    pub kind: TextKind,
    pub needs_translation: bool,
    pub source_name: String,
    pub message: String,
    pub parameters: Vec<String>,
    pub xuid: String,
    pub platform_chat_id: String,
}

impl Text {
    pub fn chat(source: &str, message: &str) -> Self {
        Self {
            kind: TextKind::Chat,
            needs_translation: false,
            source_name: source.to_owned(),
            message: message.to_owned(),
            parameters: Vec::new(),
            xuid: String::new(),
            platform_chat_id: String::new(),
        }
    }
}

impl Encode for Text {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.kind.to_u8());
        encoder.write_bool(self.needs_translation);
        if self.kind.has_source() {
            encoder.write_string(&self.source_name);
        }
        encoder.write_string(&self.message);
        if self.kind.has_parameters() {
            encoder.write_var_u32(self.parameters.len().try_into().unwrap_or(u32::MAX));
            for parameter in &self.parameters {
                encoder.write_string(parameter);
            }
        }
        encoder.write_string(&self.xuid);
        encoder.write_string(&self.platform_chat_id);
    }
}

impl Decode for Text {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let kind = TextKind::from_u8(decoder.read_u8()?)?;
        let needs_translation = decoder.read_bool()?;
        let source_name = if kind.has_source() {
            decoder.read_string()?.to_owned()
        } else {
            String::new()
        };
        let message = decoder.read_string()?.to_owned();
        let parameters = if kind.has_parameters() {
            let count = decoder.read_var_u32()?;
            let mut parameters = Vec::with_capacity(count as usize);
            for _ in 0..count {
                parameters.push(decoder.read_string()?.to_owned());
            }
            parameters
        } else {
            Vec::new()
        };
        Ok(Self {
            kind,
            needs_translation,
            source_name,
            message,
            parameters,
            xuid: decoder.read_string()?.to_owned(),
            platform_chat_id: decoder.read_string()?.to_owned(),
        })
    }
}

/// World-join packet. Only the leading identity and spawn fields are
/// decoded; the enormous remainder is carried as-is.
#[derive(Debug, Clone)]
pub struct StartGame {
    pub entity_unique_id: i64,
    pub runtime_entity_id: u64,
    pub player_gamemode: i32,
    pub position: (f32, f32, f32),
    pub pitch: f32,
    pub yaw: f32,
    pub rest: Bytes,
}

impl Encode for StartGame {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_i64(self.entity_unique_id);
        encoder.write_var_u64(self.runtime_entity_id);
        encoder.write_var_i32(self.player_gamemode);
        encoder.write_f32(self.position.0);
        encoder.write_f32(self.position.1);
        encoder.write_f32(self.position.2);
        encoder.write_f32(self.pitch);
        encoder.write_f32(self.yaw);
        encoder.write_slice(&self.rest);
    }
}

impl Decode for StartGame {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            entity_unique_id: decoder.read_var_i64()?,
            runtime_entity_id: decoder.read_var_u64()?,
            player_gamemode: decoder.read_var_i32()?,
            position: (
                decoder.read_f32()?,
                decoder.read_f32()?,
                decoder.read_f32()?,
            ),
            pitch: decoder.read_f32()?,
            yaw: decoder.read_f32()?,
            rest: Bytes::copy_from_slice(decoder.consume_rest()),
        })
    }
}

/// A column of terrain. The sub-chunk payload stays opaque; the cache
/// fields are typed so a bridge can strip blob references.
#[derive(Debug, Clone)]
pub struct LevelChunk {
    pub x: i32,
    pub z: i32,
    pub dimension: i32,
    pub sub_chunk_count: u32,
    pub cache_enabled: bool,
    pub blob_hashes: Vec<u64>,
    pub payload: Bytes,
}

impl Encode for LevelChunk {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_i32(self.x);
        encoder.write_var_i32(self.z);
        encoder.write_var_i32(self.dimension);
        encoder.write_var_u32(self.sub_chunk_count);
        encoder.write_bool(self.cache_enabled);
        if self.cache_enabled {
            encoder.write_var_u32(self.blob_hashes.len().try_into().unwrap_or(u32::MAX));
            for hash in &self.blob_hashes {
                encoder.write_u64(*hash);
            }
        }
        encoder.write_byte_array(&self.payload);
    }
}

impl Decode for LevelChunk {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let x = decoder.read_var_i32()?;
        let z = decoder.read_var_i32()?;
        let dimension = decoder.read_var_i32()?;
        let sub_chunk_count = decoder.read_var_u32()?;
        let cache_enabled = decoder.read_bool()?;
        let blob_hashes = if cache_enabled {
            let count = decoder.read_var_u32()?;
            let mut hashes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                hashes.push(decoder.read_u64()?);
            }
            hashes
        } else {
            Vec::new()
        };
        Ok(Self {
            x,
            z,
            dimension,
            sub_chunk_count,
            cache_enabled,
            blob_hashes,
            payload: Bytes::copy_from_slice(decoder.read_byte_array()?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RequestChunkRadius {
    pub radius: i32,
    pub max_radius: u8,
}

impl Encode for RequestChunkRadius {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_i32(self.radius);
        encoder.write_u8(self.max_radius);
    }
}

impl Decode for RequestChunkRadius {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            radius: decoder.read_var_i32()?,
            max_radius: decoder.read_u8()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SetLocalPlayerAsInitialized {
    pub runtime_entity_id: u64,
}

impl Encode for SetLocalPlayerAsInitialized {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_u64(self.runtime_entity_id);
    }
}

impl Decode for SetLocalPlayerAsInitialized {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            runtime_entity_id: decoder.read_var_u64()?,
        })
    }
}

/// Whether the client supports the chunk blob cache.
#[derive(Debug, Clone)]
pub struct ClientCacheStatus {
    pub enabled: bool,
}

impl Encode for ClientCacheStatus {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_bool(self.enabled);
    }
}

impl Decode for ClientCacheStatus {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            enabled: decoder.read_bool()?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadingScreenKind {
    Unknown,
    Start,
    End,
}

impl LoadingScreenKind {
    fn from_i32(raw: i32) -> Self {
        match raw {
            1 => Self::Start,
            2 => Self::End,
            _ => Self::Unknown,
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Start => 1,
            Self::End => 2,
        }
    }
}

/// Loading-screen lifecycle notification sent after spawn.
#[derive(Debug, Clone)]
pub struct ServerboundLoadingScreen {
    pub kind: LoadingScreenKind,
    pub screen_id: Option<u32>,
}

impl ServerboundLoadingScreen {
    pub fn end() -> Self {
        Self {
            kind: LoadingScreenKind::End,
            screen_id: None,
        }
    }
}

impl Encode for ServerboundLoadingScreen {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_i32(self.kind.to_i32());
        encoder.write_bool(self.screen_id.is_some());
        if let Some(id) = self.screen_id {
            encoder.write_var_u32(id);
        }
    }
}

impl Decode for ServerboundLoadingScreen {
    fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let kind = LoadingScreenKind::from_i32(decoder.read_var_i32()?);
        let screen_id = if decoder.read_bool()? {
            Some(decoder.read_var_u32()?)
        } else {
            None
        };
        Ok(Self { kind, screen_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encode + Decode + std::fmt::Debug>(packet: &T) -> T {
        let mut buf = Vec::new();
        packet.encode(&mut Encoder::new(&mut buf));
        let mut decoder = Decoder::new(&buf);
        let out = T::decode(&mut decoder).unwrap();
        assert!(decoder.is_finished(), "trailing bytes after {packet:?}");
        out
    }

    #[test]
    fn login_roundtrip() {
        let login = Login {
            protocol_version: 712,
            chain_json: r#"{"chain":["a.b.c"]}"#.to_owned(),
            user_jwt: "x.y.z".to_owned(),
        };
        let out = roundtrip(&login);
        assert_eq!(out.chain_json, login.chain_json);
        assert_eq!(out.user_jwt, login.user_jwt);
        assert_eq!(out.protocol_version, 712);
    }

    #[test]
    fn text_chat_roundtrip() {
        let text = Text::chat("Steve", "hello");
        let out = roundtrip(&text);
        assert_eq!(out.source_name, "Steve");
        assert_eq!(out.message, "hello");
    }

    #[test]
    fn level_chunk_cache_fields() {
        let chunk = LevelChunk {
            x: -3,
            z: 12,
            dimension: 0,
            sub_chunk_count: 4,
            cache_enabled: true,
            blob_hashes: vec![1, 2, 3],
            payload: Bytes::from_static(b"terrain"),
        };
        let out = roundtrip(&chunk);
        assert_eq!(out.blob_hashes, vec![1, 2, 3]);
        assert_eq!(out.payload, chunk.payload);

        let uncached = LevelChunk {
            cache_enabled: false,
            blob_hashes: Vec::new(),
            ..chunk
        };
        let out = roundtrip(&uncached);
        assert!(out.blob_hashes.is_empty());
    }

    #[test]
    fn play_status_rejects_unknown_code() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).write_i32_be(42);
        assert!(PlayStatus::decode(&mut Decoder::new(&buf)).is_err());
    }

    #[test]
    fn packet_name_ids_are_ten_bit() {
        use strum::IntoEnumIterator;
        for name in PacketName::iter() {
            assert!(name.id() <= HEADER_ID_MASK);
            assert_eq!(PacketName::from_id(name.id()), Some(name));
        }
    }
}
