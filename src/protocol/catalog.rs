//! Maps packet ids to typed decoders.
//!
//! The catalog is populated explicitly at startup and read-only afterwards.
//! Individual ids can be overridden before a catalog is shared; the bridge
//! uses this to install forgiving decoders that fall back to raw bytes
//! instead of failing on unparseable gameplay packets.

use crate::protocol::{
    decoder::{Decode, DecodeError, Decoder},
    encoder::{Encode, Encoder},
    packet::{GamePacket, PacketName, UnknownPacket, HEADER_ID_MASK},
};
use ahash::AHashMap;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};

type DecodeFn = Arc<dyn Fn(&mut Decoder) -> Result<GamePacket, DecodeError> + Send + Sync>;

pub struct Catalog {
    decoders: AHashMap<u32, DecodeFn>,
}

impl Catalog {
    /// The standard Bedrock catalog with a decoder per typed packet.
    pub fn bedrock() -> Self {
        use strum::IntoEnumIterator;

        let mut catalog = Self {
            decoders: AHashMap::new(),
        };
        for name in PacketName::iter() {
            catalog.decoders.insert(name.id(), decoder_for(name));
        }
        catalog
    }

    /// Replaces the decoder for one id. Ids outside the catalog gain a
    /// decoder, turning a previously opaque packet into a typed one.
    pub fn override_decoder(
        &mut self,
        id: u32,
        decoder: impl Fn(&mut Decoder) -> Result<GamePacket, DecodeError> + Send + Sync + 'static,
    ) {
        self.decoders.insert(id, Arc::new(decoder));
    }

    /// Reads the sub-packet header and returns the packet id.
    pub fn peek_id(frame: &[u8]) -> Result<u32, DecodeError> {
        Ok(Decoder::new(frame).read_var_u32()? & HEADER_ID_MASK)
    }

    /// Deserializes one sub-packet (header included). Ids without a decoder
    /// come back as [`GamePacket::Unknown`]; a failing decoder is an error
    /// the caller may treat as per-packet (the raw bytes remain usable).
    pub fn deserialize(&self, frame: &[u8]) -> Result<GamePacket, DecodeError> {
        let mut decoder = Decoder::new(frame);
        let id = decoder.read_var_u32()? & HEADER_ID_MASK;
        match self.decoders.get(&id) {
            Some(decode) => decode(&mut decoder),
            None => Ok(GamePacket::Unknown(UnknownPacket {
                id,
                body: Bytes::copy_from_slice(decoder.buffer()),
            })),
        }
    }

    /// Serializes a packet to an owned buffer starting with its header.
    pub fn serialize(packet: &GamePacket) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder.write_var_u32(packet.id() & HEADER_ID_MASK);
        match packet {
            GamePacket::Login(p) => p.encode(&mut encoder),
            GamePacket::PlayStatus(p) => p.encode(&mut encoder),
            GamePacket::ServerToClientHandshake(p) => p.encode(&mut encoder),
            GamePacket::ClientToServerHandshake(p) => p.encode(&mut encoder),
            GamePacket::Disconnect(p) => p.encode(&mut encoder),
            GamePacket::ResourcePacksInfo(p) => p.encode(&mut encoder),
            GamePacket::ResourcePackStack(p) => p.encode(&mut encoder),
            GamePacket::ResourcePackClientResponse(p) => p.encode(&mut encoder),
            GamePacket::Text(p) => p.encode(&mut encoder),
            GamePacket::StartGame(p) => p.encode(&mut encoder),
            GamePacket::LevelChunk(p) => p.encode(&mut encoder),
            GamePacket::RequestChunkRadius(p) => p.encode(&mut encoder),
            GamePacket::SetLocalPlayerAsInitialized(p) => p.encode(&mut encoder),
            GamePacket::ClientCacheStatus(p) => p.encode(&mut encoder),
            GamePacket::NetworkSettings(p) => p.encode(&mut encoder),
            GamePacket::RequestNetworkSettings(p) => p.encode(&mut encoder),
            GamePacket::ServerboundLoadingScreen(p) => p.encode(&mut encoder),
            GamePacket::Unknown(p) => encoder.write_slice(&p.body),
        }
        buf
    }
}

fn decoder_for(name: PacketName) -> DecodeFn {
    macro_rules! typed {
        ($variant:ident) => {
            Arc::new(|decoder: &mut Decoder| {
                Decode::decode(decoder).map(GamePacket::$variant)
            })
        };
    }
    match name {
        PacketName::Login => typed!(Login),
        PacketName::PlayStatus => typed!(PlayStatus),
        PacketName::ServerToClientHandshake => typed!(ServerToClientHandshake),
        PacketName::ClientToServerHandshake => typed!(ClientToServerHandshake),
        PacketName::Disconnect => typed!(Disconnect),
        PacketName::ResourcePacksInfo => typed!(ResourcePacksInfo),
        PacketName::ResourcePackStack => typed!(ResourcePackStack),
        PacketName::ResourcePackClientResponse => typed!(ResourcePackClientResponse),
        PacketName::Text => typed!(Text),
        PacketName::StartGame => typed!(StartGame),
        PacketName::LevelChunk => typed!(LevelChunk),
        PacketName::RequestChunkRadius => typed!(RequestChunkRadius),
        PacketName::SetLocalPlayerAsInitialized => typed!(SetLocalPlayerAsInitialized),
        PacketName::ClientCacheStatus => typed!(ClientCacheStatus),
        PacketName::NetworkSettings => typed!(NetworkSettings),
        PacketName::RequestNetworkSettings => typed!(RequestNetworkSettings),
        PacketName::ServerboundLoadingScreen => typed!(ServerboundLoadingScreen),
    }
}

/// Process-wide default catalog.
pub fn default_catalog() -> Arc<Catalog> {
    static CATALOG: OnceLock<Arc<Catalog>> = OnceLock::new();
    Arc::clone(CATALOG.get_or_init(|| Arc::new(Catalog::bedrock())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{ClientCacheStatus, Text};

    #[test]
    fn serialize_deserialize_roundtrip() {
        let catalog = Catalog::bedrock();
        let packet = GamePacket::Text(Text::chat("Alex", "hi"));
        let frame = Catalog::serialize(&packet);
        assert_eq!(Catalog::peek_id(&frame).unwrap(), packet.id());
        match catalog.deserialize(&frame).unwrap() {
            GamePacket::Text(text) => assert_eq!(text.message, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_id_is_tolerated() {
        let catalog = Catalog::bedrock();
        let mut frame = Vec::new();
        let mut encoder = Encoder::new(&mut frame);
        encoder.write_var_u32(0x1F0); // not in the catalog
        encoder.write_slice(b"opaque");
        match catalog.deserialize(&frame).unwrap() {
            GamePacket::Unknown(unknown) => {
                assert_eq!(unknown.id, 0x1F0);
                assert_eq!(&unknown.body[..], b"opaque");
                // unknown packets reserialize byte-identically
                assert_eq!(
                    Catalog::serialize(&GamePacket::Unknown(unknown)),
                    frame
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn override_replaces_decoder() {
        let mut catalog = Catalog::bedrock();
        let id = PacketName::ClientCacheStatus.id();
        catalog.override_decoder(id, |_decoder| {
            Ok(GamePacket::ClientCacheStatus(ClientCacheStatus {
                enabled: false,
            }))
        });
        let frame = Catalog::serialize(&GamePacket::ClientCacheStatus(ClientCacheStatus {
            enabled: true,
        }));
        match catalog.deserialize(&frame).unwrap() {
            GamePacket::ClientCacheStatus(status) => assert!(!status.enabled),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
