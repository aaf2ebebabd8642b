//! Error types for the session pipeline.
//!
//! Each layer has its own typed error; `SessionError` is the umbrella the
//! session state machine surfaces to its driver. Whether an error tears the
//! connection down (and whether a Disconnect packet is still sent) depends on
//! the variant, see [`SessionError::fatality`].

use crate::protocol::decoder::DecodeError;
use std::io;

/// Failure in the RakNet-facing transport: the peer endpoint is gone or the
/// datagram channel was torn down underneath us.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("connect failed: no listener at {0}")]
    NoRoute(std::net::SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Batch compression / decompression failure.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("unsupported compression method byte {0:#04x}")]
    UnsupportedCompression(u8),
    #[error("batch is empty, expected a method byte")]
    MissingMethodByte,
    #[error("inflated batch exceeds the {0} byte limit")]
    BatchTooLarge(usize),
    #[error("deflate: {0}")]
    Deflate(io::Error),
    #[error("inflate: {0}")]
    Inflate(io::Error),
    #[error("snappy: {0}")]
    Snappy(#[from] snap::Error),
}

/// Symmetric cipher failure. Always fatal: once a checksum fails or a counter
/// desyncs the stream state is ambiguous and nothing after it can be trusted.
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("ciphertext of {0} bytes is shorter than the 8 byte checksum")]
    TooShort(usize),
    #[error("checksum mismatch on message {counter}")]
    IntegrityFailure { counter: u64 },
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// JWT / key-service failure.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token is not a three-segment JWS")]
    Malformed,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm {0:?}, only ES384 is accepted")]
    UnsupportedAlgorithm(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("header is missing the x5u public key")]
    MissingX5u,
}

/// Key-material failure (SPKI / JWK import, curve mismatch).
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("not a valid secp384r1 SPKI public key")]
    InvalidSpki,
    #[error("unsupported curve {0:?}, expected secp384r1")]
    UnsupportedCurve(String),
    #[error("JWK coordinates are not a point on secp384r1")]
    InvalidCoordinates,
}

/// Login chain rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("login chain is empty")]
    EmptyChain,
    #[error("required claim {0:?} is missing")]
    MissingClaim(&'static str),
    #[error("chain root is not a trusted authority")]
    UntrustedRoot,
    #[error("login ServerAddress {presented:?} does not match the advertised address {expected:?}")]
    ServerAddressMismatch { presented: String, expected: String },
    #[error("identity provider: {0}")]
    Provider(#[source] anyhow::Error),
}

/// What the driver should do with a failed session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fatality {
    /// Log, drop the offending packet, keep the session alive.
    PerPacket,
    /// Send a Disconnect packet carrying the given message, then close.
    DisconnectWith(&'static str),
    /// Close immediately without a Disconnect packet.
    SilentClose,
}

/// Umbrella error surfaced by [`crate::session::Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("encryption: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("integration: {0}")]
    Integration(#[source] anyhow::Error),
}

impl SessionError {
    /// Maps the taxonomy onto tear-down behavior. Decode errors (malformed
    /// frames, truncated varints, unparseable packets) are per-packet: the
    /// session logs them, drops the offending data and continues. Cipher
    /// and compression failures stay fatal because the stream state becomes
    /// ambiguous.
    pub fn fatality(&self) -> Fatality {
        match self {
            SessionError::Transport(_) => Fatality::SilentClose,
            SessionError::Decode(_) => Fatality::PerPacket,
            SessionError::Compression(_) => Fatality::SilentClose,
            SessionError::Protocol(_) => Fatality::DisconnectWith("disconnectionScreen.badPacket"),
            // "version mismatch" keeps the widest range of stock clients happy.
            SessionError::Auth(_) => Fatality::DisconnectWith("disconnectionScreen.outdatedClient"),
            SessionError::Encryption(_) => Fatality::SilentClose,
            SessionError::Integration(_) => Fatality::SilentClose,
        }
    }
}
