//! Toolkit for speaking Minecraft Bedrock Edition's game protocol on top
//! of RakNet/UDP.
//!
//! Three personas share one protocol core:
//! * an outbound [`client::Client`] that authenticates to a server,
//! * an inbound [`server::Server`] that accepts clients,
//! * a [`bridge::Bridge`] that is simultaneously a server to a real client
//!   and a client to a real server, observing and optionally mutating
//!   every game packet in flight.
//!
//! The core is the per-connection [`session::Session`]: it negotiates
//! network settings, drives the Login/Handshake sequence (ECDH key
//! agreement over JWT chains), installs AES-256-CFB8 encryption with
//! counter-bound checksums, batches sub-packets behind threshold-gated
//! compression, and dispatches typed packets to observers.
//!
//! RakNet itself is an external collaborator: the pipeline exchanges
//! opaque encapsulated datagrams through the channel pair in
//! [`transport`], and the reliability/ordering layer lives on the other
//! side of it.

pub mod auth;
pub mod bridge;
pub mod client;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use error::SessionError;
pub use protocol::{PROTOCOL_VERSION, GAME_PACKET_HEADER};
