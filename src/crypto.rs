//! Cryptographic services: secp384r1 keys and ECDH, ES384 JWTs, and the
//! per-session symmetric stream cipher.

pub mod encryptor;
pub mod jwt;
pub mod keys;

pub use encryptor::{derive_secret_hash, Encryptor, HANDSHAKE_SALT};
pub use keys::KeyPair;
