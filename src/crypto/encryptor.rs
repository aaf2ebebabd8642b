//! Symmetric encryption for one session.
//!
//! AES-256-CFB8 in both directions, keyed by the handshake secret hash.
//! The cipher state is a single continuous stream per direction; the IV
//! only seeds the first message. Every message carries a trailing 8-byte
//! checksum binding it to its position in the stream, so a replayed or
//! reordered ciphertext fails integrity even though it would decrypt.

use crate::error::EncryptionError;
use aes::{cipher::generic_array::GenericArray, Aes256};
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use std::slice;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// The fixed key-derivation salt: the UTF-8 bytes of the salt emoji.
pub const HANDSHAKE_SALT: [u8; 4] = [0xF0, 0x9F, 0xA7, 0x82];

/// Derives the 256-bit symmetric key from the handshake salt and the raw
/// ECDH shared secret.
pub fn derive_secret_hash(salt: &[u8], shared_secret: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(shared_secret);
    Zeroizing::new(hasher.finalize().into())
}

/// Both directions of a session's cipher. A session has exactly one of
/// these; the two counters are independent and never reset.
pub struct Encryptor {
    key: Zeroizing<[u8; 32]>,
    send: cfb8::Encryptor<Aes256>,
    recv: cfb8::Decryptor<Aes256>,
    send_counter: u64,
    recv_counter: u64,
}

impl Encryptor {
    /// Builds the cipher pair from the secret hash. The IV is the first
    /// 16 bytes of the key.
    pub fn new(secret_hash: &[u8; 32]) -> Self {
        let iv: [u8; 16] = secret_hash[..16].try_into().expect("slice length is 16");
        Self {
            key: Zeroizing::new(*secret_hash),
            send: cfb8::Encryptor::new(secret_hash.into(), &iv.into()),
            recv: cfb8::Decryptor::new(secret_hash.into(), &iv.into()),
            send_counter: 0,
            recv_counter: 0,
        }
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u64 {
        self.recv_counter
    }

    /// Encrypts one outbound message: appends the counter-bound checksum,
    /// advances the cipher stream and the send counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let checksum = self.checksum(self.send_counter, plaintext);
        let mut payload = Vec::with_capacity(plaintext.len() + checksum.len());
        payload.extend_from_slice(plaintext);
        payload.extend_from_slice(&checksum);

        for byte in &mut payload {
            self.send
                .encrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
        }
        self.send_counter += 1;
        payload
    }

    /// Decrypts one inbound message and checks its trailing checksum in
    /// constant time. A mismatch is fatal for the session.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() < 8 {
            return Err(EncryptionError::TooShort(ciphertext.len()));
        }

        let mut payload = ciphertext.to_vec();
        for byte in &mut payload {
            self.recv
                .decrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
        }

        let plaintext_len = payload.len() - 8;
        let expected = self.checksum(self.recv_counter, &payload[..plaintext_len]);
        if expected
            .as_slice()
            .ct_eq(&payload[plaintext_len..])
            .unwrap_u8()
            == 0
        {
            return Err(EncryptionError::IntegrityFailure {
                counter: self.recv_counter,
            });
        }

        self.recv_counter += 1;
        payload.truncate(plaintext_len);
        Ok(payload)
    }

    /// `SHA-256(counter_le ∥ plaintext ∥ key)`, truncated to 8 bytes.
    fn checksum(&self, counter: u64, plaintext: &[u8]) -> [u8; 8] {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(plaintext);
        hasher.update(&*self.key);
        hasher.finalize()[..8].try_into().expect("digest is 32 bytes")
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Encryptor, Encryptor) {
        let hash = derive_secret_hash(&HANDSHAKE_SALT, &[7u8; 48]);
        (Encryptor::new(&hash), Encryptor::new(&hash))
    }

    #[test]
    fn long_stream_roundtrip() {
        let (mut sender, mut receiver) = pair();
        for i in 0..1000u32 {
            let plaintext = format!("message number {i}").into_bytes();
            let ciphertext = sender.encrypt(&plaintext);
            assert_eq!(receiver.decrypt(&ciphertext).unwrap(), plaintext);
        }
        assert_eq!(sender.send_counter(), 1000);
        assert_eq!(receiver.recv_counter(), 1000);
    }

    #[test]
    fn tampered_ciphertext_fails_integrity() {
        let (mut sender, mut receiver) = pair();
        for _ in 0..499 {
            let ciphertext = sender.encrypt(b"filler");
            receiver.decrypt(&ciphertext).unwrap();
        }
        let mut ciphertext = sender.encrypt(b"the five hundredth");
        ciphertext[3] ^= 0x01;
        assert!(matches!(
            receiver.decrypt(&ciphertext),
            Err(EncryptionError::IntegrityFailure { counter: 499 })
        ));
    }

    #[test]
    fn replayed_ciphertext_fails_checksum() {
        let (mut sender, mut receiver) = pair();
        let first = sender.encrypt(b"once");
        receiver.decrypt(&first).unwrap();
        // Same bytes again: the receive counter (and cipher stream) have
        // moved on, so the checksum cannot match.
        assert!(receiver.decrypt(&first).is_err());
    }

    #[test]
    fn directions_are_independent() {
        let (mut a, mut b) = pair();
        let c2s = a.encrypt(b"client to server");
        let s2c = b.encrypt(b"server to client");
        assert_eq!(b.decrypt(&c2s).unwrap(), b"client to server");
        assert_eq!(a.decrypt(&s2c).unwrap(), b"server to client");
        assert_eq!(a.send_counter(), 1);
        assert_eq!(a.recv_counter(), 1);
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let (_, mut receiver) = pair();
        assert!(matches!(
            receiver.decrypt(&[1, 2, 3]),
            Err(EncryptionError::TooShort(3))
        ));
    }
}
