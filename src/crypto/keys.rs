//! secp384r1 key material.
//!
//! Every session owns one keypair. Its SPKI public-key encoding, as base64
//! DER, is the `x5u` value carried in JWT headers; the private half never
//! leaves the session.

use crate::error::KeyError;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL},
    Engine as _,
};
use p384::{
    ecdh,
    ecdsa::SigningKey,
    elliptic_curve::{generic_array::GenericArray, sec1::FromEncodedPoint},
    pkcs8::{DecodePublicKey, EncodePublicKey},
    EncodedPoint, PublicKey, SecretKey,
};
use rand_core::OsRng;
use serde::Deserialize;
use zeroize::Zeroizing;

/// A session's secp384r1 keypair with its cached `x5u` encoding.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
    x5u: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let x5u = encode_x5u(&public);
        Self {
            secret,
            public,
            x5u,
        }
    }

    /// Base64 SPKI DER of the public key, as carried in JWT headers.
    pub fn x5u(&self) -> &str {
        &self.x5u
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from(&self.secret)
    }

    /// Raw 48-byte ECDH shared secret with the peer's public key.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Zeroizing<[u8; 48]> {
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut secret = Zeroizing::new([0u8; 48]);
        secret.copy_from_slice(shared.raw_secret_bytes());
        secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("x5u", &self.x5u).finish()
    }
}

/// Encodes a public key as base64 SPKI DER.
pub fn encode_x5u(public: &PublicKey) -> String {
    let der = public
        .to_public_key_der()
        .expect("SPKI encoding of a P-384 point cannot fail");
    BASE64.encode(der.as_bytes())
}

/// Decodes an `x5u` header value back into a public key.
pub fn public_key_from_x5u(x5u: &str) -> Result<PublicKey, KeyError> {
    let der = BASE64.decode(x5u)?;
    PublicKey::from_public_key_der(&der).map_err(|_| KeyError::InvalidSpki)
}

/// An EC JWK as found in some identity-provider responses.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

/// Decodes a JWK `{x,y}` point, normalizing the curve name aliases
/// (`P-384` ↔ `secp384r1`).
pub fn public_key_from_jwk(jwk: &Jwk) -> Result<PublicKey, KeyError> {
    match jwk.crv.to_ascii_lowercase().as_str() {
        "p-384" | "secp384r1" => {}
        _ => return Err(KeyError::UnsupportedCurve(jwk.crv.clone())),
    }

    let x = BASE64_URL.decode(&jwk.x)?;
    let y = BASE64_URL.decode(&jwk.y)?;
    if x.len() != 48 || y.len() != 48 {
        return Err(KeyError::InvalidCoordinates);
    }

    let point = EncodedPoint::from_affine_coordinates(
        GenericArray::from_slice(&x),
        GenericArray::from_slice(&y),
        false,
    );
    Option::from(PublicKey::from_encoded_point(&point)).ok_or(KeyError::InvalidCoordinates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x5u_roundtrip() {
        let pair = KeyPair::generate();
        let public = public_key_from_x5u(pair.x5u()).unwrap();
        assert_eq!(&public, pair.public_key());
    }

    #[test]
    fn ecdh_agrees_both_ways() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ab = alice.diffie_hellman(bob.public_key());
        let ba = bob.diffie_hellman(alice.public_key());
        assert_eq!(*ab, *ba);

        let carol = KeyPair::generate();
        assert_ne!(*alice.diffie_hellman(carol.public_key()), *ab);
    }

    #[test]
    fn jwk_import_matches_spki() {
        use p384::elliptic_curve::sec1::ToEncodedPoint;

        let pair = KeyPair::generate();
        let point = pair.public_key().to_encoded_point(false);
        let jwk = Jwk {
            kty: "EC".to_owned(),
            crv: "P-384".to_owned(),
            x: BASE64_URL.encode(point.x().unwrap()),
            y: BASE64_URL.encode(point.y().unwrap()),
        };
        assert_eq!(&public_key_from_jwk(&jwk).unwrap(), pair.public_key());

        let alias = Jwk {
            crv: "secp384r1".to_owned(),
            ..jwk.clone()
        };
        assert_eq!(&public_key_from_jwk(&alias).unwrap(), pair.public_key());

        let bad = Jwk {
            crv: "P-256".to_owned(),
            ..jwk
        };
        assert!(matches!(
            public_key_from_jwk(&bad),
            Err(KeyError::UnsupportedCurve(_))
        ));
    }
}
