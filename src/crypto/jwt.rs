//! ES384 raw-JOSE signing and verification.
//!
//! Tokens carry a custom header `{alg, x5u}` and deliberately no `typ`
//! field; stock servers reject chains whose headers deviate from that
//! shape. Chain verification walks the tokens in order, requiring each
//! token to be signed by the `identityPublicKey` claim of the previously
//! verified payload.

use crate::{
    crypto::keys::{self, KeyPair},
    error::JwtError,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine as _};
use p384::ecdsa::{
    signature::{Signer, Verifier},
    Signature, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mojang's root signing key. A chain containing this `x5u` anywhere is a
/// chain vouched for by Xbox Live.
pub const MOJANG_ROOT_X5U: &str = "MHYwEAYHKoZIzj0CAQYFK4EEACIDYgAECRXueJeTDqNRRgJi/vlRufByu/2G0i2Ebt6YMar5QX/R0DIIyrJMcUpruK4QveTfJSTp3Shlq4Gk34cD/4GUWwkv0DVuzeuB+tXija7HBxii03NHDbPAD0AKnLr2wdAp";

/// JOSE header of an identity-chain token. Serialized field order matters
/// to some historical verifiers, so the struct declares `alg` first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5u: Option<String>,
}

/// Knobs for [`sign`]. Defaults match the user-chain shape: no registered
/// claims added at all.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// Adds `nbf`/`iat` at now and `exp` at now + this many seconds.
    pub expires_in: Option<u64>,
    pub issuer: Option<String>,
}

/// Signs `claims` as an ES384 JWS with the session key's `x5u` in the
/// header.
pub fn sign(claims: Value, key: &KeyPair, options: &SignOptions) -> Result<String, JwtError> {
    let mut claims = match claims {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_owned(), other);
            map
        }
    };

    if let Some(expires_in) = options.expires_in {
        let now = unix_now();
        claims.insert("nbf".to_owned(), now.into());
        claims.insert("iat".to_owned(), now.into());
        claims.insert("exp".to_owned(), (now + expires_in).into());
    }
    if let Some(issuer) = &options.issuer {
        claims.insert("iss".to_owned(), issuer.clone().into());
    }

    let header = Header {
        alg: "ES384".to_owned(),
        x5u: Some(key.x5u().to_owned()),
    };

    let signing_input = format!(
        "{}.{}",
        BASE64_URL.encode(serde_json::to_vec(&header)?),
        BASE64_URL.encode(serde_json::to_vec(&Value::Object(claims))?),
    );
    let signature: Signature = key.signing_key().sign(signing_input.as_bytes());
    Ok(format!(
        "{signing_input}.{}",
        BASE64_URL.encode(signature.to_bytes())
    ))
}

/// Splits a token and decodes header and claims without checking the
/// signature. Used to peek at `x5u` before the key is known.
pub fn decode_unverified(token: &str) -> Result<(Header, Value), JwtError> {
    let (header_b64, claims_b64, _) = split(token)?;
    let header: Header = serde_json::from_slice(&BASE64_URL.decode(header_b64)?)?;
    let claims: Value = serde_json::from_slice(&BASE64_URL.decode(claims_b64)?)?;
    Ok((header, claims))
}

/// Verifies a token against the key in the given `x5u` and returns its
/// claims.
pub fn verify_with_x5u(token: &str, x5u: &str) -> Result<Value, JwtError> {
    let public = keys::public_key_from_x5u(x5u)?;
    verify_with_key(token, &VerifyingKey::from(public))
}

/// Verifies a token against a known key and returns its claims.
pub fn verify_with_key(token: &str, key: &VerifyingKey) -> Result<Value, JwtError> {
    let (header_b64, claims_b64, signature_b64) = split(token)?;

    let header: Header = serde_json::from_slice(&BASE64_URL.decode(header_b64)?)?;
    if header.alg != "ES384" {
        return Err(JwtError::UnsupportedAlgorithm(header.alg));
    }

    let signature_bytes = BASE64_URL.decode(signature_b64)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| JwtError::BadSignature)?;

    let signing_input_len = header_b64.len() + 1 + claims_b64.len();
    key.verify(token[..signing_input_len].as_bytes(), &signature)
        .map_err(|_| JwtError::BadSignature)?;

    Ok(serde_json::from_slice(&BASE64_URL.decode(claims_b64)?)?)
}

/// Outcome of walking an identity chain.
#[derive(Debug)]
pub struct VerifiedChain {
    /// Whether the Mojang root key appeared anywhere in the chain.
    /// Self-signed chains still parse, with this set to false.
    pub verified: bool,
    /// `identityPublicKey` of the final payload; the key the user chain
    /// and the encryption handshake are bound to.
    pub identity_public_key: String,
    /// `extraData` of the payload that carried it (the deepest token).
    pub extra_data: Option<Value>,
    pub payloads: Vec<Value>,
}

/// Verifies a chain of tokens where the `x5u` of token *i+1* must equal
/// the `identityPublicKey` claim of the verified payload of token *i*.
pub fn verify_chain(chain: &[String]) -> Result<VerifiedChain, JwtError> {
    let first = chain.first().ok_or(JwtError::Malformed)?;
    let (header, _) = decode_unverified(first)?;
    let mut current_x5u = header.x5u.ok_or(JwtError::MissingX5u)?;

    let mut verified = false;
    let mut extra_data = None;
    let mut payloads = Vec::with_capacity(chain.len());

    for token in chain {
        if current_x5u == MOJANG_ROOT_X5U {
            verified = true;
        }
        let claims = verify_with_x5u(token, &current_x5u)?;
        if let Some(data) = claims.get("extraData") {
            extra_data = Some(data.clone());
        }
        current_x5u = claims
            .get("identityPublicKey")
            .and_then(Value::as_str)
            .ok_or(JwtError::MissingX5u)?
            .to_owned();
        payloads.push(claims);
    }
    if current_x5u == MOJANG_ROOT_X5U {
        verified = true;
    }

    Ok(VerifiedChain {
        verified,
        identity_public_key: current_x5u,
        extra_data,
        payloads,
    })
}

fn split(token: &str) -> Result<(&str, &str, &str), JwtError> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(signature), None) => Ok((header, claims, signature)),
        _ => Err(JwtError::Malformed),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_verify_roundtrip() {
        let key = KeyPair::generate();
        let token = sign(json!({"hello": "world"}), &key, &SignOptions::default()).unwrap();
        let claims = verify_with_x5u(&token, key.x5u()).unwrap();
        assert_eq!(claims["hello"], "world");
        // no registered claims unless asked for
        assert!(claims.get("exp").is_none());
    }

    #[test]
    fn header_has_no_typ() {
        let key = KeyPair::generate();
        let token = sign(json!({}), &key, &SignOptions::default()).unwrap();
        let header_json = BASE64_URL
            .decode(token.split('.').next().unwrap())
            .unwrap();
        let header: Value = serde_json::from_slice(&header_json).unwrap();
        assert!(header.get("typ").is_none());
        assert_eq!(header["alg"], "ES384");
        assert_eq!(header["x5u"], key.x5u());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let token = sign(json!({"a": 1}), &key, &SignOptions::default()).unwrap();
        assert!(matches!(
            verify_with_x5u(&token, other.x5u()),
            Err(JwtError::BadSignature)
        ));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let key = KeyPair::generate();
        let token = sign(json!({"xuid": "0"}), &key, &SignOptions::default()).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = BASE64_URL.encode(br#"{"xuid":"1234"}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(verify_with_x5u(&forged_token, key.x5u()).is_err());
    }

    #[test]
    fn self_signed_chain_parses_unverified() {
        let key = KeyPair::generate();
        let token = sign(
            json!({
                "certificateAuthority": true,
                "identityPublicKey": key.x5u(),
                "extraData": {"displayName": "Steve"},
            }),
            &key,
            &SignOptions {
                expires_in: Some(3600),
                issuer: Some("self".to_owned()),
            },
        )
        .unwrap();

        let chain = verify_chain(&[token]).unwrap();
        assert!(!chain.verified);
        assert_eq!(chain.identity_public_key, key.x5u());
        assert_eq!(chain.extra_data.unwrap()["displayName"], "Steve");
    }

    #[test]
    fn broken_link_is_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        // Token one points at `a` but token two is signed by `b`.
        let one = sign(
            json!({"identityPublicKey": a.x5u()}),
            &a,
            &SignOptions::default(),
        )
        .unwrap();
        let two = sign(
            json!({"identityPublicKey": b.x5u()}),
            &b,
            &SignOptions::default(),
        )
        .unwrap();
        assert!(verify_chain(&[one, two]).is_err());
    }
}
