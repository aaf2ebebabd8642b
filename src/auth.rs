//! Produces and consumes login chains.
//!
//! Both the offline (self-signed) and online paths yield the same logical
//! artifact: an identity chain proving who the user is plus a single
//! user-chain token carrying the client payload. The online identity
//! provider itself (device-code flows, Xbox Live HTTP) is an external
//! collaborator behind the [`IdentityProvider`] trait; this module only
//! caches its user tokens on disk and verifies what it returns.

use crate::{
    crypto::{
        jwt::{self, SignOptions},
        keys::KeyPair,
    },
    error::AuthError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use uuid::Uuid;

/// Title id presented by offline chains; the stock Android client's.
const OFFLINE_TITLE_ID: &str = "89692877";

/// Who the peer is, derived from the deepest token of the login chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub identity: Uuid,
    /// Zero for offline sessions.
    pub xuid: String,
}

/// The user-chain claims: skin blob, device fingerprints, input modes and
/// the address the client believes it is connecting to. Unmodeled fields
/// ride along in `extra` so a bridge can forward them untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "ServerAddress")]
    pub server_address: String,
    #[serde(rename = "ThirdPartyName")]
    pub third_party_name: String,
    #[serde(rename = "SelfSignedId")]
    pub self_signed_id: Uuid,
    #[serde(rename = "ClientRandomId")]
    pub client_random_id: i64,
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    #[serde(rename = "DeviceModel")]
    pub device_model: String,
    #[serde(rename = "DeviceOS")]
    pub device_os: i32,
    #[serde(rename = "PlatformType")]
    pub platform_type: i32,
    #[serde(rename = "CurrentInputMode")]
    pub current_input_mode: i32,
    #[serde(rename = "DefaultInputMode")]
    pub default_input_mode: i32,
    #[serde(rename = "GuiScale")]
    pub gui_scale: i32,
    #[serde(rename = "MaxViewDistance")]
    pub max_view_distance: i32,
    #[serde(rename = "LanguageCode")]
    pub language_code: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Payload {
    /// A plausible Android handheld fingerprint for the given username and
    /// destination.
    pub fn offline(username: &str, server_address: &str) -> Self {
        Self {
            server_address: server_address.to_owned(),
            third_party_name: username.to_owned(),
            self_signed_id: offline_identity(username),
            client_random_id: i64::from_le_bytes(
                Sha256::digest(username.as_bytes())[..8]
                    .try_into()
                    .expect("digest is 32 bytes"),
            ),
            device_id: offline_identity(username).to_string(),
            device_model: "generic".to_owned(),
            device_os: 1, // android
            platform_type: 0,
            current_input_mode: 1,
            default_input_mode: 1,
            gui_scale: 0,
            max_view_distance: 10,
            language_code: "en_US".to_owned(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A complete login artifact: identity chain plus user chain.
#[derive(Debug, Clone)]
pub struct LoginChain {
    pub identity_chain: Vec<String>,
    pub user_chain: String,
}

impl LoginChain {
    /// The `{"chain":[...]}` document carried inside the Login packet.
    pub fn chain_json(&self) -> String {
        json!({ "chain": self.identity_chain }).to_string()
    }

    /// Parses the Login packet's chain document.
    pub fn parse_chain_json(chain_json: &str, user_jwt: &str) -> Result<Self, AuthError> {
        #[derive(Deserialize)]
        struct ChainDocument {
            chain: Vec<String>,
        }
        let document: ChainDocument =
            serde_json::from_str(chain_json).map_err(|e| AuthError::Jwt(e.into()))?;
        if document.chain.is_empty() {
            return Err(AuthError::EmptyChain);
        }
        Ok(Self {
            identity_chain: document.chain,
            user_chain: user_jwt.to_owned(),
        })
    }
}

/// Deterministic offline UUID for a username.
pub fn offline_identity(username: &str) -> Uuid {
    Uuid::new_v3(&Uuid::NAMESPACE_URL, username.as_bytes())
}

/// Builds a self-signed login chain for an offline session.
pub fn create_offline(
    key: &KeyPair,
    username: &str,
    payload: &Payload,
) -> Result<LoginChain, AuthError> {
    let identity = offline_identity(username);
    let identity_token = jwt::sign(
        json!({
            "extraData": {
                "displayName": username,
                "identity": identity,
                "XUID": "0",
                "titleId": OFFLINE_TITLE_ID,
            },
            "certificateAuthority": true,
            "identityPublicKey": key.x5u(),
        }),
        key,
        &SignOptions {
            expires_in: Some(3600),
            issuer: Some("self".to_owned()),
        },
    )?;

    let user_token = jwt::sign(
        serde_json::to_value(payload).map_err(|e| AuthError::Jwt(e.into()))?,
        key,
        &SignOptions::default(),
    )?;

    Ok(LoginChain {
        identity_chain: vec![identity_token],
        user_chain: user_token,
    })
}

/// External source of pre-signed identity chains (Xbox Live). May block on
/// network I/O; callers drive it off the session executor.
pub trait IdentityProvider: Send + Sync {
    /// Returns the identity chain for the session key. The tokens must end
    /// in a payload whose `identityPublicKey` is the session's `x5u`.
    fn fetch_chain(&self, session_key: &KeyPair) -> anyhow::Result<Vec<String>>;
}

/// Builds a login chain from an online identity provider, signing the user
/// chain with the session key.
pub fn create_online(
    provider: &dyn IdentityProvider,
    key: &KeyPair,
    payload: &Payload,
) -> Result<LoginChain, AuthError> {
    let identity_chain = provider
        .fetch_chain(key)
        .map_err(AuthError::Provider)?;
    if identity_chain.is_empty() {
        return Err(AuthError::EmptyChain);
    }
    let user_token = jwt::sign(
        serde_json::to_value(payload).map_err(|e| AuthError::Jwt(e.into()))?,
        key,
        &SignOptions::default(),
    )?;
    Ok(LoginChain {
        identity_chain,
        user_chain: user_token,
    })
}

/// Result of verifying an inbound Login.
#[derive(Debug)]
pub struct VerifiedLogin {
    pub profile: Profile,
    pub payload: Payload,
    /// Base64 SPKI the encryption handshake must be bound to.
    pub identity_public_key: String,
    /// Whether the chain roots in the trusted authority.
    pub verified: bool,
}

/// Verifies an inbound identity chain plus user chain. `require_trusted`
/// rejects self-signed chains (online-only servers).
pub fn verify_login(
    chain: &LoginChain,
    require_trusted: bool,
) -> Result<VerifiedLogin, AuthError> {
    let verified = jwt::verify_chain(&chain.identity_chain)?;
    if require_trusted && !verified.verified {
        return Err(AuthError::UntrustedRoot);
    }

    let extra = verified
        .extra_data
        .as_ref()
        .ok_or(AuthError::MissingClaim("extraData"))?;
    let profile = Profile {
        display_name: extra
            .get("displayName")
            .and_then(Value::as_str)
            .ok_or(AuthError::MissingClaim("displayName"))?
            .to_owned(),
        identity: extra
            .get("identity")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(AuthError::MissingClaim("identity"))?,
        xuid: extra
            .get("XUID")
            .and_then(Value::as_str)
            .unwrap_or("0")
            .to_owned(),
    };

    let user_claims = jwt::verify_with_x5u(&chain.user_chain, &verified.identity_public_key)?;
    let payload: Payload =
        serde_json::from_value(user_claims).map_err(|e| AuthError::Jwt(e.into()))?;

    Ok(VerifiedLogin {
        profile,
        payload,
        identity_public_key: verified.identity_public_key,
        verified: verified.verified,
    })
}

/// One cached Xbox Live user token, the on-disk JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedUserToken {
    #[serde(rename = "userToken")]
    pub user_token: String,
    #[serde(rename = "userHash")]
    pub user_hash: String,
    #[serde(rename = "notAfter")]
    pub not_after: String,
    #[serde(rename = "obtainedOn")]
    pub obtained_on: u64,
}

/// The shared tokens directory. Sessions using the same profile folder
/// share it; writes go through a process-wide guard so concurrent logins
/// cannot interleave partial files.
#[derive(Debug, Clone)]
pub struct TokenCache {
    directory: PathBuf,
}

static CACHE_WRITE_GUARD: Mutex<()> = Mutex::new(());

impl TokenCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path_for(&self, email: &str) -> PathBuf {
        let digest = Sha256::digest(email.as_bytes());
        let mut hash = String::with_capacity(64);
        for byte in digest {
            hash.push_str(&format!("{byte:02x}"));
        }
        self.directory.join(format!("{hash}_xbl-user-cache.json"))
    }

    /// Loads the cached token for a profile, if any. Unreadable or
    /// unparseable files are treated as absent.
    pub fn load(&self, email: &str) -> Option<CachedUserToken> {
        let bytes = fs::read(self.path_for(email)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!("Discarding corrupt token cache entry: {e}");
                None
            }
        }
    }

    pub fn store(&self, email: &str, token: &CachedUserToken) -> anyhow::Result<()> {
        let _guard = CACHE_WRITE_GUARD
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        fs::create_dir_all(&self.directory)?;
        let path = self.path_for(email);
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, serde_json::to_vec(token)?)?;
        fs::rename(&staged, &path)?;
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
