//! Short-lived signed access tokens.
//!
//! Format: `base64url(payload-json) + "." + hex(keyed-digest)`, where the
//! digest is a label-prefixed sha256 over the server secret and the encoded
//! payload. The 32-byte server secret is generated once and persists across
//! restarts, so outstanding tokens survive a daemon bounce.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::constant_time_eq;

const SIGNING_LABEL: &[u8] = b"maestro-token-v1";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    device_id: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    /// Load the persisted server secret, generating and writing one on
    /// first run.
    pub fn load_or_create(path: &Path) -> std::io::Result<Self> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(secret) = hex::decode(raw.trim()) {
                if !secret.is_empty() {
                    return Ok(Self { secret });
                }
            }
        }

        let mut secret = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        std::fs::write(path, hex::encode(&secret))?;
        Ok(Self { secret })
    }

    #[cfg(test)]
    pub fn from_secret(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    fn digest(&self, payload_b64: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(SIGNING_LABEL);
        hasher.update(&self.secret);
        hasher.update(payload_b64.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn sign(&self, device_id: &str, ttl: Duration) -> SignedToken {
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(900));

        let payload = TokenPayload {
            device_id: device_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&payload).expect("token payload serializes"),
        );
        let signature = self.digest(&payload_b64);

        SignedToken {
            token: format!("{payload_b64}.{signature}"),
            expires_at,
        }
    }

    /// Returns the device id for a well-formed, correctly signed, unexpired
    /// token; `None` otherwise.
    pub fn verify(&self, token: &str) -> Option<String> {
        let (payload_b64, signature) = token.split_once('.')?;

        let expected = self.digest(payload_b64);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return None;
        }

        let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()?;
        let payload: TokenPayload = serde_json::from_slice(&payload_bytes).ok()?;

        if Utc::now().timestamp() >= payload.exp {
            return None;
        }
        Some(payload.device_id)
    }
}
