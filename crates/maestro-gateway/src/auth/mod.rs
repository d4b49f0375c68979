//! Device pairing, per-device secrets, and short-lived access tokens.
//!
//! Authentication is challenge-response: the device secret never crosses the
//! wire after pairing. A captured access token is only good for fifteen
//! minutes and dies with device revocation.

pub mod devices;
pub mod pairing;
pub mod token;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use devices::DeviceRegistry;
use pairing::PairingStore;
use token::TokenSigner;

/// Challenge nonces are single-use and short-lived.
const CHALLENGE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("device revoked")]
    DeviceRevoked,
}

impl AuthError {
    /// Stable wire code surfaced in 401 bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken => "invalid_token",
            AuthError::DeviceRevoked => "device_revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Compare two byte strings without early exit. Length mismatch still
/// returns false, but all bytes of equal-length inputs are always visited.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

pub(crate) fn random_base64url(bytes: usize) -> String {
    use base64::Engine;
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Everything the gateway needs to answer "who is this".
pub struct AuthService {
    pub pairing: PairingStore,
    pub devices: DeviceRegistry,
    pub signer: TokenSigner,
    challenges: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl AuthService {
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            pairing: PairingStore::new(data_dir.join("pairing.json")),
            devices: DeviceRegistry::new(data_dir.join("devices.json")),
            signer: TokenSigner::load_or_create(&data_dir.join("token-secret.key"))?,
            challenges: Mutex::new(HashMap::new()),
        })
    }

    /// Issue a nonce bound to the device. Unknown or revoked devices get
    /// nothing.
    pub fn issue_challenge(&self, device_id: &str) -> Option<Challenge> {
        let device = self.devices.get(device_id)?;
        if device.revoked {
            return None;
        }

        let nonce = random_base64url(24);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(CHALLENGE_TTL).unwrap_or(chrono::Duration::seconds(60));

        let mut challenges = self.challenges.lock().unwrap_or_else(|p| p.into_inner());
        challenges.insert(device_id.to_string(), (nonce.clone(), expires_at));

        Some(Challenge { nonce, expires_at })
    }

    /// Check `sha256(secret + "\n" + deviceId + "\n" + nonce)` against the
    /// submitted signature. The nonce is consumed whether or not the
    /// signature matches.
    pub fn verify_challenge_signature(
        &self,
        device_id: &str,
        nonce: &str,
        signature: &str,
    ) -> bool {
        let Some(device) = self.devices.get(device_id) else {
            return false;
        };
        if device.revoked {
            return false;
        }

        let stored = {
            let mut challenges = self.challenges.lock().unwrap_or_else(|p| p.into_inner());
            challenges.remove(device_id)
        };
        let Some((stored_nonce, expires_at)) = stored else {
            debug!(device = %device_id, "no outstanding challenge");
            return false;
        };
        if Utc::now() >= expires_at || stored_nonce != nonce {
            return false;
        }

        let expected = sha256_hex(format!("{}\n{}\n{}", device.secret, device_id, nonce).as_bytes());
        constant_time_eq(expected.as_bytes(), signature.to_lowercase().as_bytes())
    }

    /// Validate a bearer token and the device behind it. A structurally
    /// valid token for a revoked device still fails.
    pub fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        let device_id = self.signer.verify(token).ok_or(AuthError::InvalidToken)?;

        let device = self.devices.get(&device_id).ok_or(AuthError::DeviceRevoked)?;
        if device.revoked {
            return Err(AuthError::DeviceRevoked);
        }

        self.devices.update_last_seen(&device_id);
        Ok(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, AuthService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = AuthService::open(dir.path()).expect("auth service");
        (dir, auth)
    }

    fn pair_device(auth: &AuthService, device_id: &str) -> String {
        auth.devices
            .register(device_id, None, None)
            .expect("register")
            .secret
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn challenge_response_happy_path_issues_token() {
        let (_dir, auth) = service();
        let secret = pair_device(&auth, "d1");

        let challenge = auth.issue_challenge("d1").expect("challenge");
        let signature = sha256_hex(format!("{}\n{}\n{}", secret, "d1", challenge.nonce).as_bytes());

        assert!(auth.verify_challenge_signature("d1", &challenge.nonce, &signature));

        let signed = auth.signer.sign("d1", Duration::from_secs(900));
        assert_eq!(auth.authenticate(&signed.token), Ok("d1".to_string()));
    }

    #[test]
    fn wrong_secret_signature_is_rejected() {
        let (_dir, auth) = service();
        pair_device(&auth, "d1");

        let challenge = auth.issue_challenge("d1").expect("challenge");
        let forged = sha256_hex(
            format!("{}\n{}\n{}", "not-the-secret", "d1", challenge.nonce).as_bytes(),
        );
        assert!(!auth.verify_challenge_signature("d1", &challenge.nonce, &forged));
    }

    #[test]
    fn challenge_is_single_use() {
        let (_dir, auth) = service();
        let secret = pair_device(&auth, "d1");

        let challenge = auth.issue_challenge("d1").expect("challenge");
        let signature = sha256_hex(format!("{}\n{}\n{}", secret, "d1", challenge.nonce).as_bytes());

        assert!(auth.verify_challenge_signature("d1", &challenge.nonce, &signature));
        // Replaying the same exchange fails: the nonce was consumed.
        assert!(!auth.verify_challenge_signature("d1", &challenge.nonce, &signature));
    }

    #[test]
    fn unknown_device_gets_no_challenge() {
        let (_dir, auth) = service();
        assert!(auth.issue_challenge("nobody").is_none());
    }

    #[test]
    fn revoked_device_fails_even_with_valid_token() {
        let (_dir, auth) = service();
        pair_device(&auth, "d1");

        let signed = auth.signer.sign("d1", Duration::from_secs(900));
        assert!(auth.authenticate(&signed.token).is_ok());

        auth.devices.revoke("d1");
        assert_eq!(
            auth.authenticate(&signed.token),
            Err(AuthError::DeviceRevoked)
        );
        assert!(auth.issue_challenge("d1").is_none());
    }

    #[test]
    fn signature_comparison_is_case_insensitive_on_hex() {
        let (_dir, auth) = service();
        let secret = pair_device(&auth, "d1");

        let challenge = auth.issue_challenge("d1").expect("challenge");
        let signature = sha256_hex(format!("{}\n{}\n{}", secret, "d1", challenge.nonce).as_bytes())
            .to_uppercase();
        assert!(auth.verify_challenge_signature("d1", &challenge.nonce, &signature));
    }
}
