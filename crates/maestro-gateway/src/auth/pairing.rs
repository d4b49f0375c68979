//! PIN-gated pairing window.
//!
//! Only the PIN's sha256 is stored. One window is active at a time; each
//! `start_pairing` overwrites the previous state. Exhausting the attempt
//! budget or the expiry makes the window permanently invalid until a new
//! window is opened. State is file-backed so a restart mid-window does not
//! reopen an exhausted one.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{constant_time_eq, random_base64url, sha256_hex};

const LOCAL_MAX_ATTEMPTS: u32 = 3;
const REMOTE_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_PAIRING_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingState {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pin_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    mode: PairingMode,
    /// Extra bearer token required before the PIN is even checked when the
    /// window was opened for tunnel pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_token: Option<String>,
    attempts: u32,
    max_attempts: u32,
}

impl Default for PairingState {
    fn default() -> Self {
        Self {
            active: false,
            pin_hash: None,
            expires_at: None,
            mode: PairingMode::Local,
            remote_token: None,
            attempts: 0,
            max_attempts: LOCAL_MAX_ATTEMPTS,
        }
    }
}

impl PairingState {
    fn is_active(&self) -> bool {
        self.active
            && self.attempts < self.max_attempts
            && self
                .expires_at
                .map(|expiry| Utc::now() < expiry)
                .unwrap_or(false)
    }
}

/// Returned once from `start_pairing`; the plaintext PIN is never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStarted {
    pub pin: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatus {
    pub active: bool,
    pub mode: PairingMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub seconds_left: i64,
}

pub struct PairingStore {
    path: PathBuf,
}

impl PairingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> PairingState {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => PairingState::default(),
        }
    }

    fn save(&self, state: &PairingState) {
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), "failed to persist pairing state: {e}");
                }
            }
            Err(e) => warn!("failed to serialize pairing state: {e}"),
        }
    }

    /// Open a fresh pairing window, replacing any previous one.
    pub fn start_pairing(&self, duration: Duration, remote: bool) -> PairingStarted {
        let pin = format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000u32));
        let expires_at = Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::seconds(60));
        let remote_token = remote.then(|| random_base64url(24));

        let state = PairingState {
            active: true,
            pin_hash: Some(sha256_hex(pin.as_bytes())),
            expires_at: Some(expires_at),
            mode: if remote { PairingMode::Remote } else { PairingMode::Local },
            remote_token: remote_token.clone(),
            attempts: 0,
            max_attempts: if remote { REMOTE_MAX_ATTEMPTS } else { LOCAL_MAX_ATTEMPTS },
        };
        self.save(&state);

        PairingStarted {
            pin,
            expires_at,
            remote_token,
        }
    }

    pub fn stop_pairing(&self) {
        self.save(&PairingState::default());
    }

    pub fn is_active(&self) -> bool {
        self.load().is_active()
    }

    /// Constant-time PIN check. A miss burns one attempt and persists the
    /// counter immediately.
    pub fn verify_pin(&self, pin: &str) -> bool {
        let mut state = self.load();
        if !state.is_active() {
            return false;
        }
        let Some(stored_hash) = state.pin_hash.clone() else {
            return false;
        };

        let submitted = sha256_hex(pin.as_bytes());
        let valid = constant_time_eq(submitted.as_bytes(), stored_hash.as_bytes());

        if !valid {
            state.attempts += 1;
            self.save(&state);
        }
        valid
    }

    /// Remote-mode gate: the opaque token handed out at `start_pairing` must
    /// match before a PIN check is attempted from a tunnel.
    pub fn verify_remote_token(&self, token: &str) -> bool {
        let state = self.load();
        if !state.is_active() || state.mode != PairingMode::Remote {
            return false;
        }
        match &state.remote_token {
            Some(expected) => constant_time_eq(expected.as_bytes(), token.as_bytes()),
            None => false,
        }
    }

    pub fn status(&self) -> PairingStatus {
        let state = self.load();
        let active = state.is_active();
        let expires_at = if active { state.expires_at } else { None };
        let seconds_left = expires_at
            .map(|expiry| ((expiry - Utc::now()).num_milliseconds() as f64 / 1000.0).ceil() as i64)
            .map(|secs| secs.max(0))
            .unwrap_or(0);

        PairingStatus {
            active,
            mode: state.mode,
            expires_at,
            seconds_left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PairingStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PairingStore::new(dir.path().join("pairing.json"));
        (dir, store)
    }

    #[test]
    fn start_returns_six_digit_pin_and_activates() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_secs(60), false);

        assert_eq!(started.pin.len(), 6);
        assert!(started.pin.chars().all(|c| c.is_ascii_digit()));
        assert!(started.remote_token.is_none());
        assert!(store.is_active());
    }

    #[test]
    fn correct_pin_verifies_wrong_pin_burns_attempt() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_secs(60), false);

        assert!(!store.verify_pin("000000") || started.pin == "000000");
        assert!(store.verify_pin(&started.pin));
    }

    #[test]
    fn attempt_budget_exhaustion_is_permanent_for_the_window() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_secs(60), false);

        // A wrong guess distinct from the real PIN.
        let wrong = if started.pin == "111111" { "222222" } else { "111111" };
        for _ in 0..LOCAL_MAX_ATTEMPTS {
            assert!(!store.verify_pin(wrong));
        }

        // Budget gone: even the correct PIN now fails.
        assert!(!store.verify_pin(&started.pin));
        assert!(!store.is_active());

        // A new window resets the budget.
        let restarted = store.start_pairing(Duration::from_secs(60), false);
        assert!(store.verify_pin(&restarted.pin));
    }

    #[test]
    fn expired_window_is_inactive() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_millis(0), false);
        assert!(!store.is_active());
        assert!(!store.verify_pin(&started.pin));
    }

    #[test]
    fn remote_mode_issues_token_and_gates_on_it() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_secs(60), true);
        let token = started.remote_token.expect("remote token");

        assert!(store.verify_remote_token(&token));
        assert!(!store.verify_remote_token("forged"));

        // Local windows never accept remote tokens.
        store.start_pairing(Duration::from_secs(60), false);
        assert!(!store.verify_remote_token(&token));
    }

    #[test]
    fn stop_pairing_closes_the_window() {
        let (_dir, store) = store();
        let started = store.start_pairing(Duration::from_secs(60), false);
        store.stop_pairing();
        assert!(!store.is_active());
        assert!(!store.verify_pin(&started.pin));
    }

    #[test]
    fn state_survives_reopen_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pairing.json");

        let started = PairingStore::new(path.clone()).start_pairing(Duration::from_secs(60), false);

        // A fresh store over the same file sees the same window.
        let reopened = PairingStore::new(path);
        assert!(reopened.is_active());
        assert!(reopened.verify_pin(&started.pin));
    }

    #[test]
    fn status_reports_remaining_window() {
        let (_dir, store) = store();
        store.start_pairing(Duration::from_secs(60), true);

        let status = store.status();
        assert!(status.active);
        assert_eq!(status.mode, PairingMode::Remote);
        assert!(status.seconds_left > 0 && status.seconds_left <= 60);

        store.stop_pairing();
        let status = store.status();
        assert!(!status.active);
        assert_eq!(status.seconds_left, 0);
        assert!(status.expires_at.is_none());
    }
}
