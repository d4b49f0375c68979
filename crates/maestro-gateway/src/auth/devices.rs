//! Paired-device registry, persisted as JSON so devices stay paired across
//! restarts until explicitly revoked.
//!
//! Every mutation is a read-modify-write of the whole file. Pairing events
//! are rare, human-paced operations, so no finer-grained concurrency is
//! warranted.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredDevice {
    pub device_id: String,
    /// 32 random bytes, hex-encoded. Rotated on re-pairing.
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

pub struct DeviceRegistry {
    path: PathBuf,
}

fn new_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl DeviceRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Vec<RegisteredDevice> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn save(&self, devices: &[RegisteredDevice]) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(devices)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)
    }

    pub fn get(&self, device_id: &str) -> Option<RegisteredDevice> {
        self.load().into_iter().find(|d| d.device_id == device_id)
    }

    /// Register a device, or rotate its secret when it re-pairs. The
    /// plaintext secret is returned to the caller exactly once per pairing.
    pub fn register(
        &self,
        device_id: &str,
        name: Option<String>,
        platform: Option<String>,
    ) -> std::io::Result<RegisteredDevice> {
        let mut devices = self.load();
        let now = Utc::now();

        if let Some(existing) = devices
            .iter_mut()
            .find(|d| d.device_id == device_id && !d.revoked)
        {
            info!(device = %device_id, "re-pairing device, rotating secret");
            existing.secret = new_secret();
            existing.last_seen = Some(now);
            if name.is_some() {
                existing.name = name;
            }
            if platform.is_some() {
                existing.platform = platform;
            }
            let device = existing.clone();
            self.save(&devices)?;
            return Ok(device);
        }

        info!(device = %device_id, "registering new device");
        let device = RegisteredDevice {
            device_id: device_id.to_string(),
            secret: new_secret(),
            name,
            platform,
            created_at: now,
            last_seen: Some(now),
            revoked: false,
        };
        devices.push(device.clone());
        self.save(&devices)?;
        Ok(device)
    }

    pub fn update_last_seen(&self, device_id: &str) {
        let mut devices = self.load();
        if let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) {
            device.last_seen = Some(Utc::now());
            if let Err(e) = self.save(&devices) {
                warn!(device = %device_id, "failed to persist last-seen: {e}");
            }
        }
    }

    pub fn revoke(&self, device_id: &str) -> bool {
        let mut devices = self.load();
        let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) else {
            return false;
        };
        device.revoked = true;
        match self.save(&devices) {
            Ok(()) => {
                info!(device = %device_id, "device revoked");
                true
            }
            Err(e) => {
                warn!(device = %device_id, "failed to persist revocation: {e}");
                false
            }
        }
    }

    /// Non-revoked devices, for the devices listing endpoint.
    pub fn list(&self) -> Vec<RegisteredDevice> {
        self.load().into_iter().filter(|d| !d.revoked).collect()
    }
}
