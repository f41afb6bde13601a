//! Persistent certificate revocation list
//!
//! A JSON file mapping certificate serials to revocation metadata. Loaded
//! once at startup and rewritten on every change; the set only grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use trustplane_core::{Error, Result};

/// One revoked certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub device_id: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

/// Serial-keyed revocation set backed by `revoked.json`
#[derive(Debug)]
pub struct RevocationList {
    path: PathBuf,
    entries: HashMap<String, RevokedEntry>,
}

impl RevocationList {
    /// Load the list, creating an empty one if the file does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(Error::storage)?;
            serde_json::from_str(&content).map_err(Error::storage)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Record a revocation and persist immediately
    pub fn revoke(&mut self, serial: &str, device_id: &str, reason: &str) -> Result<()> {
        self.entries.insert(
            serial.to_string(),
            RevokedEntry {
                device_id: device_id.to_string(),
                revoked_at: Utc::now(),
                reason: reason.to_string(),
            },
        );
        self.persist()
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.entries.contains_key(serial)
    }

    pub fn entry(&self, serial: &str) -> Option<&RevokedEntry> {
        self.entries.get(serial)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(Error::storage)?;
        std::fs::write(&self.path, json).map_err(Error::storage)
    }
}
