//! proctord - proctoring-assistance backend
//!
//! The daemon accepts uploaded webcam frames and JSON payloads over a small
//! HTTP API and dispatches them to:
//! 1. Head-pose estimation (facial landmarks -> PnP -> angle thresholds)
//! 2. A simplified head-position heuristic (face box center vs margins)
//! 3. Face enrollment / presence verification
//! 4. Forbidden-object screening (pretrained detector + label filter)
//! 5. Alert logging / retrieval and credential lookup (SQLite)
//!
//! All model inference goes through `detect::BackendRegistry`; the registry
//! never hands raw model handles to the endpoint layer.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod pose;
pub mod storage;

pub use config::ProctordConfig;
pub use frame::RgbFrame;
pub use pose::{HeadDirection, HeadPose, PoseEstimator, PoseThresholds};
pub use storage::{AlertRecord, InMemoryProctorStore, ProctorStore, SqliteProctorStore};

/// Wall-clock seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock before epoch: {}", e))?
        .as_secs())
}

/// Lowercase-hex SHA-256 digest used for stored credentials.
///
/// Credentials never reach the store or the query layer in plaintext.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// In-process registration set: roll numbers that completed face enrollment.
///
/// Held only in memory; restarting the daemon clears it. Enrollment is a
/// presence marker, not a biometric template.
#[derive(Debug, Default)]
pub struct EnrollmentRegistry {
    rolls: Mutex<HashSet<String>>,
}

impl EnrollmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, roll_number: &str) -> Result<()> {
        let mut rolls = self
            .rolls
            .lock()
            .map_err(|_| anyhow!("enrollment registry lock poisoned"))?;
        rolls.insert(roll_number.to_string());
        Ok(())
    }

    pub fn contains(&self, roll_number: &str) -> Result<bool> {
        let rolls = self
            .rolls
            .lock()
            .map_err(|_| anyhow!("enrollment registry lock poisoned"))?;
        Ok(rolls.contains(roll_number))
    }

    /// Sorted listing, so JSON output is stable across calls.
    pub fn list(&self) -> Result<Vec<String>> {
        let rolls = self
            .rolls
            .lock()
            .map_err(|_| anyhow!("enrollment registry lock poisoned"))?;
        let mut out: Vec<String> = rolls.iter().cloned().collect();
        out.sort();
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        let rolls = self
            .rolls
            .lock()
            .map_err(|_| anyhow!("enrollment registry lock poisoned"))?;
        Ok(rolls.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_digest_is_stable_hex() {
        let digest = hash_password("secret");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, hash_password("secret"));
        assert_ne!(digest, hash_password("Secret"));
    }

    #[test]
    fn enrollment_registry_tracks_rolls() {
        let registry = EnrollmentRegistry::new();
        assert!(registry.is_empty().unwrap());
        assert!(!registry.contains("42").unwrap());

        registry.register("42").unwrap();
        registry.register("7").unwrap();
        registry.register("42").unwrap();

        assert_eq!(registry.len().unwrap(), 2);
        assert!(registry.contains("42").unwrap());
        assert_eq!(registry.list().unwrap(), vec!["42", "7"]);
    }
}
