//! Manifest types for the backup chain.
//!
//! A manifest is the commit record of one backup point. It lists the SHA-256
//! of every sealed volume in order, so a reader only trusts volumes the
//! manifest names and can verify each download.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::filename::{VolumeEntry, VolumeKind};
use crate::utils::errors::{IntegrityError, Result};

pub const MANIFEST_VERSION: u32 = 1;

/// Running counters of a backup run, persisted with the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCounters {
    pub examined_files: usize,
    pub examined_bytes: u64,
    pub added_files: usize,
    pub added_bytes: u64,
    pub modified_files: usize,
    pub modified_bytes: u64,
    pub unchanged_files: usize,
    pub unchanged_bytes: u64,
    pub deleted_files: usize,
    /// Files skipped after a read failure
    #[serde(default)]
    pub failed_files: usize,
}

/// Serialized as JSON into `<prefix>-<full|inc>-manifest.<ts>.manifest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    /// False when the run was stopped or hit the total-size cap
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub volume_count: u32,
    /// SHA-256 of each packed content volume, by volume index
    pub content_hashes: Vec<String>,
    pub signature_hashes: Vec<String>,
    pub counters: BackupCounters,
}

impl Manifest {
    pub fn new(timestamp: DateTime<Utc>, is_full: bool, hostname: Option<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            timestamp,
            is_full,
            complete: false,
            hostname,
            volume_count: 0,
            content_hashes: Vec::new(),
            signature_hashes: Vec::new(),
            counters: BackupCounters::default(),
        }
    }

    /// Record one sealed volume pair.
    pub fn push_volume(&mut self, content_hash: String, signature_hash: String) {
        self.content_hashes.push(content_hash);
        self.signature_hashes.push(signature_hash);
        self.volume_count = self.content_hashes.len() as u32;
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Hash recorded for a signature or content volume.
    pub fn expected_hash(&self, kind: VolumeKind, volume_index: u32) -> Option<&str> {
        let hashes = match kind {
            VolumeKind::Content => &self.content_hashes,
            VolumeKind::Signature => &self.signature_hashes,
            VolumeKind::Manifest => return None,
        };
        let slot = usize::try_from(volume_index).ok()?.checked_sub(1)?;
        hashes.get(slot).map(|s| s.as_str())
    }

    /// Whether the manifest vouches for `volume`.
    pub fn references(&self, volume: &VolumeEntry) -> bool {
        volume.volume_index <= self.volume_count && self.expected_hash(volume.kind, volume.volume_index).is_some()
    }

    /// Check a downloaded volume against the recorded hash.
    pub fn verify(&self, volume: &VolumeEntry, manifest_name: &str, actual: &str) -> std::result::Result<(), IntegrityError> {
        match self.expected_hash(volume.kind, volume.volume_index) {
            None => Err(IntegrityError::UnreferencedVolume {
                name: volume.name.clone(),
                manifest: manifest_name.to_string(),
            }),
            Some(expected) if expected != actual => Err(IntegrityError::HashMismatch {
                name: volume.name.clone(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::filename::FilenameCodec;
    use chrono::TimeZone;

    fn manifest() -> Manifest {
        let mut m = Manifest::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), true, None);
        m.push_volume("c1".into(), "s1".into());
        m.push_volume("c2".into(), "s2".into());
        m
    }

    #[test]
    fn test_expected_hash_by_index() {
        let m = manifest();
        assert_eq!(m.volume_count, 2);
        assert_eq!(m.expected_hash(VolumeKind::Content, 2), Some("c2"));
        assert_eq!(m.expected_hash(VolumeKind::Signature, 1), Some("s1"));
        assert_eq!(m.expected_hash(VolumeKind::Content, 3), None);
        assert_eq!(m.expected_hash(VolumeKind::Content, 0), None);
    }

    #[test]
    fn test_verify() {
        let m = manifest();
        let names = FilenameCodec::new("backup").unwrap();
        let name = names.encode(VolumeKind::Content, true, m.timestamp, Some(2), "tzst", None);
        let volume = names.decode(&name, 0).unwrap();

        assert!(m.verify(&volume, "m", "c2").is_ok());
        assert!(matches!(
            m.verify(&volume, "m", "bad"),
            Err(IntegrityError::HashMismatch { .. })
        ));

        let name = names.encode(VolumeKind::Content, true, m.timestamp, Some(3), "tzst", None);
        let extra = names.decode(&name, 0).unwrap();
        assert!(!m.references(&extra));
        assert!(matches!(
            m.verify(&extra, "m", "c3"),
            Err(IntegrityError::UnreferencedVolume { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let m = manifest();
        assert_eq!(Manifest::from_json(&m.to_json().unwrap()).unwrap(), m);
    }
}
