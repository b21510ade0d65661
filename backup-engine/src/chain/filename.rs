//! Remote object naming.
//!
//! Every object name carries enough metadata to place it in a chain without
//! downloading it:
//!
//! ```text
//! <prefix>-<full|inc>-<manifest|signature|content>.<YYYYMMDDTHHMMSSZ>[.vol<N>].<ext>[.<enc>]
//! ```
//!
//! Manifests use `manifest` as extension and carry no volume segment.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::errors::{EngineError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const MANIFEST_EXT: &str = "manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Manifest,
    Signature,
    Content,
}

impl VolumeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Manifest => "manifest",
            VolumeKind::Signature => "signature",
            VolumeKind::Content => "content",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "manifest" => Some(VolumeKind::Manifest),
            "signature" => Some(VolumeKind::Signature),
            "content" => Some(VolumeKind::Content),
            _ => None,
        }
    }
}

/// One physical remote object, decoded from its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub name: String,
    pub kind: VolumeKind,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    /// 1-based; manifests always report 1
    pub volume_index: u32,
    pub encryption_tag: Option<String>,
    /// Codec tag for volumes, `manifest` for manifests
    pub compression_tag: String,
    /// Size reported by the destination listing
    pub size: u64,
}

/// Stateless encoder/decoder for remote object names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameCodec {
    prefix: String,
}

impl FilenameCodec {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains(&['.', '/', '\\'][..]) {
            return Err(EngineError::Config(format!(
                "invalid backup prefix '{prefix}': must be non-empty and contain no '.', '/' or '\\'"
            )));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a remote name. `volume_index` and `compression_tag` are ignored for manifests.
    pub fn encode(
        &self,
        kind: VolumeKind,
        is_full: bool,
        timestamp: DateTime<Utc>,
        volume_index: Option<u32>,
        compression_tag: &str,
        encryption_tag: Option<&str>,
    ) -> String {
        let flag = if is_full { "full" } else { "inc" };
        let mut name = format!(
            "{}-{}-{}.{}",
            self.prefix,
            flag,
            kind.as_str(),
            timestamp.format(TIMESTAMP_FORMAT)
        );

        match kind {
            VolumeKind::Manifest => {
                name.push('.');
                name.push_str(MANIFEST_EXT);
            }
            _ => {
                name.push_str(&format!(".vol{}.{}", volume_index.unwrap_or(1).max(1), compression_tag));
            }
        }

        if let Some(enc) = encryption_tag {
            name.push('.');
            name.push_str(enc);
        }

        name
    }

    pub fn manifest_name(&self, is_full: bool, timestamp: DateTime<Utc>, encryption_tag: Option<&str>) -> String {
        self.encode(VolumeKind::Manifest, is_full, timestamp, None, MANIFEST_EXT, encryption_tag)
    }

    /// The manifest a volume belongs to, derived from the volume's own fields.
    pub fn owning_manifest_name(&self, volume: &VolumeEntry) -> String {
        self.manifest_name(volume.is_full, volume.timestamp, volume.encryption_tag.as_deref())
    }

    /// Decode a remote name. Anything outside the grammar yields `None`.
    pub fn decode(&self, name: &str, size: u64) -> Option<VolumeEntry> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let rest = parts[0].strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;
        let (flag, kind) = rest.split_once('-')?;
        let is_full = match flag {
            "full" => true,
            "inc" => false,
            _ => return None,
        };
        let kind = VolumeKind::parse(kind)?;
        let timestamp = parse_timestamp(parts[1])?;

        let (volume_index, compression_tag, encryption_tag) = match kind {
            VolumeKind::Manifest => {
                if parts[2] != MANIFEST_EXT || parts.len() > 4 {
                    return None;
                }
                (1, MANIFEST_EXT.to_string(), parts.get(3))
            }
            _ => {
                if parts.len() < 4 || parts.len() > 5 {
                    return None;
                }
                let digits = parts[2].strip_prefix("vol")?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let index: u32 = digits.parse().ok().filter(|n| *n >= 1)?;
                (index, parts[3].to_string(), parts.get(4))
            }
        };

        Some(VolumeEntry {
            name: name.to_string(),
            kind,
            timestamp,
            is_full,
            volume_index,
            encryption_tag: encryption_tag.map(|s| s.to_string()),
            compression_tag,
            size,
        })
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Truncate to whole seconds, the resolution names can carry.
pub fn to_name_resolution(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}
