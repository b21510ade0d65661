//! Block signatures and the per-path signature set.
//!
//! Each backup writes an `index.json` into its first signature volume (and a
//! partial one into every later volume) describing the files it stored, plus
//! one `signature/<path>` entry per file with the raw rsync signature. The
//! signature set of a chain position is the fold of those indexes from the
//! full through every incremental.

use fast_rsync::{Signature, SignatureOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::utils::errors::{EngineError, Result};

/// Default block size for signature generation (4KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

/// Strong hash bytes per block
const CRYPTO_HASH_SIZE: u32 = 8;

pub const INDEX_ENTRY: &str = "index.json";
pub const SIGNATURE_PREFIX: &str = "signature/";

/// Generate a serialized block signature for `data`.
pub fn block_signature(data: &[u8], block_size: Option<u32>) -> Vec<u8> {
    let options = SignatureOptions {
        block_size: block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        crypto_hash_size: CRYPTO_HASH_SIZE,
    };

    Signature::calculate(data, options).serialized().to_vec()
}

/// Parse a serialized signature back into fast_rsync's form.
pub fn parse_signature(serialized: &[u8]) -> Result<Signature> {
    Signature::deserialize(serialized.to_vec())
        .map_err(|e| EngineError::DeltaSync(format!("invalid block signature: {e:?}")))
}

/// Metadata recorded for every stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative `/`-separated path, prefixed with the source label for
    /// multi-source backups
    pub path: String,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    pub sha256: String,
}

/// Contents of `index.json` in a signature volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureIndex {
    pub files: Vec<FileRecord>,
    /// Paths removed since the previous backup point. Only volume 1 carries them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
}

impl SignatureIndex {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSignature {
    pub record: FileRecord,
    /// Serialized rsync signature; empty when it could not be recovered
    pub signature: Vec<u8>,
}

impl FileSignature {
    /// Size and mtime match; contents are assumed unchanged.
    pub fn matches(&self, size: u64, mtime: i64) -> bool {
        self.record.size == size && self.record.mtime == mtime
    }
}

/// Per-path state of the newest backup point in a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSet {
    files: BTreeMap<String, FileSignature>,
}

impl SignatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileSignature> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileSignature)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert(&mut self, record: FileRecord, signature: Vec<u8>) {
        self.files.insert(record.path.clone(), FileSignature { record, signature });
    }

    pub fn remove(&mut self, path: &str) -> Option<FileSignature> {
        self.files.remove(path)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.record.size).sum()
    }

    /// Fold one signature volume into the set. `lookup` resolves the raw
    /// signature bytes stored next to the index.
    pub fn apply_volume<'a, F>(&mut self, index: &SignatureIndex, mut lookup: F)
    where
        F: FnMut(&str) -> Option<&'a [u8]>,
    {
        for path in &index.deleted {
            self.files.remove(path);
        }
        for record in &index.files {
            let signature = lookup(&format!("{SIGNATURE_PREFIX}{}", record.path))
                .map(|s| s.to_vec())
                .unwrap_or_default();
            self.insert(record.clone(), signature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: u64) -> FileRecord {
        FileRecord {
            path: path.into(),
            size,
            mtime: 100,
            permissions: Some(0o644),
            sha256: "00".into(),
        }
    }

    #[test]
    fn test_block_signature_parses() {
        let data = vec![3u8; 64 * 1024];
        let sig = block_signature(&data, Some(4096));
        assert!(!sig.is_empty());
        assert!(parse_signature(&sig).is_ok());
        assert!(parse_signature(b"nope").is_err());
    }

    #[test]
    fn test_apply_volume_folds_changes() {
        let mut set = SignatureSet::new();
        let full = SignatureIndex {
            files: vec![record("a", 1), record("b", 2)],
            deleted: vec![],
        };
        set.apply_volume(&full, |_| Some(b"sig".as_slice()));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("a").unwrap().signature, b"sig");

        let inc = SignatureIndex {
            files: vec![record("c", 3), record("b", 20)],
            deleted: vec!["a".into()],
        };
        set.apply_volume(&inc, |_| None);
        assert!(!set.contains("a"));
        assert_eq!(set.get("b").unwrap().record.size, 20);
        assert!(set.get("b").unwrap().signature.is_empty());
        assert_eq!(set.paths().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(set.total_bytes(), 23);
    }

    #[test]
    fn test_index_json_omits_empty_deleted() {
        let index = SignatureIndex {
            files: vec![record("a", 1)],
            deleted: vec![],
        };
        let json = String::from_utf8(index.to_json().unwrap()).unwrap();
        assert!(!json.contains("deleted"));
        assert_eq!(SignatureIndex::from_json(json.as_bytes()).unwrap(), index);
    }

    #[test]
    fn test_matches_uses_size_and_mtime() {
        let sig = FileSignature {
            record: record("a", 5),
            signature: Vec::new(),
        };
        assert!(sig.matches(5, 100));
        assert!(!sig.matches(5, 101));
        assert!(!sig.matches(6, 100));
    }
}
