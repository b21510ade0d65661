//! Backup chain model.
//!
//! A chain is the ordered list of full backups, each owning the incremental
//! backups taken after it. Entries live in an arena and refer to each other
//! by [`EntryId`], so a full never holds references into its incrementals.

pub mod filename;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::destination::RemoteObject;
use filename::{FilenameCodec, VolumeEntry, VolumeKind};

/// Index into [`Chain::entries`].
pub type EntryId = usize;

/// One logical backup point, identified by its manifest name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub id: EntryId,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    pub manifest: VolumeEntry,
    pub signature_volumes: Vec<VolumeEntry>,
    pub content_volumes: Vec<VolumeEntry>,
    /// Chronological; only populated on fulls
    pub incrementals: Vec<EntryId>,
}

impl BackupEntry {
    pub fn from_manifest(id: EntryId, manifest: VolumeEntry) -> Self {
        Self {
            id,
            filename: manifest.name.clone(),
            timestamp: manifest.timestamp,
            is_full: manifest.is_full,
            manifest,
            signature_volumes: Vec::new(),
            content_volumes: Vec::new(),
            incrementals: Vec::new(),
        }
    }

    /// Restorable entries have at least one signature and one content volume.
    pub fn is_restorable(&self) -> bool {
        !self.signature_volumes.is_empty() && !self.content_volumes.is_empty()
    }

    /// All objects of the entry, manifest last.
    pub fn objects(&self) -> impl Iterator<Item = &VolumeEntry> {
        self.content_volumes
            .iter()
            .chain(self.signature_volumes.iter())
            .chain(std::iter::once(&self.manifest))
    }

    pub fn total_size(&self) -> u64 {
        self.objects().map(|v| v.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    /// Arena of every manifest found, sorted by (timestamp, filename)
    pub entries: Vec<BackupEntry>,
    /// Full entries in ascending time order
    pub fulls: Vec<EntryId>,
    /// Incrementals without an owning full, excluded from `fulls`
    pub orphans: Vec<EntryId>,
    /// Entries missing their signature or content volumes
    pub broken: Vec<EntryId>,
    /// Volumes whose manifest is not present at the destination
    pub dangling: Vec<VolumeEntry>,
}

impl Chain {
    pub fn entry(&self, id: EntryId) -> &BackupEntry {
        &self.entries[id]
    }

    pub fn is_empty(&self) -> bool {
        self.fulls.is_empty()
    }

    pub fn fulls(&self) -> impl Iterator<Item = &BackupEntry> {
        self.fulls.iter().map(|&id| &self.entries[id])
    }

    pub fn incrementals_of<'a>(&'a self, full: &'a BackupEntry) -> impl Iterator<Item = &'a BackupEntry> {
        full.incrementals.iter().map(|&id| &self.entries[id])
    }

    pub fn latest_full(&self) -> Option<&BackupEntry> {
        self.fulls.last().map(|&id| &self.entries[id])
    }

    /// Latest full whose timestamp is not after `time`.
    pub fn full_at(&self, time: DateTime<Utc>) -> Option<&BackupEntry> {
        self.fulls().filter(|f| f.timestamp <= time).last()
    }

    /// Newest timestamp of any manifest, orphans included.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.timestamp).max()
    }
}

/// Rebuilds a [`Chain`] from a destination listing.
pub struct ChainBuilder<'a> {
    names: &'a FilenameCodec,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(names: &'a FilenameCodec) -> Self {
        Self { names }
    }

    pub fn build(&self, listing: &[RemoteObject]) -> Chain {
        let volumes = listing
            .iter()
            .filter_map(|obj| {
                let decoded = self.names.decode(&obj.name, obj.size);
                if decoded.is_none() {
                    debug!("Ignoring unrecognized remote object: {}", obj.name);
                }
                decoded
            })
            .collect();
        self.from_volumes(volumes)
    }

    pub fn from_volumes(&self, volumes: Vec<VolumeEntry>) -> Chain {
        // Keyed by name so duplicate listing rows collapse and iteration order is stable
        let mut manifests: BTreeMap<String, VolumeEntry> = BTreeMap::new();
        let mut signatures: BTreeMap<String, Vec<VolumeEntry>> = BTreeMap::new();
        let mut contents: BTreeMap<String, Vec<VolumeEntry>> = BTreeMap::new();

        for volume in volumes {
            match volume.kind {
                VolumeKind::Manifest => {
                    manifests.insert(volume.name.clone(), volume);
                }
                VolumeKind::Signature => {
                    signatures.entry(self.names.owning_manifest_name(&volume)).or_default().push(volume);
                }
                VolumeKind::Content => {
                    contents.entry(self.names.owning_manifest_name(&volume)).or_default().push(volume);
                }
            }
        }

        let mut sorted: Vec<VolumeEntry> = manifests.into_values().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));

        let mut chain = Chain::default();
        let mut incrementals = Vec::new();

        for manifest in sorted {
            let id = chain.entries.len();
            let mut entry = BackupEntry::from_manifest(id, manifest);
            entry.signature_volumes = take_sorted(&mut signatures, &entry.filename);
            entry.content_volumes = take_sorted(&mut contents, &entry.filename);

            if !entry.is_restorable() {
                warn!(
                    "Backup entry {} is incomplete ({} signature, {} content volumes)",
                    entry.filename,
                    entry.signature_volumes.len(),
                    entry.content_volumes.len()
                );
                chain.broken.push(id);
            }

            if entry.is_full {
                chain.fulls.push(id);
            } else {
                incrementals.push(id);
            }
            chain.entries.push(entry);
        }

        for id in incrementals {
            let timestamp = chain.entries[id].timestamp;
            let eligible = chain
                .fulls
                .partition_point(|&f| chain.entries[f].timestamp <= timestamp);

            if eligible == 0 {
                warn!(
                    "Failed to match incremental backup to a full: {}",
                    chain.entries[id].filename
                );
                chain.orphans.push(id);
            } else {
                let owner = chain.fulls[eligible - 1];
                chain.entries[owner].incrementals.push(id);
            }
        }

        for volume in signatures.into_values().chain(contents.into_values()).flatten() {
            warn!("Volume {} has no manifest at the destination", volume.name);
            chain.dangling.push(volume);
        }
        chain.dangling.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(
            "Built chain: {} full, {} total entries, {} orphaned, {} dangling volumes",
            chain.fulls.len(),
            chain.entries.len(),
            chain.orphans.len(),
            chain.dangling.len()
        );

        chain
    }
}

fn take_sorted(map: &mut BTreeMap<String, Vec<VolumeEntry>>, manifest: &str) -> Vec<VolumeEntry> {
    let mut volumes = map.remove(manifest).unwrap_or_default();
    volumes.sort_by(|a, b| a.volume_index.cmp(&b.volume_index).then_with(|| a.name.cmp(&b.name)));
    volumes
}
