//! Verified downloads of manifests and volumes.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::manifest::Manifest;
use super::EngineContext;
use crate::chain::filename::VolumeEntry;
use crate::chain::{BackupEntry, Chain};
use crate::sync::signature::{SignatureIndex, INDEX_ENTRY};
use crate::sync::{sha256_hex, SignatureSet};
use crate::utils::errors::{EngineError, Result};
use crate::volume::UnpackedVolume;

fn ensure_plaintext(volume: &VolumeEntry) -> Result<()> {
    match &volume.encryption_tag {
        Some(tag) => Err(EngineError::Codec(format!(
            "'{}' is encrypted with '{tag}' and no encryption module is registered",
            volume.name
        ))),
        None => Ok(()),
    }
}

pub async fn fetch_manifest(ctx: &EngineContext, entry: &BackupEntry) -> Result<Manifest> {
    ctx.control.ensure_not_aborted()?;
    ensure_plaintext(&entry.manifest)?;
    let data = ctx.destination.get(&entry.filename).await?;
    Manifest::from_json(&data)
}

/// Download a volume, check it against the manifest hash, then unpack it.
pub async fn fetch_volume(
    ctx: &EngineContext,
    manifest: &Manifest,
    manifest_name: &str,
    volume: &VolumeEntry,
) -> Result<UnpackedVolume> {
    ctx.control.ensure_not_aborted()?;
    ensure_plaintext(volume)?;
    let codec = ctx.reader_codec(&volume.compression_tag)?;

    let data = ctx.destination.get(&volume.name).await?;
    let unpacked = tokio::task::spawn_blocking({
        let manifest = manifest.clone();
        let manifest_name = manifest_name.to_string();
        let volume = volume.clone();
        move || -> Result<UnpackedVolume> {
            let actual = sha256_hex(&data);
            manifest.verify(&volume, &manifest_name, &actual)?;
            codec.unpack(&data)
        }
    })
    .await??;

    debug!(
        "Fetched {} ({} entries, {} unreadable)",
        volume.name,
        unpacked.files.len(),
        unpacked.failures.len()
    );
    Ok(unpacked)
}

pub fn read_signature_index(volume: &VolumeEntry, unpacked: &UnpackedVolume) -> Result<SignatureIndex> {
    let index = unpacked
        .get(INDEX_ENTRY)
        .ok_or_else(|| EngineError::Codec(format!("'{}' has no {INDEX_ENTRY}", volume.name)))?;
    SignatureIndex::from_json(&index.data)
}

/// Fold the signature volumes of one entry into `set`. Unreferenced
/// volumes are leftovers of an interrupted run and are skipped.
pub async fn apply_entry_signatures(ctx: &EngineContext, entry: &BackupEntry, set: &mut SignatureSet) -> Result<Manifest> {
    let manifest = fetch_manifest(ctx, entry).await?;
    for volume in &entry.signature_volumes {
        if !manifest.references(volume) {
            debug!("Skipping unreferenced signature volume {}", volume.name);
            continue;
        }
        let unpacked = fetch_volume(ctx, &manifest, &entry.filename, volume).await?;
        if !unpacked.failures.is_empty() {
            return Err(EngineError::Codec(format!(
                "'{}' has {} unreadable entries",
                volume.name,
                unpacked.failures.len()
            )));
        }
        let index = read_signature_index(volume, &unpacked)?;
        set.apply_volume(&index, |path| unpacked.get(path).map(|f| f.data.as_slice()));
    }
    Ok(manifest)
}

/// Signature set of `full` plus its incrementals up to `until`.
///
/// Any unreadable volume fails the whole load.
pub async fn load_signature_set(
    ctx: &EngineContext,
    chain: &Chain,
    full: &BackupEntry,
    until: Option<DateTime<Utc>>,
) -> Result<SignatureSet> {
    let mut set = SignatureSet::new();
    apply_entry_signatures(ctx, full, &mut set).await?;
    for inc in chain.incrementals_of(full) {
        if until.is_some_and(|t| inc.timestamp > t) {
            break;
        }
        apply_entry_signatures(ctx, inc, &mut set).await?;
    }
    Ok(set)
}
