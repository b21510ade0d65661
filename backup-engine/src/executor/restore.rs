//! Restore: materialize a full backup, replay its incrementals, then copy
//! the result into the target directory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::diff::{CONTENT_PREFIX, DELTA_PREFIX};
use super::manifest::Manifest;
use super::volumes::{fetch_manifest, fetch_volume, read_signature_index};
use super::EngineContext;
use crate::chain::filename::VolumeKind;
use crate::chain::{BackupEntry, Chain};
use crate::controller::task::Checkpoint;
use crate::events::EventBody;
use crate::fs::filter::PathFilter;
use crate::fs::metadata::FileMetadata;
use crate::report::{WarningKind, WarningLog};
use crate::sync::apply::apply_delta_in_place;
use crate::sync::sha256_hex;
use crate::sync::signature::{FileRecord, SignatureIndex};
use crate::transfer::progress::{format_bytes, format_duration, ProgressTracker};
use crate::utils::errors::{EngineError, IntegrityError, Result};
use crate::volume::{is_safe_relative_path, UnpackedVolume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    Latest,
    /// Newest state at or before the given time
    At(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub selection: RestoreSelection,
    pub target: PathBuf,
    pub overwrite: bool,
    pub filter: PathFilter,
}

impl RestoreRequest {
    pub fn latest(target: impl Into<PathBuf>) -> Self {
        Self {
            selection: RestoreSelection::Latest,
            target: target.into(),
            overwrite: false,
            filter: PathFilter::all(),
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.selection = RestoreSelection::At(time);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Restore execution result
#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    /// Manifest of the full backup the restore started from
    pub full: String,
    /// Timestamp of the last backup point applied in full
    pub restored_point: DateTime<Utc>,
    pub applied_incrementals: usize,
    /// False when a stop request ended the replay early; the target then
    /// holds the files from the volumes applied so far
    pub complete: bool,
    pub restored_files: usize,
    pub restored_bytes: u64,
    /// Target files already identical to the backup
    pub unchanged_files: usize,
    pub conflicts: usize,
    pub failed_files: usize,
    /// Full-backup volumes that could not be downloaded or verified
    pub failed_volumes: usize,
    pub warnings: WarningLog,
    pub duration_secs: u64,
}

/// Outcome of applying one volume pair to the working tree.
#[derive(Debug, Default)]
struct PairOutcome {
    applied: Vec<FileRecord>,
    removed: Vec<String>,
    issues: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Written,
    Unchanged,
    Conflict,
}

/// Apply one signature index and its content volume under `root`.
fn apply_pair(root: &Path, index: &SignatureIndex, content: &UnpackedVolume) -> PairOutcome {
    let mut outcome = PairOutcome::default();

    for path in &index.deleted {
        if !is_safe_relative_path(path) {
            continue;
        }
        match fs::remove_file(root.join(path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => outcome.issues.push((path.clone(), format!("failed to remove: {e}"))),
        }
        outcome.removed.push(path.clone());
    }

    for failure in &content.failures {
        let subject = failure.path.clone().unwrap_or_else(|| "volume".to_string());
        outcome.issues.push((subject, failure.message.clone()));
    }

    for record in &index.files {
        if !is_safe_relative_path(&record.path) {
            outcome
                .issues
                .push((record.path.clone(), "unsafe path in backup, skipped".to_string()));
            continue;
        }
        let dest = root.join(&record.path);

        let result = if let Some(file) = content.get(&format!("{CONTENT_PREFIX}{}", record.path)) {
            write_file(&dest, &file.data)
        } else if let Some(delta) = content.get(&format!("{DELTA_PREFIX}{}", record.path)) {
            apply_delta_in_place(&dest, &delta.data).map(|_| ())
        } else {
            Err(EngineError::Codec("no stored content".to_string()))
        };

        match result {
            Ok(()) => outcome.applied.push(record.clone()),
            Err(e) => {
                // A stale base must not be restored as if it were current
                let _ = fs::remove_file(&dest);
                outcome.removed.push(record.path.clone());
                outcome.issues.push((record.path.clone(), e.to_string()));
            }
        }
    }

    outcome
}

fn write_file(dest: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, data)?;
    Ok(())
}

/// Copy one file from the working tree to the target after checking its hash.
fn place_file(source: &Path, target: &Path, record: &FileRecord, overwrite: bool) -> Result<Placement> {
    let data = fs::read(source)?;
    let actual = sha256_hex(&data);
    if actual != record.sha256 {
        return Err(IntegrityError::HashMismatch {
            name: record.path.clone(),
            expected: record.sha256.clone(),
            actual,
        }
        .into());
    }

    if target.exists() {
        let existing = fs::read(target)?;
        if sha256_hex(&existing) == record.sha256 {
            return Ok(Placement::Unchanged);
        }
        if !overwrite {
            return Ok(Placement::Conflict);
        }
    }

    write_file(target, &data)?;
    FileMetadata {
        size: record.size,
        modified: record.mtime,
        permissions: record.permissions,
    }
    .apply_to_path(target)?;
    Ok(Placement::Written)
}

pub struct RestoreEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreResult> {
        let chain = self.ctx.load_chain().await?;
        self.restore_from_chain(&chain, request).await
    }

    /// Full plus incrementals needed for the selection, checked for order.
    pub fn select<'c>(chain: &'c Chain, selection: RestoreSelection) -> Result<(&'c BackupEntry, Vec<&'c BackupEntry>)> {
        let (full, until) = match selection {
            RestoreSelection::Latest => (
                chain.latest_full().ok_or(EngineError::NoMatchingBackup(Utc::now()))?,
                None,
            ),
            RestoreSelection::At(time) => (
                chain.full_at(time).ok_or(EngineError::NoMatchingBackup(time))?,
                Some(time),
            ),
        };

        let incrementals: Vec<&BackupEntry> = chain
            .incrementals_of(full)
            .filter(|inc| until.map_or(true, |t| inc.timestamp <= t))
            .collect();

        let mut previous = full.timestamp;
        for inc in &incrementals {
            if inc.timestamp <= previous {
                return Err(IntegrityError::ChainOrderViolation {
                    entry: inc.filename.clone(),
                    previous,
                    next: inc.timestamp,
                }
                .into());
            }
            previous = inc.timestamp;
        }

        Ok((full, incrementals))
    }

    pub async fn restore_from_chain(&self, chain: &Chain, request: &RestoreRequest) -> Result<RestoreResult> {
        let start_time = Instant::now();
        let ctx = self.ctx;
        let (full, incrementals) = Self::select(chain, request.selection)?;

        info!(
            "Restoring {} with {} incremental(s) into {}",
            full.filename,
            incrementals.len(),
            request.target.display()
        );

        let mut warnings = WarningLog::new();
        let scratch = ctx.scratch_dir()?;
        let work_root = scratch.path().to_path_buf();
        let mut live: BTreeMap<String, FileRecord> = BTreeMap::new();
        let mut failed_volumes = 0;
        let mut visited_volumes = 0usize;
        let mut stopped = false;

        // Full: bad volumes are reported and skipped
        let manifest = fetch_manifest(ctx, full).await?;
        for index in 1..=manifest.volume_count {
            if self.should_stop(visited_volumes).await? {
                stopped = true;
                break;
            }
            visited_volumes += 1;
            match self.fetch_pair(full, &manifest, index).await {
                Ok((signatures, content)) => {
                    let outcome = self.apply(&work_root, signatures, content).await?;
                    merge(&mut live, outcome, &mut warnings);
                }
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => {
                    failed_volumes += 1;
                    warnings.about(
                        WarningKind::Integrity,
                        format!("{} volume {index}", full.filename),
                        format!("volume skipped: {e}"),
                    );
                }
            }
        }
        if !manifest.complete {
            warn!("{} is a partial backup", full.filename);
        }

        // Incrementals: any bad volume makes the requested point unreachable
        let mut restored_point = full.timestamp;
        let mut applied_incrementals = 0;
        for inc in &incrementals {
            if stopped {
                break;
            }
            let unreachable = |reason: String| -> EngineError {
                IntegrityError::UnreachableIncremental {
                    timestamp: inc.timestamp,
                    name: inc.filename.clone(),
                    reason,
                }
                .into()
            };
            let manifest = match fetch_manifest(ctx, inc).await {
                Ok(m) => m,
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => return Err(unreachable(e.to_string())),
            };
            for index in 1..=manifest.volume_count {
                if self.should_stop(visited_volumes).await? {
                    stopped = true;
                    break;
                }
                visited_volumes += 1;
                let (signatures, content) = match self.fetch_pair(inc, &manifest, index).await {
                    Ok(pair) => pair,
                    Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                    Err(e) => return Err(unreachable(format!("volume {index}: {e}"))),
                };
                let outcome = self.apply(&work_root, signatures, content).await?;
                merge(&mut live, outcome, &mut warnings);
            }
            if stopped {
                break;
            }
            restored_point = inc.timestamp;
            applied_incrementals += 1;
            debug!("Applied incremental {}", inc.filename);
        }
        if stopped {
            info!("Stop requested, restoring the state replayed after {} volume(s)", visited_volumes);
        }

        let selected: Vec<FileRecord> = live
            .into_values()
            .filter(|r| request.filter.selects(&r.path))
            .collect();

        let total_bytes = selected.iter().map(|r| r.size).sum();
        let mut tracker = ProgressTracker::new(total_bytes, selected.len());
        let mut result = RestoreResult {
            full: full.filename.clone(),
            restored_point,
            applied_incrementals,
            complete: !stopped,
            restored_files: 0,
            restored_bytes: 0,
            unchanged_files: 0,
            conflicts: 0,
            failed_files: 0,
            failed_volumes,
            warnings: WarningLog::new(),
            duration_secs: 0,
        };

        for record in selected {
            ctx.control.ensure_not_aborted()?;
            let source = work_root.join(&record.path);
            let target = request.target.join(&record.path);
            let overwrite = request.overwrite;
            let (record, placed) = tokio::task::spawn_blocking(move || {
                let placed = place_file(&source, &target, &record, overwrite);
                (record, placed)
            })
            .await?;

            match placed {
                Ok(Placement::Written) => {
                    result.restored_files += 1;
                    result.restored_bytes += record.size;
                }
                Ok(Placement::Unchanged) => result.unchanged_files += 1,
                Ok(Placement::Conflict) => {
                    result.conflicts += 1;
                    warnings.about(
                        WarningKind::Conflict,
                        record.path.clone(),
                        "target exists with different content, not overwritten",
                    );
                }
                Err(e) => {
                    result.failed_files += 1;
                    let kind = match &e {
                        EngineError::Integrity(_) => WarningKind::Integrity,
                        _ => WarningKind::PartialFailure,
                    };
                    warnings.about(kind, record.path.clone(), e.to_string());
                }
            }

            if let Some(progress) = tracker.file_done(&record.path, record.size) {
                ctx.events.emit(EventBody::Progress(progress.to_payload()));
            }
        }

        result.warnings = warnings;
        result.duration_secs = start_time.elapsed().as_secs();
        info!(
            "Restore finished in {}: {} files ({}) restored, {} unchanged, {} conflicts, {} failed",
            format_duration(result.duration_secs),
            result.restored_files,
            format_bytes(result.restored_bytes),
            result.unchanged_files,
            result.conflicts,
            result.failed_files
        );
        Ok(result)
    }

    /// Volume boundary: waits while paused. Nothing is checked before the
    /// first volume so a restore always makes progress.
    async fn should_stop(&self, visited_volumes: usize) -> Result<bool> {
        if visited_volumes == 0 {
            return Ok(false);
        }
        Ok(self.ctx.control.checkpoint().await? == Checkpoint::Stop)
    }

    /// Download and verify the signature and content volume with `index`.
    async fn fetch_pair(
        &self,
        entry: &BackupEntry,
        manifest: &Manifest,
        index: u32,
    ) -> Result<(SignatureIndex, UnpackedVolume)> {
        let find = |volumes: &[crate::chain::filename::VolumeEntry], kind: VolumeKind| {
            volumes
                .iter()
                .find(|v| v.volume_index == index)
                .cloned()
                .ok_or_else(|| {
                    EngineError::destination("get", format!("{} {} volume {index}", entry.filename, kind.as_str()), "not found")
                })
        };
        let signature_volume = find(&entry.signature_volumes, VolumeKind::Signature)?;
        let content_volume = find(&entry.content_volumes, VolumeKind::Content)?;

        let signatures = fetch_volume(self.ctx, manifest, &entry.filename, &signature_volume).await?;
        let signature_index = read_signature_index(&signature_volume, &signatures)?;
        let content = fetch_volume(self.ctx, manifest, &entry.filename, &content_volume).await?;
        Ok((signature_index, content))
    }

    async fn apply(&self, root: &Path, signatures: SignatureIndex, content: UnpackedVolume) -> Result<PairOutcome> {
        let root = root.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || apply_pair(&root, &signatures, &content)).await?)
    }
}

fn merge(live: &mut BTreeMap<String, FileRecord>, outcome: PairOutcome, warnings: &mut WarningLog) {
    for path in outcome.removed {
        live.remove(&path);
    }
    for record in outcome.applied {
        live.insert(record.path.clone(), record);
    }
    for (subject, message) in outcome.issues {
        warnings.about(WarningKind::PartialFailure, subject, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::executor::tests::context;
    use crate::executor::BackupExecutor;
    use tempfile::TempDir;

    fn read(root: &Path, path: &str) -> Vec<u8> {
        fs::read(root.join(path)).unwrap()
    }

    async fn backup(ctx: &EngineContext, src: &Path) -> DateTime<Utc> {
        BackupExecutor::new(ctx.clone())
            .execute(&[src.to_path_buf()])
            .await
            .unwrap()
            .timestamp
    }

    #[tokio::test]
    async fn test_round_trip_through_incrementals() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("docs/deep")).unwrap();
        fs::write(src.path().join("docs/a.txt"), b"alpha").unwrap();
        fs::write(src.path().join("docs/deep/b.bin"), vec![7u8; 30_000]).unwrap();
        fs::write(src.path().join("gone.txt"), b"temporary").unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 16 * 1024);
        let first = backup(&ctx, src.path()).await;

        let mut edited = vec![7u8; 30_000];
        edited.extend_from_slice(b"appended tail");
        fs::write(src.path().join("docs/deep/b.bin"), &edited).unwrap();
        fs::remove_file(src.path().join("gone.txt")).unwrap();
        fs::write(src.path().join("new.txt"), b"fresh").unwrap();
        backup(&ctx, src.path()).await;

        let latest = TempDir::new().unwrap();
        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(latest.path()))
            .await
            .unwrap();
        assert_eq!(result.applied_incrementals, 1);
        assert_eq!(result.restored_files, 3);
        assert!(result.warnings.is_empty());
        assert_eq!(read(latest.path(), "docs/a.txt"), b"alpha");
        assert_eq!(read(latest.path(), "docs/deep/b.bin"), edited);
        assert_eq!(read(latest.path(), "new.txt"), b"fresh");
        assert!(!latest.path().join("gone.txt").exists());

        let earlier = TempDir::new().unwrap();
        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(earlier.path()).at(first))
            .await
            .unwrap();
        assert_eq!(result.applied_incrementals, 0);
        assert_eq!(read(earlier.path(), "gone.txt"), b"temporary");
        assert_eq!(read(earlier.path(), "docs/deep/b.bin"), vec![7u8; 30_000]);
        assert!(!earlier.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_restore_reapplies_mtime() {
        let src = TempDir::new().unwrap();
        let file = src.path().join("dated.txt");
        fs::write(&file, b"old news").unwrap();
        FileMetadata {
            size: 0,
            modified: 1_000_000_000,
            permissions: None,
        }
        .apply_to_path(&file)
        .unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        backup(&ctx, src.path()).await;

        let target = TempDir::new().unwrap();
        RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        let restored = FileMetadata::from_path(&target.path().join("dated.txt")).unwrap();
        assert_eq!(restored.modified, 1_000_000_000);
    }

    #[tokio::test]
    async fn test_reversed_incrementals_are_rejected_before_download() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"1").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        backup(&ctx, src.path()).await;
        fs::write(src.path().join("b"), b"2").unwrap();
        backup(&ctx, src.path()).await;
        fs::write(src.path().join("c"), b"3").unwrap();
        backup(&ctx, src.path()).await;

        let mut chain = ctx.load_chain().await.unwrap();
        let full = chain.fulls[0];
        chain.entries[full].incrementals.reverse();

        let target = TempDir::new().unwrap();
        let err = RestoreEngine::new(&ctx)
            .restore_from_chain(&chain, &RestoreRequest::latest(target.path()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Integrity(IntegrityError::ChainOrderViolation { .. })
        ));
        assert!(err.is_fatal());
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_matching_backup() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"1").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let first = backup(&ctx, src.path()).await;

        let target = TempDir::new().unwrap();
        let err = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()).at(first - chrono::Duration::days(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingBackup(_)));
    }

    #[tokio::test]
    async fn test_conflicts_are_skipped_without_overwrite() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"from backup").unwrap();
        fs::write(src.path().join("b.txt"), b"same").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        backup(&ctx, src.path()).await;

        let target = TempDir::new().unwrap();
        fs::write(target.path().join("a.txt"), b"local edit").unwrap();
        fs::write(target.path().join("b.txt"), b"same").unwrap();

        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.unchanged_files, 1);
        assert_eq!(result.warnings.count(WarningKind::Conflict), 1);
        assert_eq!(read(target.path(), "a.txt"), b"local edit");

        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()).overwrite(true))
            .await
            .unwrap();
        assert_eq!(result.restored_files, 1);
        assert_eq!(read(target.path(), "a.txt"), b"from backup");
    }

    #[tokio::test]
    async fn test_filter_limits_restored_paths() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("keep.txt"), b"k").unwrap();
        fs::write(src.path().join("skip.log"), b"s").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        backup(&ctx, src.path()).await;

        let filter = PathFilter::new(&crate::fs::filter::FilterRules {
            include: Vec::new(),
            exclude: vec!["*.log".to_string()],
        })
        .unwrap();
        let target = TempDir::new().unwrap();
        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()).filter(filter))
            .await
            .unwrap();
        assert_eq!(result.restored_files, 1);
        assert!(!target.path().join("skip.log").exists());
    }

    #[tokio::test]
    async fn test_corrupt_full_volume_is_reported_per_volume() {
        let src = TempDir::new().unwrap();
        for i in 0..4 {
            fs::write(src.path().join(format!("f{i}")), vec![i as u8; 100]).unwrap();
        }
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 200);
        backup(&ctx, src.path()).await;

        let victim = dest
            .names()
            .into_iter()
            .find(|n| n.contains("-content.") && n.contains(".vol1."))
            .unwrap();
        assert!(dest.corrupt(&victim));

        let target = TempDir::new().unwrap();
        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        assert_eq!(result.failed_volumes, 1);
        assert_eq!(result.restored_files, 2);
        assert_eq!(result.warnings.count(WarningKind::Integrity), 1);
    }

    #[tokio::test]
    async fn test_corrupt_incremental_makes_point_unreachable() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"1").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        backup(&ctx, src.path()).await;
        fs::write(src.path().join("b"), b"2").unwrap();
        let second = backup(&ctx, src.path()).await;

        let victim = dest
            .names()
            .into_iter()
            .find(|n| n.contains("-inc-content."))
            .unwrap();
        assert!(dest.corrupt(&victim));

        let target = TempDir::new().unwrap();
        let err = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap_err();
        match err {
            EngineError::Integrity(IntegrityError::UnreachableIncremental { timestamp, .. }) => {
                assert_eq!(timestamp, second)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    async fn six_single_file_volumes(dest: &MemoryDestination) {
        let src = TempDir::new().unwrap();
        for i in 0..6 {
            fs::write(src.path().join(format!("f{i}")), vec![i as u8; 100]).unwrap();
        }
        let ctx = context(dest, 100);
        backup(&ctx, src.path()).await;
        let chain = ctx.load_chain().await.unwrap();
        assert_eq!(chain.latest_full().unwrap().content_volumes.len(), 6);
    }

    #[tokio::test]
    async fn test_paused_restore_waits_at_volume_boundary() {
        let dest = MemoryDestination::new();
        six_single_file_volumes(&dest).await;

        let ctx = context(&dest, 100);
        ctx.control.pause();
        let target = TempDir::new().unwrap();
        let request = RestoreRequest::latest(target.path());
        let worker = ctx.clone();
        let handle = tokio::spawn(async move { RestoreEngine::new(&worker).run(&request).await });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);

        ctx.control.resume();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.complete);
        assert_eq!(result.restored_files, 6);
    }

    #[tokio::test]
    async fn test_stop_request_ends_restore_after_first_volume() {
        let dest = MemoryDestination::new();
        six_single_file_volumes(&dest).await;

        let ctx = context(&dest, 100);
        ctx.control.request_stop();
        let target = TempDir::new().unwrap();
        let result = RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        assert!(!result.complete);
        assert_eq!(result.restored_files, 1);
        assert_eq!(read(target.path(), "f0"), vec![0u8; 100]);
        assert!(!target.path().join("f1").exists());
    }

    #[tokio::test]
    async fn test_stop_during_incrementals_reports_last_applied_point() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), b"1").unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let first = backup(&ctx, src.path()).await;
        fs::write(src.path().join("b"), b"2").unwrap();
        backup(&ctx, src.path()).await;

        let stopping = context(&dest, 1 << 20);
        stopping.control.request_stop();
        let target = TempDir::new().unwrap();
        let result = RestoreEngine::new(&stopping)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        assert!(!result.complete);
        assert_eq!(result.applied_incrementals, 0);
        assert_eq!(result.restored_point, first);
        assert!(!target.path().join("b").exists());
    }
}
