//! Diff pipeline: walk, classify, delta-encode and pack into volume pairs.
//!
//! Every sealed pair is uploaded content first, then signature, then the
//! rewritten manifest, so the manifest at the destination only ever names
//! volumes that are fully stored.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::manifest::{BackupCounters, Manifest};
use super::EngineContext;
use crate::chain::filename::VolumeKind;
use crate::controller::task::Checkpoint;
use crate::events::{EventBody, VolumeSealedPayload};
use crate::fs::filter::PathFilter;
use crate::fs::walker::{walk_source, FileInfo};
use crate::report::{WarningKind, WarningLog};
use crate::sync::delta::{compute_delta, delta_compression_ratio};
use crate::sync::signature::{block_signature, FileRecord, SignatureIndex, INDEX_ENTRY, SIGNATURE_PREFIX};
use crate::sync::{sha256_hex, SignatureSet};
use crate::transfer::progress::{format_bytes, format_duration, format_speed, ProgressTracker};
use crate::utils::errors::{EngineError, Result};
use crate::volume::{VolumeCodec, VolumeFile};

/// Prefix of whole-file entries in content volumes
pub const CONTENT_PREFIX: &str = "content/";
/// Prefix of rsync delta entries in content volumes
pub const DELTA_PREFIX: &str = "delta/";

#[derive(Debug, Clone)]
pub struct BackupJob {
    pub sources: Vec<PathBuf>,
    pub filter: PathFilter,
    pub full: bool,
    /// Upper bound of stored file bytes (whole files and deltas) per volume.
    /// Archive headers, padding and compression are not counted.
    pub volume_size: u64,
    pub total_size: Option<u64>,
    pub allow_missing_source: bool,
    pub block_size: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub index: u32,
    pub content_name: String,
    pub signature_name: String,
    /// File and delta bytes before packing
    pub payload_bytes: u64,
    pub content_bytes: u64,
    pub signature_bytes: u64,
    pub files: usize,
}

/// Backup execution result
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub manifest: String,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    pub examined_files: usize,
    pub examined_bytes: u64,
    pub added_files: usize,
    pub added_bytes: u64,
    pub modified_files: usize,
    pub modified_bytes: u64,
    pub unchanged_files: usize,
    pub unchanged_bytes: u64,
    pub deleted_files: usize,
    pub volumes: Vec<VolumeSummary>,
    pub uploaded_bytes: u64,
    /// False when stopped or capped before every change was stored
    pub complete: bool,
    pub warnings: WarningLog,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Modified,
}

struct Candidate {
    info: FileInfo,
    path: String,
    change: Change,
}

enum Payload {
    Whole(Vec<u8>),
    Delta(Vec<u8>),
}

impl Payload {
    fn len(&self) -> u64 {
        match self {
            Payload::Whole(d) | Payload::Delta(d) => d.len() as u64,
        }
    }
}

struct PreparedFile {
    record: FileRecord,
    signature: Vec<u8>,
    payload: Payload,
}

/// Volume pair being filled.
#[derive(Default)]
struct OpenVolume {
    content: Vec<VolumeFile>,
    signatures: Vec<VolumeFile>,
    index: SignatureIndex,
    payload_bytes: u64,
}

impl OpenVolume {
    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.index.deleted.is_empty()
    }

    fn push(&mut self, file: PreparedFile) {
        let path = file.record.path.clone();
        self.payload_bytes += file.payload.len();
        match file.payload {
            Payload::Whole(data) => self.content.push(VolumeFile::new(format!("{CONTENT_PREFIX}{path}"), data)),
            Payload::Delta(data) => self.content.push(VolumeFile::new(format!("{DELTA_PREFIX}{path}"), data)),
        }
        self.signatures
            .push(VolumeFile::new(format!("{SIGNATURE_PREFIX}{path}"), file.signature));
        self.index.files.push(file.record);
    }
}

/// Remove duplicate sources and sources nested inside another source.
pub fn normalize_sources(sources: &[PathBuf]) -> Vec<PathBuf> {
    let mut normalized: Vec<PathBuf> = Vec::new();
    for source in sources {
        let source = normalize_path(source);
        if normalized.iter().any(|s| source.starts_with(s)) {
            debug!("Removing source {} nested in another source", source.display());
            continue;
        }
        normalized.retain(|s| {
            let nested = s.starts_with(&source);
            if nested {
                debug!("Removing source {} nested in {}", s.display(), source.display());
            }
            !nested
        });
        normalized.push(source);
    }
    normalized
}

fn normalize_path(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Label per source. A single source needs no label.
pub fn source_labels(sources: &[PathBuf]) -> Vec<String> {
    if sources.len() <= 1 {
        return vec![String::new(); sources.len()];
    }

    let mut used: HashMap<String, usize> = HashMap::new();
    sources
        .iter()
        .map(|source| {
            let base = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "root".to_string());
            let count = used.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}-{count}")
            }
        })
        .collect()
}

fn labelled(label: &str, relative: &str) -> String {
    if label.is_empty() {
        relative.to_string()
    } else {
        format!("{label}/{relative}")
    }
}

/// Read one file and produce its record, block signature and payload.
fn prepare_file(candidate: &Candidate, prior_signature: Option<Vec<u8>>, block_size: u32) -> Result<PreparedFile> {
    let data = std::fs::read(&candidate.info.path)?;
    let signature = block_signature(&data, Some(block_size));
    let record = FileRecord {
        path: candidate.path.clone(),
        size: data.len() as u64,
        mtime: candidate.info.mtime,
        permissions: candidate.info.permissions,
        sha256: sha256_hex(&data),
    };

    let payload = match prior_signature.filter(|s| !s.is_empty()) {
        Some(prior) if candidate.change == Change::Modified => match compute_delta(&prior, &data) {
            Ok(delta) if delta.len() < data.len() => {
                debug!(
                    "Delta for {}: {} bytes ({:.1}% of file)",
                    candidate.path,
                    delta.len(),
                    delta_compression_ratio(delta.len(), data.len()) * 100.0
                );
                Payload::Delta(delta)
            }
            _ => Payload::Whole(data),
        },
        _ => Payload::Whole(data),
    };

    Ok(PreparedFile {
        record,
        signature,
        payload,
    })
}

pub struct DiffEngine<'a> {
    ctx: &'a EngineContext,
}

struct RunState {
    manifest: Manifest,
    manifest_name: String,
    volumes: Vec<VolumeSummary>,
    uploaded_bytes: u64,
}

impl<'a> DiffEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, job: &BackupJob, prior: &SignatureSet, mut warnings: WarningLog) -> Result<BackupResult> {
        let start_time = Instant::now();
        let ctx = self.ctx;
        let prior = if job.full { SignatureSet::new() } else { prior.clone() };

        info!(
            "Starting {} backup of {} source(s) at {}",
            if job.full { "full" } else { "incremental" },
            job.sources.len(),
            job.timestamp
        );

        // Sources are checked before anything is uploaded
        let labels = source_labels(&job.sources);
        let mut present = Vec::new();
        let mut missing_labels = Vec::new();
        for (source, label) in job.sources.iter().zip(labels) {
            if tokio::fs::metadata(source).await.is_ok() {
                present.push((source.clone(), label));
            } else if job.allow_missing_source {
                warnings.about(
                    WarningKind::PartialFailure,
                    source.display().to_string(),
                    "source path is missing, skipped",
                );
                missing_labels.push(label);
            } else {
                return Err(EngineError::SourceMissing(source.clone()));
            }
        }

        let filter = job.filter.clone();
        let walked = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut issues = Vec::new();
            for (source, label) in &present {
                match walk_source(source, &filter) {
                    Ok(outcome) => {
                        files.extend(outcome.files.into_iter().map(|info| (label.clone(), info)));
                        issues.extend(outcome.issues);
                    }
                    Err(e) => issues.push(crate::fs::walker::WalkIssue {
                        path: source.clone(),
                        message: e.to_string(),
                    }),
                }
            }
            (files, issues)
        })
        .await?;
        let (files, issues) = walked;
        for issue in issues {
            warnings.about(WarningKind::PartialFailure, issue.path.display().to_string(), issue.message);
        }

        let mut counters = BackupCounters::default();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut candidates = Vec::new();

        for (label, info) in files {
            let path = labelled(&label, &info.relative_path);
            counters.examined_files += 1;
            counters.examined_bytes += info.size;
            seen.insert(path.clone());

            match prior.get(&path) {
                Some(sig) if sig.matches(info.size, info.mtime) => {
                    counters.unchanged_files += 1;
                    counters.unchanged_bytes += info.size;
                }
                Some(_) => candidates.push(Candidate {
                    info,
                    path,
                    change: Change::Modified,
                }),
                None => candidates.push(Candidate {
                    info,
                    path,
                    change: Change::Added,
                }),
            }
        }

        let in_missing_source = |path: &str| {
            missing_labels
                .iter()
                .any(|label| label.is_empty() || path.starts_with(&format!("{label}/")))
        };
        let deleted: Vec<String> = prior
            .paths()
            .filter(|p| !seen.contains(*p) && !in_missing_source(p))
            .map(|p| p.to_string())
            .collect();
        counters.deleted_files = deleted.len();

        let changed_bytes: u64 = candidates.iter().map(|c| c.info.size).sum();
        info!(
            "Examined {} files ({}): {} changed, {} unchanged, {} deleted",
            counters.examined_files,
            format_bytes(counters.examined_bytes),
            candidates.len(),
            counters.unchanged_files,
            deleted.len()
        );

        let mut state = RunState {
            manifest: Manifest::new(job.timestamp, job.full, ctx.hostname.clone()),
            manifest_name: ctx.names.manifest_name(job.full, job.timestamp, None),
            volumes: Vec::new(),
            uploaded_bytes: 0,
        };
        let mut tracker = ProgressTracker::new(changed_bytes, candidates.len());
        let mut current = OpenVolume::default();
        current.index.deleted = deleted;
        let mut stopped = false;

        for candidate in candidates {
            let prior_signature = prior.get(&candidate.path).map(|s| s.signature.clone());
            let block_size = job.block_size;
            let (candidate, prepared) = tokio::task::spawn_blocking(move || {
                let prepared = prepare_file(&candidate, prior_signature, block_size);
                (candidate, prepared)
            })
            .await?;

            let prepared = match prepared {
                Ok(p) => p,
                Err(e) => {
                    warnings.about(
                        WarningKind::PartialFailure,
                        candidate.path.clone(),
                        format!("unreadable, keeping previous version: {e}"),
                    );
                    counters.failed_files += 1;
                    continue;
                }
            };

            if current.payload_bytes > 0 && current.payload_bytes + prepared.payload.len() > job.volume_size {
                let sealed = std::mem::take(&mut current);
                self.seal(&mut state, sealed, &counters).await?;

                if ctx.control.checkpoint().await? == Checkpoint::Stop {
                    info!("Stop requested, ending backup after volume {}", state.volumes.len());
                    stopped = true;
                    break;
                }
                if job.total_size.is_some_and(|cap| state.uploaded_bytes >= cap) {
                    info!("Total size cap reached after {}", format_bytes(state.uploaded_bytes));
                    stopped = true;
                    break;
                }
            }

            match candidate.change {
                Change::Added => {
                    counters.added_files += 1;
                    counters.added_bytes += prepared.record.size;
                }
                Change::Modified => {
                    counters.modified_files += 1;
                    counters.modified_bytes += prepared.record.size;
                }
            }
            let size = prepared.record.size;
            current.push(prepared);

            if let Some(progress) = tracker.file_done(&candidate.path, size) {
                ctx.events.emit(EventBody::Progress(progress.to_payload()));
            }
        }

        if !current.is_empty() || state.volumes.is_empty() {
            self.seal(&mut state, current, &counters).await?;
        }

        // Final manifest records completeness and the full counters
        state.manifest.complete = !stopped;
        state.manifest.counters = counters.clone();
        self.put(&state.manifest_name, state.manifest.to_json()?).await?;

        let duration_secs = start_time.elapsed().as_secs();
        info!(
            "Backup {} finished in {} ({}): {} volume(s), {} uploaded, complete: {}",
            state.manifest_name,
            format_duration(duration_secs),
            format_speed(tracker.average_speed()),
            state.volumes.len(),
            format_bytes(state.uploaded_bytes),
            !stopped
        );

        Ok(BackupResult {
            manifest: state.manifest_name,
            timestamp: job.timestamp,
            is_full: job.full,
            examined_files: counters.examined_files,
            examined_bytes: counters.examined_bytes,
            added_files: counters.added_files,
            added_bytes: counters.added_bytes,
            modified_files: counters.modified_files,
            modified_bytes: counters.modified_bytes,
            unchanged_files: counters.unchanged_files,
            unchanged_bytes: counters.unchanged_bytes,
            deleted_files: counters.deleted_files,
            volumes: state.volumes,
            uploaded_bytes: state.uploaded_bytes,
            complete: !stopped,
            warnings,
            duration_secs,
        })
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.ctx.control.ensure_not_aborted()?;
        self.ctx.destination.put(name, Bytes::from(data)).await
    }

    /// Pack, hash and upload one volume pair, then rewrite the manifest.
    async fn seal(&self, state: &mut RunState, volume: OpenVolume, counters: &BackupCounters) -> Result<()> {
        let ctx = self.ctx;
        let index = state.volumes.len() as u32 + 1;
        let timestamp = state.manifest.timestamp;
        let is_full = state.manifest.is_full;
        let payload_bytes = volume.payload_bytes;
        let files = volume.index.files.len();

        let codec: Arc<dyn VolumeCodec> = ctx.codec.clone();
        let (content_blob, signature_blob) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Vec<u8>)> {
            let mut signature_files = Vec::with_capacity(volume.signatures.len() + 1);
            signature_files.push(VolumeFile::new(INDEX_ENTRY, volume.index.to_json()?));
            signature_files.extend(volume.signatures);
            Ok((codec.pack(&volume.content)?, codec.pack(&signature_files)?))
        })
        .await??;

        let content_hash = sha256_hex(&content_blob);
        let signature_hash = sha256_hex(&signature_blob);
        let tag = ctx.codec.tag();
        let content_name = ctx.names.encode(VolumeKind::Content, is_full, timestamp, Some(index), tag, None);
        let signature_name = ctx.names.encode(VolumeKind::Signature, is_full, timestamp, Some(index), tag, None);
        let content_bytes = content_blob.len() as u64;
        let signature_bytes = signature_blob.len() as u64;

        self.put(&content_name, content_blob).await?;
        self.put(&signature_name, signature_blob).await?;

        state.manifest.push_volume(content_hash, signature_hash);
        state.manifest.counters = counters.clone();
        self.put(&state.manifest_name, state.manifest.to_json()?).await?;
        state.uploaded_bytes += content_bytes + signature_bytes;

        debug!(
            "Sealed volume {} ({} files, {} payload, {} packed)",
            index,
            files,
            format_bytes(payload_bytes),
            format_bytes(content_bytes)
        );
        ctx.events.emit(EventBody::VolumeSealed(VolumeSealedPayload {
            index,
            content_name: content_name.clone(),
            signature_name: signature_name.clone(),
            content_bytes,
            files,
        }));

        state.volumes.push(VolumeSummary {
            index,
            content_name,
            signature_name,
            payload_bytes,
            content_bytes,
            signature_bytes,
            files,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainBuilder;
    use crate::destination::{Destination, MemoryDestination};
    use crate::executor::tests::context;
    use crate::executor::volumes::load_signature_set;
    use std::fs;
    use tempfile::TempDir;

    fn job(sources: Vec<PathBuf>, full: bool, volume_size: u64, secs: i64) -> BackupJob {
        BackupJob {
            sources,
            filter: PathFilter::all(),
            full,
            volume_size,
            total_size: None,
            allow_missing_source: false,
            block_size: 1024,
            timestamp: crate::chain::tests::t(secs),
        }
    }

    #[test]
    fn test_normalize_sources() {
        let sources = vec![
            PathBuf::from("/data/a/b"),
            PathBuf::from("/data/a"),
            PathBuf::from("/data/a/"),
            PathBuf::from("/other"),
            PathBuf::from("/data/ab"),
        ];
        assert_eq!(
            normalize_sources(&sources),
            vec![PathBuf::from("/data/a"), PathBuf::from("/other"), PathBuf::from("/data/ab")]
        );
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(source_labels(&[PathBuf::from("/x/docs")]), vec![""]);
        assert_eq!(
            source_labels(&[PathBuf::from("/x/docs"), PathBuf::from("/y/docs"), PathBuf::from("/")]),
            vec!["docs", "docs-2", "root"]
        );
    }

    #[tokio::test]
    async fn test_hundred_files_ten_per_volume() {
        let src = TempDir::new().unwrap();
        for i in 0..100 {
            fs::write(src.path().join(format!("f{i:03}.bin")), vec![i as u8; 100]).unwrap();
        }

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1000);
        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 1000, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();

        assert!(result.complete);
        assert_eq!(result.added_files, 100);
        assert!(result.volumes.len() >= 10);
        assert!(result.volumes.iter().all(|v| v.payload_bytes <= 1000));
        assert_eq!(result.volumes.iter().map(|v| v.files).sum::<usize>(), 100);

        let chain = ChainBuilder::new(&ctx.names).build(&dest.list().await.unwrap());
        let full = chain.latest_full().unwrap();
        assert_eq!(full.content_volumes.len(), result.volumes.len());
        assert!(chain.broken.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_file_gets_own_volume() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a"), vec![1u8; 10]).unwrap();
        fs::write(src.path().join("b"), vec![2u8; 5000]).unwrap();
        fs::write(src.path().join("c"), vec![3u8; 10]).unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 100);
        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 100, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();

        let files: Vec<usize> = result.volumes.iter().map(|v| v.files).collect();
        assert_eq!(files, vec![1, 1, 1]);
        assert_eq!(result.volumes[1].payload_bytes, 5000);
    }

    #[tokio::test]
    async fn test_incremental_classifies_changes() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("keep.txt"), b"unchanged").unwrap();
        fs::write(src.path().join("edit.bin"), vec![b'a'; 20_000]).unwrap();
        fs::write(src.path().join("gone.txt"), b"bye").unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 1 << 20, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();

        let chain = ctx.load_chain().await.unwrap();
        let prior = load_signature_set(&ctx, &chain, chain.latest_full().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(prior.len(), 3);

        let mut edited = vec![b'a'; 20_000];
        edited[10_000] = b'b';
        fs::write(src.path().join("edit.bin"), &edited).unwrap();
        // Make sure the heuristic sees a change even within the same second
        let old = prior.get("edit.bin").unwrap().record.mtime;
        crate::fs::metadata::FileMetadata {
            size: 0,
            modified: old + 10,
            permissions: None,
        }
        .apply_to_path(&src.path().join("edit.bin"))
        .unwrap();
        fs::remove_file(src.path().join("gone.txt")).unwrap();
        fs::write(src.path().join("new.txt"), b"hello").unwrap();

        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], false, 1 << 20, 10), &prior, WarningLog::new())
            .await
            .unwrap();

        assert_eq!(result.added_files, 1);
        assert_eq!(result.modified_files, 1);
        assert_eq!(result.unchanged_files, 1);
        assert_eq!(result.deleted_files, 1);
        assert_eq!(result.volumes.len(), 1);
        // The edit is stored as a delta, far smaller than the file
        assert!(result.volumes[0].payload_bytes < 10_000);
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_upload() {
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let err = DiffEngine::new(&ctx)
            .run(
                &job(vec![PathBuf::from("/definitely/missing/source")], true, 1 << 20, 0),
                &SignatureSet::new(),
                WarningLog::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceMissing(_)));
        assert!(dest.names().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_missing_source_keeps_its_files() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("x"), b"x").unwrap();
        fs::write(b.path().join("y"), b"y").unwrap();
        let sources = vec![a.path().to_path_buf(), b.path().to_path_buf()];

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        DiffEngine::new(&ctx)
            .run(&job(sources.clone(), true, 1 << 20, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();
        let chain = ctx.load_chain().await.unwrap();
        let prior = load_signature_set(&ctx, &chain, chain.latest_full().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(prior.len(), 2);

        fs::remove_dir_all(b.path()).unwrap();
        let mut second = job(sources, false, 1 << 20, 10);
        second.allow_missing_source = true;
        let result = DiffEngine::new(&ctx)
            .run(&second, &prior, WarningLog::new())
            .await
            .unwrap();
        assert_eq!(result.warnings.count(WarningKind::PartialFailure), 1);
        assert_eq!(result.unchanged_files, 1);
        // Files of the missing source are not reported as deleted
        assert_eq!(result.deleted_files, 0);
    }

    #[tokio::test]
    async fn test_total_size_cap_yields_partial_backup() {
        let src = TempDir::new().unwrap();
        for i in 0..20 {
            fs::write(src.path().join(format!("f{i:02}")), vec![i as u8; 500]).unwrap();
        }
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1000);
        let mut capped = job(vec![src.path().into()], true, 1000, 0);
        capped.total_size = Some(1);

        let result = DiffEngine::new(&ctx)
            .run(&capped, &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();
        assert!(!result.complete);
        assert_eq!(result.volumes.len(), 1);

        let manifest_name = ctx.names.manifest_name(true, capped.timestamp, None);
        let manifest = Manifest::from_json(&dest.get(&manifest_name).await.unwrap()).unwrap();
        assert!(!manifest.complete);
        assert_eq!(manifest.volume_count, 1);
    }

    #[tokio::test]
    async fn test_stop_request_ends_after_current_volume() {
        let src = TempDir::new().unwrap();
        for i in 0..10 {
            fs::write(src.path().join(format!("f{i}")), vec![1u8; 100]).unwrap();
        }
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 100);
        ctx.control.request_stop();

        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 100, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();
        assert!(!result.complete);
        assert_eq!(result.volumes.len(), 1);
        assert_eq!(result.added_files, 1);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_manifest_consistent() {
        let src = TempDir::new().unwrap();
        for i in 0..3 {
            fs::write(src.path().join(format!("f{i}")), vec![i as u8; 100]).unwrap();
        }
        let dest = MemoryDestination::new();
        dest.fail_puts_matching(".vol2.");
        let ctx = context(&dest, 100);

        let backup = job(vec![src.path().into()], true, 100, 0);
        let err = DiffEngine::new(&ctx)
            .run(&backup, &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let manifest_name = ctx.names.manifest_name(true, backup.timestamp, None);
        let manifest = Manifest::from_json(&dest.get(&manifest_name).await.unwrap()).unwrap();
        assert!(!manifest.complete);
        assert_eq!(manifest.volume_count, 1);
    }

    #[tokio::test]
    async fn test_nothing_changed_still_writes_a_volume_pair() {
        let src = TempDir::new().unwrap();
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 100);
        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 100, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();
        assert!(result.complete);
        assert_eq!(result.volumes.len(), 1);
        assert_eq!(dest.names().len(), 3);
    }

    #[tokio::test]
    async fn test_volume_size_excludes_archive_framing() {
        let src = TempDir::new().unwrap();
        for i in 0..20 {
            fs::write(src.path().join(format!("f{i:02}")), vec![i as u8; 100]).unwrap();
        }
        let dest = MemoryDestination::new();
        let mut options = crate::controller::options::EngineOptions::default();
        options.volume_size = 1000;
        options.compression = "tar".to_string();
        let ctx = EngineContext::new(
            Arc::new(dest.clone()),
            Arc::new(crate::registry::ModuleRegistry::builtin()),
            options,
        )
        .unwrap();

        let result = DiffEngine::new(&ctx)
            .run(&job(vec![src.path().into()], true, 1000, 0), &SignatureSet::new(), WarningLog::new())
            .await
            .unwrap();
        assert_eq!(result.volumes.len(), 2);
        for volume in &result.volumes {
            assert_eq!(volume.payload_bytes, 1000);
            // one header block plus padding per entry, two trailer blocks
            assert!(volume.content_bytes > volume.payload_bytes);
            assert!(volume.content_bytes <= volume.payload_bytes + 1024 * (volume.files as u64 + 1));
        }
    }
}
