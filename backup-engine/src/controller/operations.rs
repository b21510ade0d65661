//! Maintenance operations built on the executors: list, repair, compact
//! and test.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::chain::{BackupEntry, Chain};
use crate::executor::diff::{BackupJob, BackupResult, DiffEngine};
use crate::executor::volumes::{fetch_manifest, fetch_volume};
use crate::executor::{
    next_backup_timestamp, report_chain_issues, EngineContext, RestoreEngine, RestoreRequest, RetentionPolicy,
};
use crate::fs::filter::PathFilter;
use crate::report::{WarningKind, WarningLog};
use crate::sync::SignatureSet;
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{EngineError, Result};
use crate::utils::units::parse_point_in_time;

/// Retention as requested by a caller, before "now" is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionRule {
    KeepLastFull(usize),
    /// Duration, date or timestamp accepted by [`parse_point_in_time`]
    OlderThan(String),
}

impl RetentionRule {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<RetentionPolicy> {
        match self {
            RetentionRule::KeepLastFull(n) => Ok(RetentionPolicy::KeepLastFull(*n)),
            RetentionRule::OlderThan(spec) => Ok(RetentionPolicy::OlderThan(parse_point_in_time(spec, now)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    pub volumes: usize,
    pub bytes: u64,
}

impl From<&BackupEntry> for EntrySummary {
    fn from(entry: &BackupEntry) -> Self {
        Self {
            name: entry.filename.clone(),
            timestamp: entry.timestamp,
            is_full: entry.is_full,
            volumes: entry.content_volumes.len() + entry.signature_volumes.len(),
            bytes: entry.total_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSummary {
    pub full: EntrySummary,
    pub incrementals: Vec<EntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListReport {
    pub chains: Vec<ChainSummary>,
    pub orphans: Vec<EntrySummary>,
    pub broken: Vec<String>,
    pub dangling: Vec<String>,
    pub total_bytes: u64,
    pub warnings: WarningLog,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub dry_run: bool,
    /// Untrusted objects: dangling volumes and volumes their manifest does not name
    pub candidates: Vec<String>,
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
    pub warnings: WarningLog,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    /// Full backup the compacted state was read from
    pub source_full: String,
    pub source_point: DateTime<Utc>,
    /// Absent when a stop request interrupted the restore stage
    pub backup: Option<BackupResult>,
    pub warnings: WarningLog,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub entries_checked: usize,
    pub volumes_checked: usize,
    pub failed_volumes: Vec<String>,
    pub warnings: WarningLog,
}

/// Summarize the chain without downloading anything.
pub async fn list(ctx: &EngineContext) -> Result<ListReport> {
    let chain = ctx.load_chain().await?;
    let mut warnings = WarningLog::new();
    report_chain_issues(&chain, &mut warnings);
    Ok(summarize(&chain, warnings))
}

pub fn summarize(chain: &Chain, warnings: WarningLog) -> ListReport {
    let chains = chain
        .fulls()
        .map(|full| ChainSummary {
            full: full.into(),
            incrementals: chain.incrementals_of(full).map(EntrySummary::from).collect(),
        })
        .collect();

    ListReport {
        chains,
        orphans: chain.orphans.iter().map(|&id| chain.entry(id).into()).collect(),
        broken: chain.broken.iter().map(|&id| chain.entry(id).filename.clone()).collect(),
        dangling: chain.dangling.iter().map(|v| v.name.clone()).collect(),
        total_bytes: chain.entries.iter().map(|e| e.total_size()).sum::<u64>()
            + chain.dangling.iter().map(|v| v.size).sum::<u64>(),
        warnings,
    }
}

/// Remove volumes no manifest vouches for and abandoned partial writes.
/// Dry run unless `force`.
pub async fn repair(ctx: &EngineContext, force: bool) -> Result<RepairReport> {
    let chain = ctx.load_chain().await?;
    let mut warnings = WarningLog::new();
    let mut candidates: Vec<(String, u64)> = chain.dangling.iter().map(|v| (v.name.clone(), v.size)).collect();
    for leftover in ctx.destination.list_incomplete().await? {
        candidates.push((leftover.name, leftover.size));
    }

    for entry in &chain.entries {
        let manifest = match fetch_manifest(ctx, entry).await {
            Ok(m) => m,
            Err(EngineError::Aborted) => return Err(EngineError::Aborted),
            Err(e) => {
                warnings.about(WarningKind::Integrity, entry.filename.clone(), format!("manifest unreadable: {e}"));
                continue;
            }
        };
        for volume in entry.content_volumes.iter().chain(entry.signature_volumes.iter()) {
            if !manifest.references(volume) {
                candidates.push((volume.name.clone(), volume.size));
            }
        }
    }

    let mut report = RepairReport {
        dry_run: !force,
        candidates: candidates.iter().map(|(name, _)| name.clone()).collect(),
        deleted: Vec::new(),
        freed_bytes: 0,
        warnings: WarningLog::new(),
    };

    if force {
        for (name, size) in candidates {
            ctx.control.ensure_not_aborted()?;
            match ctx.destination.delete(&name).await {
                Ok(()) => {
                    report.freed_bytes += size;
                    report.deleted.push(name);
                }
                Err(e) => warnings.about(WarningKind::Destination, name, e.to_string()),
            }
        }
        info!(
            "Repair removed {} untrusted object(s), {}",
            report.deleted.len(),
            format_bytes(report.freed_bytes)
        );
    } else {
        for name in &report.candidates {
            info!("Would remove untrusted object {}", name);
        }
    }

    report.warnings = warnings;
    Ok(report)
}

/// Restore the newest state into scratch space and store it as a new full.
pub async fn compact(ctx: &EngineContext) -> Result<CompactReport> {
    let mut warnings = WarningLog::new();
    let chain = ctx.load_chain().await?;
    report_chain_issues(&chain, &mut warnings);

    let staging = ctx.scratch_dir()?;
    let tree: PathBuf = staging.path().join("tree");
    tokio::fs::create_dir_all(&tree).await?;

    let restored = RestoreEngine::new(ctx)
        .restore_from_chain(&chain, &RestoreRequest::latest(&tree).overwrite(true))
        .await?;
    warnings.extend(restored.warnings);
    if !restored.complete {
        info!("Stop requested, {} left uncompacted", restored.full);
        return Ok(CompactReport {
            source_full: restored.full,
            source_point: restored.restored_point,
            backup: None,
            warnings,
        });
    }

    let job = BackupJob {
        sources: vec![tree],
        filter: PathFilter::all(),
        full: true,
        volume_size: ctx.options.volume_size,
        total_size: None,
        allow_missing_source: false,
        block_size: ctx.options.block_size,
        timestamp: next_backup_timestamp(&chain, Utc::now()),
    };
    let mut backup = DiffEngine::new(ctx).run(&job, &SignatureSet::new(), warnings).await?;
    let warnings = std::mem::take(&mut backup.warnings);
    info!(
        "Compacted {} (state at {}) into {}",
        restored.full, restored.restored_point, backup.manifest
    );

    Ok(CompactReport {
        source_full: restored.full,
        source_point: restored.restored_point,
        backup: Some(backup),
        warnings,
    })
}

/// Download and verify every volume of the newest `samples` backup points.
pub async fn verify_samples(ctx: &EngineContext, samples: usize) -> Result<TestReport> {
    let chain = ctx.load_chain().await?;
    let mut warnings = WarningLog::new();
    report_chain_issues(&chain, &mut warnings);

    let mut report = TestReport {
        entries_checked: 0,
        volumes_checked: 0,
        failed_volumes: Vec::new(),
        warnings: WarningLog::new(),
    };

    for entry in chain.entries.iter().rev().take(samples) {
        report.entries_checked += 1;
        let manifest = match fetch_manifest(ctx, entry).await {
            Ok(m) => m,
            Err(EngineError::Aborted) => return Err(EngineError::Aborted),
            Err(e) => {
                report.failed_volumes.push(entry.filename.clone());
                warnings.about(WarningKind::Integrity, entry.filename.clone(), e.to_string());
                continue;
            }
        };

        for volume in entry.content_volumes.iter().chain(entry.signature_volumes.iter()) {
            if !manifest.references(volume) {
                continue;
            }
            report.volumes_checked += 1;
            match fetch_volume(ctx, &manifest, &entry.filename, volume).await {
                Ok(unpacked) if unpacked.failures.is_empty() => {}
                Ok(unpacked) => {
                    report.failed_volumes.push(volume.name.clone());
                    warnings.about(
                        WarningKind::Integrity,
                        volume.name.clone(),
                        format!("{} unreadable entries", unpacked.failures.len()),
                    );
                }
                Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                Err(e) => {
                    report.failed_volumes.push(volume.name.clone());
                    warnings.about(WarningKind::Integrity, volume.name.clone(), e.to_string());
                }
            }
        }
    }

    info!(
        "Tested {} backup(s), {} volume(s), {} failure(s)",
        report.entries_checked,
        report.volumes_checked,
        report.failed_volumes.len()
    );
    report.warnings = warnings;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::filename::VolumeKind;
    use crate::chain::tests::t;
    use crate::destination::MemoryDestination;
    use crate::executor::tests::context;
    use crate::executor::BackupExecutor;
    use crate::executor::RetentionEngine;
    use std::fs;
    use tempfile::TempDir;

    async fn two_backups(ctx: &EngineContext) -> TempDir {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"one").unwrap();
        BackupExecutor::new(ctx.clone()).execute(&[src.path().into()]).await.unwrap();
        fs::write(src.path().join("b.txt"), b"two").unwrap();
        BackupExecutor::new(ctx.clone()).execute(&[src.path().into()]).await.unwrap();
        src
    }

    #[test]
    fn test_retention_rule_resolves_against_now() {
        let now = t(86_400 * 10);
        assert_eq!(
            RetentionRule::OlderThan("2d".into()).resolve(now).unwrap(),
            RetentionPolicy::OlderThan(t(86_400 * 8))
        );
        assert_eq!(
            RetentionRule::KeepLastFull(2).resolve(now).unwrap(),
            RetentionPolicy::KeepLastFull(2)
        );
        assert!(RetentionRule::OlderThan("soon".into()).resolve(now).is_err());
    }

    #[tokio::test]
    async fn test_list_groups_incrementals_under_full() {
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let _src = two_backups(&ctx).await;

        let report = list(&ctx).await.unwrap();
        assert_eq!(report.chains.len(), 1);
        assert_eq!(report.chains[0].incrementals.len(), 1);
        assert!(report.chains[0].full.is_full);
        assert!(report.dangling.is_empty());
        assert!(report.total_bytes > 0);
    }

    #[tokio::test]
    async fn test_repair_removes_untrusted_volumes() {
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let _src = two_backups(&ctx).await;

        // Leftovers of an interrupted run: a volume without manifest and an
        // extra volume the manifest never recorded
        let dangling = ctx.names.encode(VolumeKind::Content, true, t(0), Some(1), "tzst", None);
        dest.overwrite(&dangling, vec![1u8; 8]);
        let full = ctx.load_chain().await.unwrap().latest_full().unwrap().clone();
        let extra = ctx.names.encode(VolumeKind::Content, true, full.timestamp, Some(9), "tzst", None);
        dest.overwrite(&extra, vec![2u8; 8]);

        let dry = repair(&ctx, false).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.candidates.len(), 2);
        assert!(dest.contains(&dangling));

        let forced = repair(&ctx, true).await.unwrap();
        assert_eq!(forced.deleted.len(), 2);
        assert!(!dest.contains(&dangling));
        assert!(!dest.contains(&extra));
        assert!(repair(&ctx, true).await.unwrap().candidates.is_empty());
    }

    #[tokio::test]
    async fn test_compact_lets_retention_drop_old_chain() {
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let _src = two_backups(&ctx).await;

        let report = compact(&ctx).await.unwrap();
        let backup = report.backup.unwrap();
        assert!(backup.is_full);
        assert_eq!(backup.added_files, 2);

        let retention = RetentionEngine::new(&ctx)
            .run(RetentionPolicy::KeepLastFull(1), true)
            .await
            .unwrap();
        assert_eq!(retention.deleted_entries.len(), 2);

        let target = TempDir::new().unwrap();
        RestoreEngine::new(&ctx)
            .run(&RestoreRequest::latest(target.path()))
            .await
            .unwrap();
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"one");
        assert_eq!(fs::read(target.path().join("b.txt")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_verify_samples_detects_corruption() {
        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1 << 20);
        let _src = two_backups(&ctx).await;

        let clean = verify_samples(&ctx, 2).await.unwrap();
        assert_eq!(clean.entries_checked, 2);
        assert_eq!(clean.volumes_checked, 4);
        assert!(clean.failed_volumes.is_empty());

        let victim = dest.names().into_iter().find(|n| n.contains("-inc-content.")).unwrap();
        dest.corrupt(&victim);
        let report = verify_samples(&ctx, 1).await.unwrap();
        assert_eq!(report.entries_checked, 1);
        assert_eq!(report.failed_volumes, vec![victim]);
    }
}
