//! Backup engine executors.
//!
//! [`EngineContext`] bundles everything one operation needs: destination,
//! codecs, naming, options, the event bus and the task control handle. The
//! executors in the submodules each implement one operation on top of it.

pub mod diff;
pub mod manifest;
pub mod restore;
pub mod retention;
pub mod volumes;

use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::filename::{to_name_resolution, FilenameCodec};
use crate::chain::{Chain, ChainBuilder};
use crate::controller::options::EngineOptions;
use crate::controller::task::TaskControl;
use crate::destination::Destination;
use crate::events::EventBus;
use crate::fs::filter::{FilterRules, PathFilter};
use crate::registry::ModuleRegistry;
use crate::report::{WarningKind, WarningLog};
use crate::sync::SignatureSet;
use crate::utils::errors::{EngineError, IntegrityError, Result};
use crate::volume::VolumeCodec;

pub use diff::{BackupJob, BackupResult, DiffEngine, VolumeSummary};
pub use restore::{RestoreEngine, RestoreRequest, RestoreResult, RestoreSelection};
pub use retention::{RetentionEngine, RetentionPolicy, RetentionReport};

/// Shared state for one operation.
#[derive(Clone)]
pub struct EngineContext {
    pub destination: Arc<dyn Destination>,
    pub registry: Arc<ModuleRegistry>,
    pub options: EngineOptions,
    /// Codec for new volumes
    pub codec: Arc<dyn VolumeCodec>,
    pub names: FilenameCodec,
    pub events: EventBus,
    pub control: TaskControl,
    pub hostname: Option<String>,
}

impl EngineContext {
    pub fn new(destination: Arc<dyn Destination>, registry: Arc<ModuleRegistry>, options: EngineOptions) -> Result<Self> {
        let names = FilenameCodec::new(options.backup_prefix.clone())?;
        let codec = registry.writer_codec(&options)?;
        let hostname = hostname::get().ok().map(|h| h.to_string_lossy().into_owned());

        Ok(Self {
            destination,
            registry,
            options,
            codec,
            names,
            events: EventBus::new(),
            control: TaskControl::new(),
            hostname,
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_control(mut self, control: TaskControl) -> Self {
        self.control = control;
        self
    }

    /// List the destination and rebuild the chain.
    pub async fn load_chain(&self) -> Result<Chain> {
        let listing = self.destination.list().await?;
        Ok(ChainBuilder::new(&self.names).build(&listing))
    }

    /// Codec able to read a volume with the given compression tag.
    pub fn reader_codec(&self, tag: &str) -> Result<Arc<dyn VolumeCodec>> {
        self.registry.codec(tag, &self.options)
    }

    /// Scratch directory, under `temp-dir` when configured.
    pub fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("backup-engine-");
        let dir = match &self.options.temp_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    pub fn filter(&self) -> Result<PathFilter> {
        PathFilter::new(&FilterRules {
            include: self.options.include.clone(),
            exclude: self.options.exclude.clone(),
        })
    }
}

/// Report orphaned, broken and dangling chain members as warnings.
pub fn report_chain_issues(chain: &Chain, warnings: &mut WarningLog) {
    for &id in &chain.orphans {
        let name = chain.entry(id).filename.clone();
        let issue = IntegrityError::OrphanedIncremental { name: name.clone() };
        warnings.about(WarningKind::Integrity, name, issue.to_string());
    }
    for &id in &chain.broken {
        warnings.about(
            WarningKind::Integrity,
            chain.entry(id).filename.clone(),
            "backup is missing its signature or content volumes",
        );
    }
    for volume in &chain.dangling {
        warnings.about(
            WarningKind::Integrity,
            volume.name.clone(),
            "volume has no manifest and is untrusted",
        );
    }
}

/// Timestamp for a new backup point: now, but strictly after everything
/// already present at the destination.
pub fn next_backup_timestamp(chain: &Chain, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = to_name_resolution(now);
    let latest = chain
        .latest_timestamp()
        .into_iter()
        .chain(chain.dangling.iter().map(|v| v.timestamp))
        .max();
    match latest {
        Some(latest) if latest >= now => latest + Duration::seconds(1),
        _ => now,
    }
}

/// Runs a backup: decides full vs incremental, loads the prior signature
/// set and hands off to the [`DiffEngine`].
pub struct BackupExecutor {
    ctx: EngineContext,
}

impl BackupExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Execute a backup of `sources`
    pub async fn execute(&self, sources: &[PathBuf]) -> Result<BackupResult> {
        let sources = diff::normalize_sources(sources);
        if sources.is_empty() {
            return Err(EngineError::Config("no source paths given".into()));
        }

        let options = &self.ctx.options;
        let mut warnings = WarningLog::new();
        let chain = self.ctx.load_chain().await?;
        report_chain_issues(&chain, &mut warnings);

        let now = Utc::now();
        let mut full = options.full;
        match chain.latest_full() {
            None => {
                info!("No previous full backup found, running a full backup");
                full = true;
            }
            Some(latest) => {
                if let Some(max_age) = options.full_if_older_than {
                    if latest.timestamp + max_age < now {
                        info!("Latest full backup from {} is older than the limit, running a full backup", latest.timestamp);
                        full = true;
                    }
                }
            }
        }

        let mut prior = SignatureSet::new();
        if !full {
            if let Some(latest) = chain.latest_full() {
                match volumes::load_signature_set(&self.ctx, &chain, latest, None).await {
                    Ok(set) => {
                        info!("Loaded prior signatures for {} files", set.len());
                        prior = set;
                    }
                    Err(EngineError::Aborted) => return Err(EngineError::Aborted),
                    Err(e) => {
                        warn!("Incremental diff unavailable, falling back to full backup: {}", e);
                        warnings.about(
                            WarningKind::Integrity,
                            latest.filename.clone(),
                            format!("prior signatures unusable, running a full backup: {e}"),
                        );
                        full = true;
                    }
                }
            }
        }

        let job = BackupJob {
            sources,
            filter: self.ctx.filter()?,
            full,
            volume_size: options.volume_size,
            total_size: options.total_size,
            allow_missing_source: options.allow_missing_source,
            block_size: options.block_size,
            timestamp: next_backup_timestamp(&chain, now),
        };

        DiffEngine::new(&self.ctx).run(&job, &prior, warnings).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::tests::{backup_point, names, t};
    use crate::destination::MemoryDestination;

    pub(crate) fn context(dest: &MemoryDestination, volume_size: u64) -> EngineContext {
        let mut options = EngineOptions::default();
        options.volume_size = volume_size;
        EngineContext::new(Arc::new(dest.clone()), Arc::new(ModuleRegistry::builtin()), options).unwrap()
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let n = names();
        let chain = ChainBuilder::new(&n).build(&backup_point(&n, true, t(100), 1));
        assert_eq!(next_backup_timestamp(&chain, t(50)), t(101));
        assert_eq!(next_backup_timestamp(&chain, t(100)), t(101));
        assert_eq!(next_backup_timestamp(&chain, t(200)), t(200));
        assert_eq!(next_backup_timestamp(&Chain::default(), t(7)), t(7));
    }

    #[test]
    fn test_report_chain_issues() {
        let n = names();
        let mut listing = backup_point(&n, false, t(0), 1);
        listing.extend(backup_point(&n, true, t(10), 1));
        let chain = ChainBuilder::new(&n).build(&listing);
        let mut warnings = WarningLog::new();
        report_chain_issues(&chain, &mut warnings);
        assert_eq!(warnings.count(WarningKind::Integrity), 1);

        let orphan = warnings.iter().next().unwrap();
        assert_eq!(orphan.subject.as_deref(), Some(n.manifest_name(false, t(0), None).as_str()));
        assert!(orphan.message.contains("has no owning full backup"));
    }

    #[tokio::test]
    async fn test_executor_runs_full_then_incremental() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"first").unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1024 * 1024);
        let sources = vec![src.path().to_path_buf()];

        let first = BackupExecutor::new(ctx.clone()).execute(&sources).await.unwrap();
        assert!(first.is_full);
        assert_eq!(first.added_files, 1);

        std::fs::write(src.path().join("b.txt"), b"second").unwrap();
        let second = BackupExecutor::new(ctx.clone()).execute(&sources).await.unwrap();
        assert!(!second.is_full);
        assert_eq!(second.added_files, 1);
        assert_eq!(second.unchanged_files, 1);
        assert!(second.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn test_corrupt_prior_signatures_fall_back_to_full() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::write(src.path().join("a.txt"), b"data").unwrap();

        let dest = MemoryDestination::new();
        let ctx = context(&dest, 1024 * 1024);
        let sources = vec![src.path().to_path_buf()];
        BackupExecutor::new(ctx.clone()).execute(&sources).await.unwrap();

        let signature = dest.names().into_iter().find(|n| n.contains("-signature.")).unwrap();
        dest.corrupt(&signature);

        let second = BackupExecutor::new(ctx).execute(&sources).await.unwrap();
        assert!(second.is_full);
        assert!(second.warnings.count(WarningKind::Integrity) >= 1);
    }
}
