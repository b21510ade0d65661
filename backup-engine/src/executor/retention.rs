//! Retention: pick removable chain entries without breaking any chain that
//! is kept, then delete them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use super::EngineContext;
use crate::chain::{BackupEntry, Chain, EntryId};
use crate::report::{WarningKind, WarningLog};
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the newest `n` full backups and their incrementals
    KeepLastFull(usize),
    /// Remove chains superseded by a newer full at or before the cutoff
    OlderThan(DateTime<Utc>),
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::KeepLastFull(n) => write!(f, "keep last {n} full"),
            RetentionPolicy::OlderThan(cutoff) => write!(f, "older than {}", cutoff.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionCandidate {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub is_full: bool,
    pub objects: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetainedEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Entries selected by a policy, in deletion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// One group per full: newest incremental first, full last
    pub groups: Vec<Vec<EntryId>>,
    pub retained: Vec<(EntryId, String)>,
}

impl RetentionPlan {
    pub fn candidates(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.groups.iter().flatten().copied()
    }
}

/// Retention execution result
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub policy: String,
    pub dry_run: bool,
    pub candidates: Vec<RetentionCandidate>,
    pub retained: Vec<RetainedEntry>,
    /// Manifests removed together with all their volumes
    pub deleted_entries: Vec<String>,
    pub deleted_objects: usize,
    pub freed_bytes: u64,
    pub warnings: WarningLog,
}

fn group_of(full: &BackupEntry) -> Vec<EntryId> {
    let mut group: Vec<EntryId> = full.incrementals.iter().rev().copied().collect();
    group.push(full.id);
    group
}

/// Select what a policy removes. Orphaned incrementals are never selected.
pub fn plan_retention(chain: &Chain, policy: RetentionPolicy) -> Result<RetentionPlan> {
    let mut plan = RetentionPlan::default();

    match policy {
        RetentionPolicy::KeepLastFull(0) => {
            return Err(EngineError::Config("keep-last must keep at least one full backup".into()));
        }
        RetentionPolicy::KeepLastFull(n) => {
            let excess = chain.fulls.len().saturating_sub(n);
            for full in chain.fulls().take(excess) {
                plan.groups.push(group_of(full));
            }
        }
        RetentionPolicy::OlderThan(cutoff) => {
            let fulls: Vec<&BackupEntry> = chain.fulls().collect();
            for (i, full) in fulls.iter().enumerate() {
                if full.timestamp > cutoff {
                    break;
                }
                // A chain goes only once a newer full replaced it before the
                // cutoff; the state current at the cutoff stays restorable
                let superseded = fulls.get(i + 1).is_some_and(|next| next.timestamp <= cutoff);
                if !superseded {
                    let incrementals: Vec<&BackupEntry> = chain.incrementals_of(full).collect();
                    let newer = incrementals.iter().filter(|inc| inc.timestamp > cutoff).count();
                    let reason = if newer > 0 {
                        format!("retained due to dependency: {newer} newer incremental(s) rely on it")
                    } else {
                        "retained due to dependency: holds the restorable state at the cutoff".to_string()
                    };
                    plan.retained.push((full.id, reason));
                    for inc in incrementals {
                        let reason = if inc.timestamp > cutoff {
                            "retained due to dependency: newer than the cutoff"
                        } else {
                            "retained due to dependency: part of the state at the cutoff"
                        };
                        plan.retained.push((inc.id, reason.to_string()));
                    }
                    break;
                }
                plan.groups.push(group_of(full));
            }
        }
    }

    Ok(plan)
}

pub struct RetentionEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> RetentionEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Apply `policy`. Without `force` nothing is deleted.
    pub async fn run(&self, policy: RetentionPolicy, force: bool) -> Result<RetentionReport> {
        let chain = self.ctx.load_chain().await?;
        let plan = plan_retention(&chain, policy)?;
        let mut warnings = WarningLog::new();

        let candidates: Vec<RetentionCandidate> = plan
            .candidates()
            .map(|id| {
                let entry = chain.entry(id);
                RetentionCandidate {
                    name: entry.filename.clone(),
                    timestamp: entry.timestamp,
                    is_full: entry.is_full,
                    objects: entry.objects().count(),
                    bytes: entry.total_size(),
                }
            })
            .collect();
        let retained = plan
            .retained
            .iter()
            .map(|(id, reason)| {
                let entry = chain.entry(*id);
                info!("Not deleting {}: {}", entry.filename, reason);
                RetainedEntry {
                    name: entry.filename.clone(),
                    timestamp: entry.timestamp,
                    reason: reason.clone(),
                }
            })
            .collect();

        let mut report = RetentionReport {
            policy: policy.to_string(),
            dry_run: !force,
            candidates,
            retained,
            deleted_entries: Vec::new(),
            deleted_objects: 0,
            freed_bytes: 0,
            warnings: WarningLog::new(),
        };

        if !force {
            for candidate in &report.candidates {
                info!("Would delete {} ({})", candidate.name, format_bytes(candidate.bytes));
            }
            report.warnings = warnings;
            return Ok(report);
        }

        for group in &plan.groups {
            for &id in group {
                let entry = chain.entry(id);
                if !self.delete_entry(entry, &mut report, &mut warnings).await? {
                    // Entries older in the group are still needed by this one
                    warn!("Keeping the rest of the chain of {} after a failed delete", entry.filename);
                    break;
                }
            }
        }

        info!(
            "Retention ({}) removed {} entries, {} objects, {}",
            report.policy,
            report.deleted_entries.len(),
            report.deleted_objects,
            format_bytes(report.freed_bytes)
        );
        report.warnings = warnings;
        Ok(report)
    }

    /// Delete content volumes, then signature volumes, then the manifest.
    /// Returns false if any volume could not be deleted; the manifest then stays.
    async fn delete_entry(&self, entry: &BackupEntry, report: &mut RetentionReport, warnings: &mut WarningLog) -> Result<bool> {
        let mut clean = true;
        for volume in entry.content_volumes.iter().chain(entry.signature_volumes.iter()) {
            self.ctx.control.ensure_not_aborted()?;
            match self.ctx.destination.delete(&volume.name).await {
                Ok(()) => {
                    report.deleted_objects += 1;
                    report.freed_bytes += volume.size;
                }
                Err(e) => {
                    clean = false;
                    warnings.about(WarningKind::Destination, volume.name.clone(), e.to_string());
                }
            }
        }
        if !clean {
            return Ok(false);
        }

        self.ctx.control.ensure_not_aborted()?;
        match self.ctx.destination.delete(&entry.filename).await {
            Ok(()) => {
                report.deleted_objects += 1;
                report.freed_bytes += entry.manifest.size;
                report.deleted_entries.push(entry.filename.clone());
                info!("Deleted backup {}", entry.filename);
                Ok(true)
            }
            Err(e) => {
                warnings.about(WarningKind::Destination, entry.filename.clone(), e.to_string());
                Ok(false)
            }
        }
    }
}
