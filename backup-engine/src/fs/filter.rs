//! Include/exclude glob filter applied to relative paths.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::utils::errors::{EngineError, Result};

/// Raw patterns as they appear in options and configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Compiled filter. A path is selected when it matches no exclude pattern
/// and, if include patterns exist, at least one of them.
///
/// Patterns are tested against the full relative path and against the
/// final component, so `*.tmp` and `cache` both behave as expected.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathFilter {
    pub fn new(rules: &FilterRules) -> Result<Self> {
        Ok(Self {
            include: build_globset(&rules.include)?,
            exclude: build_globset(&rules.exclude)?,
        })
    }

    /// Filter that selects everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        match &self.exclude {
            Some(set) => matches(set, relative),
            None => false,
        }
    }

    /// Whether a file at `relative` should be processed.
    pub fn selects(&self, relative: &str) -> bool {
        if self.is_excluded(relative) {
            return false;
        }
        match &self.include {
            Some(set) => matches(set, relative),
            None => true,
        }
    }
}

fn matches(set: &GlobSet, relative: &str) -> bool {
    if set.is_match(relative) {
        return true;
    }
    match relative.rsplit_once('/') {
        Some((_, name)) => set.is_match(name),
        None => false,
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| EngineError::Config(format!("Invalid glob pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }

    let set = builder
        .build()
        .map_err(|e| EngineError::Config(format!("Invalid glob set: {e}")))?;
    Ok(Some(set))
}
