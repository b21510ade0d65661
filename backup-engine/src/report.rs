//! Warning log carried by every operation result.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Unknown, deprecated, duplicate or invalid option
    Option,
    /// A single item skipped during a walk, unpack or restore
    PartialFailure,
    /// Hash mismatch, orphaned or broken chain entries
    Integrity,
    /// A destination call failed for one object
    Destination,
    /// Restore target file exists and differs
    Conflict,
    /// Post-operation hook failure
    Hook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    /// Path, remote object name or option key the warning is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "[{:?}] {}: {}", self.kind, subject, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// Accumulates warnings and mirrors each one to the log as it arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningLog {
    entries: Vec<Warning>,
}

impl WarningLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: WarningKind, subject: Option<String>, message: impl Into<String>) {
        let warning = Warning::new(kind, subject, message);
        tracing::warn!("{}", warning);
        self.entries.push(warning);
    }

    pub fn about(&mut self, kind: WarningKind, subject: impl Into<String>, message: impl Into<String>) {
        self.push(kind, Some(subject.into()), message);
    }

    pub fn extend(&mut self, other: WarningLog) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.entries.iter()
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.entries.iter().filter(|w| w.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_log_counts_by_kind() {
        let mut log = WarningLog::new();
        log.about(WarningKind::Option, "volsize", "invalid size");
        log.push(WarningKind::Integrity, None, "orphaned incremental");
        log.about(WarningKind::Option, "foo", "unknown option");

        assert_eq!(log.len(), 3);
        assert_eq!(log.count(WarningKind::Option), 2);
        assert_eq!(log.count(WarningKind::Conflict), 0);
        assert!(log.iter().any(|w| w.subject.as_deref() == Some("volsize")));
    }

    #[test]
    fn test_warning_display() {
        let w = Warning::new(WarningKind::Conflict, Some("a.txt".into()), "target differs");
        assert_eq!(w.to_string(), "[Conflict] a.txt: target differs");
    }
}
