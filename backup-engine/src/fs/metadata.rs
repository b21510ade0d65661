//! File metadata handling for backup operations.
//!
//! Captures the metadata recorded per file (size, mtime, unix mode) and
//! reapplies it on restore.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub modified: i64,

    /// Unix mode bits
    pub permissions: Option<u32>,
}

impl FileMetadata {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Self {
            size: metadata.len(),
            modified: metadata.modified().map(system_time_to_secs).unwrap_or(0),
            permissions,
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&fs::metadata(path)?))
    }

    /// Set the modification time, then the permission bits.
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(secs_to_system_time(self.modified))?;
        drop(file);

        #[cfg(unix)]
        if let Some(mode) = self.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }
}

pub fn system_time_to_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub fn secs_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
