//! Volume packing.
//!
//! A volume is a single archive blob holding many small entries addressed by
//! a relative, `/`-separated path. Codecs are selected by the compression tag
//! embedded in remote names.

use std::io::Read;
use std::path::{Component, Path};

use crate::utils::errors::{EngineError, Result};

pub const TAG_TAR_ZSTD: &str = "tzst";
pub const TAG_TAR: &str = "tar";

const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// One entry inside a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl VolumeFile {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}

/// Entry that could not be read back out of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackFailure {
    pub path: Option<String>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct UnpackedVolume {
    pub files: Vec<VolumeFile>,
    pub failures: Vec<UnpackFailure>,
}

impl UnpackedVolume {
    pub fn get(&self, path: &str) -> Option<&VolumeFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

pub trait VolumeCodec: Send + Sync {
    /// Compression tag used as the `<ext>` segment of volume names.
    fn tag(&self) -> &'static str;

    fn pack(&self, files: &[VolumeFile]) -> Result<Vec<u8>>;

    /// Fails only if the blob as a whole is unreadable. Individual bad
    /// entries land in [`UnpackedVolume::failures`].
    fn unpack(&self, blob: &[u8]) -> Result<UnpackedVolume>;
}

/// Tar archive, optionally wrapped in a zstd stream.
#[derive(Debug, Clone, Copy)]
pub struct TarVolumeCodec {
    zstd_level: Option<i32>,
}

impl TarVolumeCodec {
    pub fn zstd() -> Self {
        Self {
            zstd_level: Some(DEFAULT_ZSTD_LEVEL),
        }
    }

    pub fn zstd_with_level(level: i32) -> Self {
        Self {
            zstd_level: Some(level),
        }
    }

    pub fn plain() -> Self {
        Self { zstd_level: None }
    }

    fn build_tar(files: &[VolumeFile]) -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for file in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(file.data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, &file.path, file.data.as_slice())?;
        }
        builder.into_inner()
    }

    fn read_tar(tar_bytes: &[u8]) -> Result<UnpackedVolume> {
        let mut archive = tar::Archive::new(tar_bytes);
        let entries = archive
            .entries()
            .map_err(|e| EngineError::Codec(format!("unreadable archive: {e}")))?;

        let mut unpacked = UnpackedVolume::default();
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // The stream is out of sync after a bad header
                    unpacked.failures.push(UnpackFailure {
                        path: None,
                        message: format!("truncated archive: {e}"),
                    });
                    break;
                }
            };

            let path = match entry.path() {
                Ok(p) => p.to_string_lossy().replace('\\', "/"),
                Err(e) => {
                    unpacked.failures.push(UnpackFailure {
                        path: None,
                        message: format!("invalid entry path: {e}"),
                    });
                    continue;
                }
            };

            if !is_safe_relative_path(&path) {
                unpacked.failures.push(UnpackFailure {
                    path: Some(path),
                    message: "entry path escapes the volume root".into(),
                });
                continue;
            }

            let mut data = Vec::with_capacity(entry.size() as usize);
            match entry.read_to_end(&mut data) {
                Ok(_) => unpacked.files.push(VolumeFile { path, data }),
                Err(e) => unpacked.failures.push(UnpackFailure {
                    path: Some(path),
                    message: e.to_string(),
                }),
            }
        }

        Ok(unpacked)
    }
}

impl VolumeCodec for TarVolumeCodec {
    fn tag(&self) -> &'static str {
        if self.zstd_level.is_some() {
            TAG_TAR_ZSTD
        } else {
            TAG_TAR
        }
    }

    fn pack(&self, files: &[VolumeFile]) -> Result<Vec<u8>> {
        let tar_bytes = Self::build_tar(files).map_err(|e| EngineError::Codec(format!("tar pack: {e}")))?;
        match self.zstd_level {
            Some(level) => zstd::stream::encode_all(tar_bytes.as_slice(), level)
                .map_err(|e| EngineError::Codec(format!("zstd compress: {e}"))),
            None => Ok(tar_bytes),
        }
    }

    fn unpack(&self, blob: &[u8]) -> Result<UnpackedVolume> {
        match self.zstd_level {
            Some(_) => {
                let tar_bytes = zstd::stream::decode_all(blob)
                    .map_err(|e| EngineError::Codec(format!("zstd decompress: {e}")))?;
                Self::read_tar(&tar_bytes)
            }
            None => Self::read_tar(blob),
        }
    }
}

/// Relative, `/`-separated, and free of `..`, root or prefix components.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}
