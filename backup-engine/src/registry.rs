//! Static module registry.
//!
//! Codecs, destinations and hooks are compiled in and registered here at
//! startup. Each module declares the options it understands so the option
//! validator can flag unknown, duplicate and disabled-module keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::controller::options::{EngineOptions, OptionKind, OptionSpec};
use crate::destination::{Destination, LocalDestination, MemoryDestination};
use crate::utils::errors::{EngineError, Result};
use crate::volume::{TarVolumeCodec, VolumeCodec, TAG_TAR, TAG_TAR_ZSTD};

pub const CORE_MODULE: &str = "core";
pub const TAR_MODULE: &str = "tar";
pub const HOOK_MODULE: &str = "command-hook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Core,
    Codec,
    Destination,
    Hook,
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub kind: ModuleKind,
    pub options: Vec<OptionSpec>,
}

pub struct ModuleRegistry {
    modules: Vec<ModuleInfo>,
    /// Compression tag -> (owning module, codec)
    codecs: BTreeMap<&'static str, (&'static str, Arc<dyn VolumeCodec>)>,
}

impl ModuleRegistry {
    pub fn builtin() -> Self {
        let mut codecs: BTreeMap<&'static str, (&'static str, Arc<dyn VolumeCodec>)> = BTreeMap::new();
        codecs.insert(TAG_TAR_ZSTD, (TAR_MODULE, Arc::new(TarVolumeCodec::zstd())));
        codecs.insert(TAG_TAR, (TAR_MODULE, Arc::new(TarVolumeCodec::plain())));

        Self {
            modules: vec![
                ModuleInfo {
                    name: CORE_MODULE,
                    kind: ModuleKind::Core,
                    options: core_options(),
                },
                ModuleInfo {
                    name: TAR_MODULE,
                    kind: ModuleKind::Codec,
                    options: vec![OptionSpec::new(
                        "zstd-level",
                        OptionKind::Integer,
                        "zstd compression level for new volumes",
                    )
                    .default_value("3")],
                },
                ModuleInfo {
                    name: "file",
                    kind: ModuleKind::Destination,
                    options: vec![],
                },
                ModuleInfo {
                    name: "memory",
                    kind: ModuleKind::Destination,
                    options: vec![],
                },
                ModuleInfo {
                    name: HOOK_MODULE,
                    kind: ModuleKind::Hook,
                    options: vec![
                        OptionSpec::new(
                            "run-script-after",
                            OptionKind::String,
                            "shell command run after every operation",
                        ),
                        OptionSpec::new(
                            "run-script-timeout",
                            OptionKind::Integer,
                            "seconds before a hook command is killed",
                        )
                        .default_value("300"),
                        OptionSpec::new(
                            "temp-dir",
                            OptionKind::Path,
                            "scratch directory, exported to hook commands as BACKUP_ENGINE_TEMP_DIR",
                        ),
                    ],
                },
            ],
            codecs,
        }
    }

    /// Register an additional module.
    pub fn with_module(mut self, module: ModuleInfo) -> Self {
        self.modules.push(module);
        self
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn codec_tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.codecs.keys().copied()
    }

    /// Codec able to read volumes carrying `tag`.
    pub fn codec(&self, tag: &str, options: &EngineOptions) -> Result<Arc<dyn VolumeCodec>> {
        match self.codecs.get(tag) {
            Some((module, _)) if options.disabled_modules.contains(*module) => Err(EngineError::Config(
                format!("codec for '{tag}' belongs to disabled module '{module}'"),
            )),
            Some((_, codec)) => Ok(codec.clone()),
            None => Err(EngineError::Codec(format!("no codec registered for tag '{tag}'"))),
        }
    }

    /// Codec used to write new volumes, configured from options.
    pub fn writer_codec(&self, options: &EngineOptions) -> Result<Arc<dyn VolumeCodec>> {
        if options.disabled_modules.contains(TAR_MODULE) {
            return Err(EngineError::Config(format!(
                "compression '{}' belongs to disabled module '{TAR_MODULE}'",
                options.compression
            )));
        }
        match options.compression.as_str() {
            TAG_TAR_ZSTD => Ok(Arc::new(TarVolumeCodec::zstd_with_level(options.zstd_level))),
            TAG_TAR => Ok(Arc::new(TarVolumeCodec::plain())),
            other => Err(EngineError::Config(format!("unknown compression '{other}'"))),
        }
    }

    /// Open a destination by URL scheme. A bare path means `file://`.
    pub async fn open_destination(&self, url: &str) -> Result<Arc<dyn Destination>> {
        let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or("file");
        match scheme {
            "file" => Ok(Arc::new(LocalDestination::from_url(url).await?)),
            "memory" => Ok(Arc::new(MemoryDestination::new())),
            other => Err(EngineError::Config(format!("unsupported destination scheme '{other}'"))),
        }
    }
}

fn core_options() -> Vec<OptionSpec> {
    use OptionKind::*;
    vec![
        OptionSpec::new("backup-prefix", String, "prefix of every remote object name")
            .default_value("backup")
            .aliases(&["prefix"]),
        OptionSpec::new("volume-size", Size, "upper bound of stored file bytes per volume, before archive framing")
            .default_value("50mb")
            .aliases(&["dblock-size"]),
        OptionSpec::new("volsize", Size, "upper bound of stored file bytes per volume, before archive framing")
            .deprecated("use volume-size"),
        OptionSpec::new("total-size", Size, "stop the backup after uploading this many bytes"),
        OptionSpec::new("full", Boolean, "force a full backup").default_value("false"),
        OptionSpec::new("full-if-older-than", Duration, "force a full when the latest full is older"),
        OptionSpec::new("allow-missing-source", Boolean, "warn instead of failing on missing sources")
            .default_value("false")
            .aliases(&["allow-missing-sources"]),
        OptionSpec::new("compression", Enumeration(&[TAG_TAR_ZSTD, TAG_TAR]), "codec for new volumes")
            .default_value(TAG_TAR_ZSTD),
        OptionSpec::new("block-size", Size, "rsync signature block size").default_value("4kb"),
        OptionSpec::new("include", String, "comma separated glob patterns to include"),
        OptionSpec::new("exclude", String, "comma separated glob patterns to exclude"),
        OptionSpec::new("overwrite", Boolean, "overwrite differing files on restore").default_value("false"),
        OptionSpec::new("force", Boolean, "perform deletions instead of a dry run").default_value("false"),
        OptionSpec::new("temp-dir", Path, "scratch directory for restore and compact"),
        OptionSpec::new("disable-module", String, "comma separated modules to disable"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        let registry = ModuleRegistry::builtin();
        let options = EngineOptions::default();
        assert_eq!(registry.codec("tzst", &options).unwrap().tag(), "tzst");
        assert_eq!(registry.codec("tar", &options).unwrap().tag(), "tar");
        assert!(registry.codec("zip", &options).is_err());
        assert_eq!(registry.codec_tags().collect::<Vec<_>>(), vec!["tar", "tzst"]);
    }

    #[test]
    fn test_disabled_codec_module() {
        let registry = ModuleRegistry::builtin();
        let mut options = EngineOptions::default();
        options.disabled_modules.insert(TAR_MODULE.to_string());
        assert!(registry.codec("tzst", &options).is_err());
        assert!(registry.writer_codec(&options).is_err());
    }

    #[tokio::test]
    async fn test_open_destination_by_scheme() {
        let registry = ModuleRegistry::builtin();
        let dir = tempfile::TempDir::new().unwrap();
        let local = registry
            .open_destination(&format!("file://{}", dir.path().display()))
            .await
            .unwrap();
        assert!(local.id().starts_with("file://"));
        assert!(registry.open_destination("memory://").await.unwrap().id().starts_with("memory://"));
        assert!(registry.open_destination("ftp://host/x").await.is_err());
    }
}
