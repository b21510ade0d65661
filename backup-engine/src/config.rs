//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file layered with `BACKUP_ENGINE__*`
//! environment variables (`BACKUP_ENGINE__DESTINATION__URL`,
//! `BACKUP_ENGINE__LOG__LEVEL`, ...).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::controller::options::RawOptions;

const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Raw engine options, validated per operation
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// `file:///path`, a bare path or `memory://`
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Shell command run after every operation
    pub run_script_after: Option<String>,

    /// Seconds before the hook is killed
    pub timeout_secs: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Engine options with the hook section folded in. Explicit entries in
    /// `options` win.
    pub fn raw_options(&self) -> RawOptions {
        let mut raw: RawOptions = self.options.clone();
        if let Some(command) = &self.hooks.run_script_after {
            raw.entry("run-script-after".to_string()).or_insert_with(|| command.clone());
        }
        if let Some(secs) = self.hooks.timeout_secs {
            raw.entry("run-script-timeout".to_string()).or_insert_with(|| secs.to_string());
        }
        raw
    }
}
