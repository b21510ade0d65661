//! Option declarations, validation and typed resolution.
//!
//! Validation never blocks an operation. Every problem becomes an
//! [`WarningKind::Option`] warning and the affected option falls back to
//! its default.

use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::registry::ModuleRegistry;
use crate::report::{WarningKind, WarningLog};
use crate::utils::units::{parse_duration, parse_size};

/// Raw `key = value` options as supplied by configuration or the CLI.
pub type RawOptions = BTreeMap<String, String>;

/// Options that several modules legitimately declare.
pub const KNOWN_DUPLICATES: &[&str] = &["temp-dir"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Enumeration(&'static [&'static str]),
    Boolean,
    Integer,
    Path,
    Size,
    Duration,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: Option<&'static str>,
    pub aliases: &'static [&'static str],
    /// Set for deprecated options; the text tells users what to use instead
    pub deprecated: Option<&'static str>,
    pub description: &'static str,
}

impl OptionSpec {
    pub const fn new(name: &'static str, kind: OptionKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            default: None,
            aliases: &[],
            deprecated: None,
            description,
        }
    }

    pub const fn default_value(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    pub const fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub const fn deprecated(mut self, note: &'static str) -> Self {
        self.deprecated = Some(note);
        self
    }

    fn answers_to(&self, key: &str) -> bool {
        self.name == key || self.aliases.contains(&key)
    }

    /// Check `value` against the declared kind.
    pub fn check(&self, value: &str) -> std::result::Result<(), String> {
        match self.kind {
            OptionKind::Enumeration(values) => {
                if values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                    Ok(())
                } else {
                    Err(format!("expected one of: {}", values.join(", ")))
                }
            }
            OptionKind::Boolean => parse_bool(value).map(|_| ()).ok_or_else(|| "expected a boolean".into()),
            OptionKind::Integer => value
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| "expected an integer".into()),
            OptionKind::Path => {
                if value.trim().is_empty() {
                    Err("expected a path".into())
                } else {
                    Ok(())
                }
            }
            OptionKind::Size => parse_size(value, "mb").map(|_| ()).map_err(|e| e.to_string()),
            OptionKind::Duration => parse_duration(value).map(|_| ()).map_err(|e| e.to_string()),
            OptionKind::String => Ok(()),
        }
    }
}

/// Empty values count as `true` so `--full` style flags work.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Typed view of the options every operation consumes.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub backup_prefix: String,
    pub volume_size: u64,
    pub total_size: Option<u64>,
    pub full: bool,
    pub full_if_older_than: Option<Duration>,
    pub allow_missing_source: bool,
    pub compression: String,
    pub zstd_level: i32,
    pub block_size: u32,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub overwrite: bool,
    pub force: bool,
    pub temp_dir: Option<PathBuf>,
    pub disabled_modules: BTreeSet<String>,
    pub run_script_after: Option<String>,
    pub run_script_timeout: std::time::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let (options, _) = OptionValidator::new(&ModuleRegistry::builtin()).validate(&RawOptions::new());
        options
    }
}

pub struct OptionValidator<'a> {
    registry: &'a ModuleRegistry,
}

impl<'a> OptionValidator<'a> {
    pub fn new(registry: &'a ModuleRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, raw: &RawOptions) -> (EngineOptions, WarningLog) {
        let mut warnings = WarningLog::new();
        self.report_duplicate_declarations(&mut warnings);

        let disabled: BTreeSet<String> = raw
            .get("disable-module")
            .map(|v| split_list(v).into_iter().collect())
            .unwrap_or_default();

        let mut resolved: BTreeMap<&'static str, String> = BTreeMap::new();

        for (key, value) in raw {
            let owners: Vec<(&str, &OptionSpec)> = self
                .registry
                .modules()
                .flat_map(|m| m.options.iter().map(move |o| (m.name, o)))
                .filter(|(_, spec)| spec.answers_to(key))
                .collect();

            let Some(&(_, spec)) = owners.first() else {
                warnings.about(WarningKind::Option, key, "unknown option, ignored");
                continue;
            };

            if owners.iter().all(|(module, _)| disabled.contains(*module)) {
                warnings.about(
                    WarningKind::Option,
                    key,
                    format!("option belongs to disabled module '{}', ignored", owners[0].0),
                );
                continue;
            }

            if let Some(note) = spec.deprecated {
                warnings.about(WarningKind::Option, key, format!("option is deprecated: {note}"));
            }

            if let Err(reason) = spec.check(value) {
                let fallback = spec.default.unwrap_or("unset");
                warnings.about(
                    WarningKind::Option,
                    key,
                    format!("invalid value '{value}' ({reason}), using default '{fallback}'"),
                );
                continue;
            }

            if resolved.insert(spec.name, value.clone()).is_some() {
                warnings.about(WarningKind::Option, key, format!("supplied more than once for '{}'", spec.name));
            }
        }

        let options = self.resolve(&resolved, disabled);
        (options, warnings)
    }

    fn report_duplicate_declarations(&self, warnings: &mut WarningLog) {
        let mut declared: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for module in self.registry.modules() {
            for spec in &module.options {
                declared.entry(spec.name).or_default().push(module.name);
            }
        }
        for (name, modules) in declared {
            if modules.len() > 1 && !KNOWN_DUPLICATES.contains(&name) {
                warnings.about(
                    WarningKind::Option,
                    name,
                    format!("declared by several modules: {}", modules.join(", ")),
                );
            }
        }
    }

    fn spec(&self, name: &str) -> Option<&OptionSpec> {
        self.registry
            .modules()
            .flat_map(|m| m.options.iter())
            .find(|o| o.name == name)
    }

    /// Supplied value, else the declared default.
    fn value<'r>(&'r self, resolved: &'r BTreeMap<&'static str, String>, name: &str) -> Option<&'r str> {
        resolved
            .get(name)
            .map(|s| s.as_str())
            .or_else(|| self.spec(name).and_then(|s| s.default))
    }

    fn resolve(&self, resolved: &BTreeMap<&'static str, String>, disabled_modules: BTreeSet<String>) -> EngineOptions {
        let get = |name: &str| self.value(resolved, name);
        let flag = |name: &str| get(name).and_then(parse_bool).unwrap_or(false);
        let size = |name: &str| get(name).and_then(|v| parse_size(v, "mb").ok());

        // The deprecated spelling only applies when the new one is absent
        let volume_size = if resolved.contains_key("volume-size") {
            size("volume-size")
        } else {
            size("volsize").or_else(|| size("volume-size"))
        };

        EngineOptions {
            backup_prefix: get("backup-prefix").unwrap_or("backup").to_string(),
            volume_size: volume_size.unwrap_or(50 * 1024 * 1024).max(1),
            total_size: size("total-size"),
            full: flag("full"),
            full_if_older_than: get("full-if-older-than").and_then(|v| parse_duration(v).ok()),
            allow_missing_source: flag("allow-missing-source"),
            compression: get("compression").unwrap_or("tzst").to_ascii_lowercase(),
            zstd_level: get("zstd-level").and_then(|v| v.trim().parse().ok()).unwrap_or(3),
            block_size: size("block-size")
                .and_then(|b| u32::try_from(b).ok())
                .filter(|b| *b > 0)
                .unwrap_or(crate::sync::signature::DEFAULT_BLOCK_SIZE),
            include: get("include").map(split_list).unwrap_or_default(),
            exclude: get("exclude").map(split_list).unwrap_or_default(),
            overwrite: flag("overwrite"),
            force: flag("force"),
            temp_dir: get("temp-dir").map(PathBuf::from),
            disabled_modules,
            run_script_after: get("run-script-after").map(|s| s.to_string()).filter(|s| !s.is_empty()),
            run_script_timeout: std::time::Duration::from_secs(
                get("run-script-timeout").and_then(|v| v.trim().parse().ok()).unwrap_or(300),
            ),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModuleInfo, ModuleKind};

    fn raw(pairs: &[(&str, &str)]) -> RawOptions {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn validate(pairs: &[(&str, &str)]) -> (EngineOptions, WarningLog) {
        OptionValidator::new(&ModuleRegistry::builtin()).validate(&raw(pairs))
    }

    #[test]
    fn test_defaults_without_warnings() {
        let (options, warnings) = validate(&[]);
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(options.backup_prefix, "backup");
        assert_eq!(options.volume_size, 50 * 1024 * 1024);
        assert_eq!(options.compression, "tzst");
        assert!(!options.full);
        assert!(options.total_size.is_none());
    }

    #[test]
    fn test_unknown_option_warns() {
        let (_, warnings) = validate(&[("no-such-thing", "1")]);
        assert_eq!(warnings.count(WarningKind::Option), 1);
        assert_eq!(warnings.iter().next().unwrap().subject.as_deref(), Some("no-such-thing"));
    }

    #[test]
    fn test_invalid_value_falls_back_to_default() {
        let (options, warnings) = validate(&[("volume-size", "lots"), ("compression", "rar")]);
        assert_eq!(warnings.len(), 2);
        assert_eq!(options.volume_size, 50 * 1024 * 1024);
        assert_eq!(options.compression, "tzst");
    }

    #[test]
    fn test_deprecated_is_honored() {
        let (options, warnings) = validate(&[("volsize", "2mb")]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings.iter().next().unwrap().message.contains("deprecated"));
        assert_eq!(options.volume_size, 2 * 1024 * 1024);

        let (options, _) = validate(&[("volsize", "2mb"), ("volume-size", "3mb")]);
        assert_eq!(options.volume_size, 3 * 1024 * 1024);
    }

    #[test]
    fn test_aliases_resolve() {
        let (options, warnings) = validate(&[("prefix", "host1"), ("allow-missing-sources", "yes")]);
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(options.backup_prefix, "host1");
        assert!(options.allow_missing_source);
    }

    #[test]
    fn test_disabled_module_option_warns() {
        let (options, warnings) = validate(&[
            ("disable-module", "command-hook"),
            ("run-script-after", "echo done"),
        ]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings.iter().next().unwrap().message.contains("disabled module"));
        assert!(options.run_script_after.is_none());
        assert!(options.disabled_modules.contains("command-hook"));
    }

    #[test]
    fn test_duplicate_declarations_warn_unless_known() {
        let registry = ModuleRegistry::builtin().with_module(ModuleInfo {
            name: "extra",
            kind: ModuleKind::Hook,
            options: vec![
                OptionSpec::new("volume-size", OptionKind::Size, "clashes with core"),
                OptionSpec::new("temp-dir", OptionKind::Path, "known duplicate"),
            ],
        });
        let (_, warnings) = OptionValidator::new(&registry).validate(&RawOptions::new());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings.iter().next().unwrap().subject.as_deref(), Some("volume-size"));
    }

    #[test]
    fn test_flags_and_lists() {
        let (options, warnings) = validate(&[
            ("full", ""),
            ("exclude", "*.tmp, cache"),
            ("full-if-older-than", "1w"),
            ("total-size", "1gb"),
        ]);
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert!(options.full);
        assert_eq!(options.exclude, vec!["*.tmp", "cache"]);
        assert_eq!(options.full_if_older_than, Some(Duration::weeks(1)));
        assert_eq!(options.total_size, Some(1024 * 1024 * 1024));
    }
}
