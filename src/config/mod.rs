//! Layered TOML configuration.
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults ([`defaults::DEFAULT_CONFIG`])
//! 2. the system file (`[conf] system-file`)
//! 3. the user file (`[conf] user-file`), or the file named by the
//!    environment variable in `[conf] path-environment` when set
//! 4. `--config` files and `-o section.key=value` overrides
//!
//! A target's effective table is `[any-target]` deep-merged with
//! `[target.<name>]`, after which `${key}` references are expanded against
//! that merged table.

pub mod defaults;
pub mod target;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use toml::{Table, Value};

pub use target::{DeviceKind, DeviceNode, MountPoint, TargetConfig};

use crate::error::Error;
use crate::util::expand_home;

const ANY_TARGET: &str = "any-target";
const TARGETS: &str = "target";
const UNDEFINED: &str = "undefined";
const MAX_EXPANSION_PASSES: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    table: Table,
    loaded: Vec<PathBuf>,
}

impl Config {
    /// Built-in defaults only.
    pub fn new() -> Result<Self> {
        let table: Table = defaults::DEFAULT_CONFIG
            .parse()
            .context("parsing built-in configuration")?;
        Ok(Self {
            table,
            loaded: Vec::new(),
        })
    }

    /// Defaults plus the system file, which is all the privileged agent trusts.
    pub fn system() -> Result<Self> {
        let mut config = Self::new()?;
        let path = PathBuf::from(config.conf_value("system-file")?);
        if path.exists() {
            config.load(&path)?;
        }
        Ok(config)
    }

    /// Defaults, system file, then the user file or its environment override.
    pub fn standard() -> Result<Self> {
        let mut config = Self::system()?;
        let env_name = config.conf_value("path-environment")?;
        let user_file = match std::env::var_os(&env_name) {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let path = expand_home(&config.conf_value("user-file")?);
                path.exists().then_some(path)
            }
        };
        if let Some(path) = user_file {
            config.load(&path)?;
        }
        Ok(config)
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        self.merge_str(&raw)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        log::debug!("loaded configuration from {}", path.display());
        self.loaded.push(path.to_path_buf());
        Ok(())
    }

    pub fn merge_str(&mut self, raw: &str) -> Result<()> {
        let overlay: Table = raw
            .parse()
            .map_err(|e: toml::de::Error| Error::Config(e.to_string()))?;
        deep_merge(&mut self.table, overlay);
        Ok(())
    }

    /// Applies a `section.key=value` override. Nested targets use
    /// `target.<name>.<key>=value`. The value is read as a TOML value and
    /// falls back to a plain string.
    pub fn set_option(&mut self, assignment: &str) -> Result<()> {
        let (path, raw) = assignment.split_once('=').ok_or_else(|| {
            Error::Config(format!("option must look like section.key=value: {assignment}"))
        })?;
        let keys: Vec<&str> = path.trim().split('.').collect();
        if keys.len() < 2 || keys.iter().any(|k| k.is_empty()) {
            return Err(Error::Config(format!("invalid option name: {path}")).into());
        }
        let value = parse_value(raw.trim());

        let mut table = &mut self.table;
        for key in &keys[..keys.len() - 1] {
            let entry = table
                .entry(key.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            table = entry.as_table_mut().ok_or_else(|| {
                Error::Config(format!("option {path} crosses a non-table value"))
            })?;
        }
        table.insert(keys[keys.len() - 1].to_string(), value);
        Ok(())
    }

    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded
    }

    /// Raw value of `key` in `section`; `section` may be dotted to reach a
    /// nested table such as `target.<name>`.
    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        let mut table = &self.table;
        for part in section.split('.') {
            table = table.get(part)?.as_table()?;
        }
        table.get(key)
    }

    fn conf_value(&self, key: &str) -> Result<String> {
        self.string_in("conf", key)
            .ok_or_else(|| Error::Config(format!("missing [conf] {key}")).into())
    }

    fn string_in(&self, section: &str, key: &str) -> Option<String> {
        self.table
            .get(section)?
            .get(key)?
            .as_str()
            .map(str::to_string)
    }

    pub fn default_target(&self) -> Option<String> {
        self.string_in("jurt", "default-target")
            .filter(|name| name != UNDEFINED)
    }

    pub fn check_permissions(&self) -> bool {
        self.table
            .get("jurt")
            .and_then(|t| t.get("check-permissions"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn target_names(&self) -> Vec<String> {
        self.table
            .get(TARGETS)
            .and_then(Value::as_table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Effective configuration of one target.
    pub fn target(&self, name: &str) -> Result<TargetConfig> {
        let own = self
            .table
            .get(TARGETS)
            .and_then(|t| t.get(name))
            .and_then(Value::as_table)
            .ok_or_else(|| Error::Config(format!("no such target: {name}")))?;
        let mut merged = self
            .table
            .get(ANY_TARGET)
            .and_then(Value::as_table)
            .cloned()
            .unwrap_or_default();
        deep_merge(&mut merged, own.clone());
        expand_references(&mut merged);

        let mut cfg: TargetConfig = Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| {
                Error::Config(format!("target {name}: {}", e.message()))
            })?;
        cfg.name = name.to_string();
        Ok(cfg)
    }

    pub fn targets(&self) -> Result<Vec<TargetConfig>> {
        self.target_names()
            .iter()
            .map(|name| self.target(name))
            .collect()
    }
}

fn parse_value(raw: &str) -> Value {
    format!("v = {raw}")
        .parse::<Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn deep_merge(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Expands `${key}` in string values (and strings inside arrays) using the
/// string values of the same table. Unknown keys are left untouched so
/// runtime placeholders such as `${username}` survive.
fn expand_references(table: &mut Table) {
    for _ in 0..MAX_EXPANSION_PASSES {
        let scalars: Vec<(String, String)> = table
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        let mut changed = false;
        for (_, value) in table.iter_mut() {
            changed |= expand_value(value, &scalars);
        }
        if !changed {
            break;
        }
    }
}

fn expand_value(value: &mut Value, scalars: &[(String, String)]) -> bool {
    match value {
        Value::String(s) => {
            let mut changed = false;
            for (key, replacement) in scalars {
                let needle = format!("${{{key}}}");
                if s.contains(&needle) && !replacement.contains(&needle) {
                    *s = s.replace(&needle, replacement);
                    changed = true;
                }
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| expand_value(item, scalars) | acc),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_CONFIG: &str = r#"
[jurt]
default-target = "cooker"

[any-target]
jurt-base-dir = "/srv/jurt"

[target.cooker]
arch = "x86_64"

[target.legacy]
arch = "i586"
builds-dir = "/mnt/builds"
"#;

    #[test]
    fn test_defaults_have_no_targets() {
        let config = Config::new().unwrap();
        assert!(config.target_names().is_empty());
        assert_eq!(config.default_target(), None);
        assert!(config.check_permissions());
    }

    #[test]
    fn test_layering_and_interpolation() {
        let mut config = Config::new().unwrap();
        config.merge_str(USER_CONFIG).unwrap();
        assert_eq!(config.default_target().as_deref(), Some("cooker"));
        assert_eq!(config.target_names(), vec!["cooker", "legacy"]);

        let cooker = config.target("cooker").unwrap();
        assert_eq!(cooker.name, "cooker");
        assert_eq!(cooker.arch, "x86_64");
        assert_eq!(cooker.roots_path, PathBuf::from("/srv/jurt/chroots"));
        assert_eq!(cooker.spool_dir, PathBuf::from("/srv/jurt/builds/spools"));
        assert_eq!(cooker.builder_home_for("bob"), "/home/bob");
        assert_eq!(cooker.mountpoints[0].path, "/proc");

        let legacy = config.target("legacy").unwrap();
        assert_eq!(legacy.logs_dir, PathBuf::from("/mnt/builds/logs"));
        assert_eq!(legacy.arch_map["i586"][0], "/usr/bin/setarch");
    }

    #[test]
    fn test_set_option_overrides() {
        let mut config = Config::new().unwrap();
        config.merge_str(USER_CONFIG).unwrap();
        config.set_option("target.cooker.builder-uid=1234").unwrap();
        config.set_option("any-target.build-user=bot").unwrap();
        config.set_option("jurt.check-permissions=false").unwrap();

        let cooker = config.target("cooker").unwrap();
        assert_eq!(cooker.builder_uid, 1234);
        assert_eq!(cooker.build_user, "bot");
        assert!(!config.check_permissions());
        assert_eq!(
            config.get("target.cooker", "builder-uid").and_then(Value::as_integer),
            Some(1234)
        );
        assert_eq!(config.get("jurt", "missing"), None);
        assert!(config.set_option("no-equals-sign").is_err());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut config = Config::new().unwrap();
        config
            .merge_str("[target.x]\nnot-an-option = 1\n")
            .unwrap();
        let err = config.target("x").unwrap_err();
        assert!(err.to_string().contains("not-an-option"), "{err}");
        assert!(config.target("missing").is_err());
    }
}
