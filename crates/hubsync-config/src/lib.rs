//! Shared configuration for hubsync tools.
//!
//! TOML profiles (one per hub installation), layered with `HUBSYNC_*`
//! environment variables, and translation to
//! [`hubsync_core::EngineConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubsync_core::{DeviceId, EngineConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    UnknownProfile { name: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    /// Output defaults for the CLI.
    #[serde(default)]
    pub defaults: Defaults,

    /// Engine settings every profile starts from.
    #[serde(default)]
    pub engine: EngineDefaults,

    /// Named hub installations.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            engine: EngineDefaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}

/// `[engine]` section. Mirrors [`EngineConfig`] minus the hub address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    #[serde(default = "default_true")]
    pub record_changes: bool,

    #[serde(default)]
    pub auto_sync: bool,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        let core = EngineConfig::default();
        Self {
            max_retries: core.max_retries,
            read_batch_size: core.read_batch_size,
            record_changes: core.record_changes,
            auto_sync: core.auto_sync,
        }
    }
}

fn default_max_retries() -> u32 {
    EngineConfig::default().max_retries
}
fn default_read_batch_size() -> usize {
    EngineConfig::default().read_batch_size
}
fn default_true() -> bool {
    true
}

/// One hub installation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// Hub address, e.g. "44.85.11".
    pub hub: String,

    /// Override `[engine].max_retries`.
    pub max_retries: Option<u32>,

    /// Override `[engine].read_batch_size`.
    pub read_batch_size: Option<usize>,

    /// Override `[engine].record_changes`.
    pub record_changes: Option<bool>,

    /// Override `[engine].auto_sync`.
    pub auto_sync: Option<bool>,
}

impl Profile {
    pub fn for_hub(hub: DeviceId) -> Self {
        Self {
            hub: hub.to_string(),
            max_retries: None,
            read_batch_size: None,
            record_changes: None,
            auto_sync: None,
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, &Profile), ConfigError> {
        let name = name
            .map(str::to_owned)
            .or_else(|| self.default_profile.clone())
            .unwrap_or_else(|| "default".into());
        match self.profiles.get(&name) {
            Some(profile) => Ok((name, profile)),
            None => Err(ConfigError::UnknownProfile { name }),
        }
    }

    /// Engine settings for profile `name` (or the default profile).
    pub fn engine_config(&self, name: Option<&str>) -> Result<EngineConfig, ConfigError> {
        let (_, profile) = self.profile(name)?;
        profile_to_engine_config(profile, &self.engine)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "hubsync", "hubsync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hubsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
///
/// Environment keys nest with `__`: `HUBSYNC_ENGINE__AUTO_SYNC=true`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HUBSYNC_").split("__"));

    let config: Config = figment.extract()?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    for (name, profile) in &config.profiles {
        parse_hub(profile).map_err(|reason| ConfigError::Validation {
            field: format!("profiles.{name}.hub"),
            reason,
        })?;
    }
    if config.engine.read_batch_size == 0 {
        return Err(ConfigError::Validation {
            field: "engine.read_batch_size".into(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(())
}

fn parse_hub(profile: &Profile) -> Result<DeviceId, String> {
    profile.hub.parse::<DeviceId>().map_err(|e| e.to_string())
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build an [`EngineConfig`] from a profile layered over `[engine]`.
pub fn profile_to_engine_config(
    profile: &Profile,
    defaults: &EngineDefaults,
) -> Result<EngineConfig, ConfigError> {
    let hub = parse_hub(profile).map_err(|reason| ConfigError::Validation {
        field: "hub".into(),
        reason,
    })?;
    let read_batch_size = profile.read_batch_size.unwrap_or(defaults.read_batch_size);
    if read_batch_size == 0 {
        return Err(ConfigError::Validation {
            field: "read_batch_size".into(),
            reason: "must be at least 1".into(),
        });
    }

    Ok(EngineConfig {
        hub,
        max_retries: profile.max_retries.unwrap_or(defaults.max_retries),
        read_batch_size,
        record_changes: profile.record_changes.unwrap_or(defaults.record_changes),
        auto_sync: profile.auto_sync.unwrap_or(defaults.auto_sync),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, EngineDefaults::default());
        assert!(config.profiles.is_empty());
        assert_eq!(config.defaults.output, "table");
    }

    #[test]
    fn profile_overrides_engine_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
default_profile = "house"

[engine]
max_retries = 5
auto_sync = true

[profiles.house]
hub = "44.85.11"
auto_sync = false
"#,
        );
        let config = load_config_from(&path).unwrap();
        let engine = config.engine_config(None).unwrap();
        assert_eq!(engine.hub, DeviceId::new([0x44, 0x85, 0x11]));
        assert_eq!(engine.max_retries, 5);
        assert!(!engine.auto_sync);
        assert!(engine.record_changes);
        assert_eq!(engine.read_batch_size, EngineConfig::default().read_batch_size);
    }

    #[test]
    fn bad_hub_address_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[profiles.garage]\nhub = \"not-a-hub\"\n");
        let err = load_config_from(&path).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation { ref field, .. } if field == "profiles.garage.hub")
        );
    }

    #[test]
    fn unknown_profile_is_reported() {
        let config = Config::default();
        assert!(matches!(
            config.engine_config(Some("cabin")),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.profiles.insert(
            "default".into(),
            Profile::for_hub(DeviceId::new([0x0A, 0x0B, 0x0C])),
        );
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.profiles, config.profiles);
        assert_eq!(
            loaded.engine_config(None).unwrap().hub,
            DeviceId::new([0x0A, 0x0B, 0x0C])
        );
    }
}
