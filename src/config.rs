use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::{
    accumulator::DEFAULT_PENDING_IDLE_MS, history::DEFAULT_MAX_ENTRIES_PER_TAB,
    persistence::DEFAULT_STORAGE_TIMEOUT_MS, reconcile::DEFAULT_TOLERANCE_MS,
};

pub const PROJECT_CONFIG_FILENAME: &str = "tabcapture.toml";
pub const HOME_CONFIG_DIR: &str = ".tabcapture";
pub const HOME_CONFIG_FILENAME: &str = "config.toml";

const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub storage: Option<StorageConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CaptureConfig {
    pub max_entries_per_tab: usize,
    pub pending_idle_ms: u64,
    pub sweep_interval_ms: u64,
    pub platform_omits_post_bodies: bool,
    pub clear_on_navigate: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_entries_per_tab: DEFAULT_MAX_ENTRIES_PER_TAB,
            pending_idle_ms: DEFAULT_PENDING_IDLE_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            platform_omits_post_bodies: false,
            clear_on_navigate: false,
        }
    }
}

impl CaptureConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcileConfig {
    pub tolerance_ms: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: DEFAULT_TOLERANCE_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_storage_timeout_ms() -> u64 {
    DEFAULT_STORAGE_TIMEOUT_MS
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Where a loaded config came from, for error messages and startup logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Override(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Override(path) => write!(f, "--config {}", path.display()),
            Self::Project(_) => write!(f, "project ./{PROJECT_CONFIG_FILENAME}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

impl Config {
    /// Loads the explicit path when given, else the first of
    /// `./tabcapture.toml` and `~/.tabcapture/config.toml` that exists, else defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        Ok(Self::load_with_source(override_path)?.0)
    }

    pub fn load_with_source(override_path: Option<&Path>) -> anyhow::Result<(Self, ConfigSource)> {
        let source = discover(override_path);
        let config = match &source {
            ConfigSource::Override(path)
            | ConfigSource::Project(path)
            | ConfigSource::Home(path) => {
                Self::from_path(path).with_context(|| format!("load config from {source}"))?
            }
            ConfigSource::Defaults => Self::default(),
        };
        Ok((config, source))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capture.max_entries_per_tab == 0 {
            bail!("`capture.max_entries_per_tab` must be at least 1");
        }
        if self.capture.pending_idle_ms == 0 {
            bail!("`capture.pending_idle_ms` must be greater than 0");
        }
        if self.capture.sweep_interval_ms == 0 {
            bail!("`capture.sweep_interval_ms` must be greater than 0");
        }
        let tolerance_ms = self.reconcile.tolerance_ms;
        if !tolerance_ms.is_finite() || tolerance_ms < 0.0 {
            bail!("`reconcile.tolerance_ms` must be a non-negative number, got {tolerance_ms}");
        }
        if let Some(storage) = self.storage.as_ref() {
            if storage.timeout_ms == 0 {
                bail!("`storage.timeout_ms` must be greater than 0");
            }
            if storage.path.as_os_str().is_empty() {
                bail!("`storage.path` cannot be empty");
            }
        }
        Ok(())
    }

    /// Storage path with a leading `~` expanded against `$HOME`.
    pub fn storage_path(&self) -> anyhow::Result<Option<PathBuf>> {
        self.storage
            .as_ref()
            .map(|storage| expand_tilde_path(&storage.path))
            .transpose()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discover(override_path: Option<&Path>) -> ConfigSource {
    if let Some(path) = override_path {
        return ConfigSource::Override(path.to_path_buf());
    }

    let project = PathBuf::from(PROJECT_CONFIG_FILENAME);
    if project.is_file() {
        return ConfigSource::Project(project);
    }

    if let Some(home) = home_dir() {
        let home_config = home.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILENAME);
        if home_config.is_file() {
            return ConfigSource::Home(home_config);
        }
    }

    ConfigSource::Defaults
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn expand_tilde_path(path: &Path) -> anyhow::Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let Some(home) = home_dir() else {
        bail!("cannot expand `~` in {}: HOME is not set", path.display());
    };
    Ok(home.join(rest))
}
