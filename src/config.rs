//! Client configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FLARE_API_KEY, FLARE_SERVER_URL, FLARE_ENABLED,
//!    FLARE_HOME, FLARE_MAX_QUEUE_ITEMS)
//! 2. Config file (.flare/config.yaml)
//! 3. Defaults (~/.flare)
//!
//! Each source is a [`SettingsProvider`] yielding partial [`Settings`]. The
//! providers are merged once, when the client is constructed.
//!
//! Config file discovery:
//! - Searches current directory and parents for .flare/config.yaml
//! - `queue.data_dir` is relative to the .flare/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_PREFIX};
use crate::storage::DEFAULT_MAX_ITEMS;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<Config, String>> = OnceLock::new();

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";
const ENV_PREFIX: &str = "FLARE_";

/// Which storage backend holds the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

/// Partial settings from one source; `None` leaves the lower source in place
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub server_url: Option<String>,
    pub enabled: Option<bool>,
    pub max_queue_items: Option<usize>,
    pub queue_prefix: Option<String>,
    pub batch_size: Option<usize>,
    pub plugin_timeout_ms: Option<u64>,
    pub exclusions: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub storage: Option<StorageKind>,
}

impl Settings {
    /// Overlay `other` on top of `self`
    pub fn merge(&mut self, other: Settings) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.api_key, other.api_key);
        take(&mut self.server_url, other.server_url);
        take(&mut self.enabled, other.enabled);
        take(&mut self.max_queue_items, other.max_queue_items);
        take(&mut self.queue_prefix, other.queue_prefix);
        take(&mut self.batch_size, other.batch_size);
        take(&mut self.plugin_timeout_ms, other.plugin_timeout_ms);
        take(&mut self.exclusions, other.exclusions);
        take(&mut self.data_dir, other.data_dir);
        take(&mut self.storage, other.storage);
    }
}

/// A source of settings, consumed once at construction
pub trait SettingsProvider {
    /// Source name for error messages
    fn name(&self) -> &str;

    fn load(&self) -> Result<Settings>;
}

impl SettingsProvider for Settings {
    fn name(&self) -> &str {
        "static"
    }

    fn load(&self) -> Result<Settings> {
        Ok(self.clone())
    }
}

// ============================================================================
// Config file
// ============================================================================

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub plugins: PluginsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSection {
    pub api_key: Option<String>,
    pub server_url: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSection {
    pub max_items: Option<usize>,
    pub prefix: Option<String>,
    pub batch_size: Option<usize>,
    /// Queue directory (relative to the .flare/ directory)
    pub data_dir: Option<String>,
    pub storage: Option<StorageKind>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginsSection {
    pub timeout_ms: Option<u64>,
    pub exclusions: Option<Vec<String>>,
}

/// Settings read from a YAML config file
#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    path: Option<PathBuf>,
}

impl FileSettings {
    /// Use the first .flare/config.yaml found from the current directory up
    pub fn discover() -> Self {
        Self {
            path: find_config_file(),
        }
    }

    /// Use a specific file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// File in use, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SettingsProvider for FileSettings {
    fn name(&self) -> &str {
        "config file"
    }

    fn load(&self) -> Result<Settings> {
        let Some(path) = &self.path else {
            return Ok(Settings::default());
        };

        let file = load_config_file(path)?;
        let base_dir = path.parent().unwrap_or(Path::new("."));

        Ok(Settings {
            api_key: file.client.api_key,
            server_url: file.client.server_url,
            enabled: file.client.enabled,
            max_queue_items: file.queue.max_items,
            queue_prefix: file.queue.prefix,
            batch_size: file.queue.batch_size,
            plugin_timeout_ms: file.plugins.timeout_ms,
            exclusions: file.plugins.exclusions,
            data_dir: file.queue.data_dir.map(|dir| resolve_path(base_dir, &dir)),
            storage: file.queue.storage,
        })
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".flare").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Settings read from FLARE_* environment variables
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    vars: HashMap<String, String>,
}

impl EnvSettings {
    /// Snapshot the process environment
    pub fn new() -> Self {
        Self::from_vars(std::env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX)))
    }

    /// Use an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&format!("{}{}", ENV_PREFIX, name))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl SettingsProvider for EnvSettings {
    fn name(&self) -> &str {
        "environment"
    }

    fn load(&self) -> Result<Settings> {
        let enabled = match self.var("ENABLED") {
            Some(raw) => Some(parse_bool(raw).with_context(|| format!("Invalid {}ENABLED", ENV_PREFIX))?),
            None => None,
        };

        let max_queue_items = match self.var("MAX_QUEUE_ITEMS") {
            Some(raw) => Some(
                raw.parse::<usize>()
                    .with_context(|| format!("Invalid {}MAX_QUEUE_ITEMS: {}", ENV_PREFIX, raw))?,
            ),
            None => None,
        };

        Ok(Settings {
            api_key: self.var("API_KEY").map(str::to_string),
            server_url: self.var("SERVER_URL").map(str::to_string),
            enabled,
            max_queue_items,
            data_dir: self.var("HOME").map(PathBuf::from),
            ..Default::default()
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Project API key sent by the transport
    pub api_key: Option<String>,
    /// Collector base URL
    pub server_url: String,
    /// When false every submission is rejected before the pipeline runs
    pub enabled: bool,
    /// Queue capacity
    pub max_queue_items: usize,
    /// Path prefix of the events namespace
    pub queue_prefix: String,
    /// Events handed to the transport per drain pass
    pub batch_size: usize,
    /// Default per-plugin deadline
    pub plugin_timeout: Option<Duration>,
    /// Glob patterns for the exclusion plugin
    pub exclusions: Vec<String>,
    /// Directory for the file-backed queue
    pub data_dir: PathBuf,
    pub storage: StorageKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
            enabled: true,
            max_queue_items: DEFAULT_MAX_ITEMS,
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            plugin_timeout: None,
            exclusions: Vec::new(),
            data_dir: default_data_dir(),
            storage: StorageKind::Memory,
        }
    }
}

impl Config {
    /// Merge providers in order (later ones win) on top of the defaults
    pub fn from_providers(providers: &[&dyn SettingsProvider]) -> Result<Self> {
        let mut settings = Settings::default();
        for provider in providers {
            let layer = provider
                .load()
                .with_context(|| format!("Failed to load settings from {}", provider.name()))?;
            settings.merge(layer);
        }

        let config = Self::from_settings(settings);
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the discovered config file, then the environment
    pub fn load() -> Result<Self> {
        Self::from_providers(&[&FileSettings::discover(), &EnvSettings::new()])
    }

    fn from_settings(settings: Settings) -> Self {
        let defaults = Self::default();
        Self {
            api_key: settings.api_key.or(defaults.api_key),
            server_url: settings.server_url.unwrap_or(defaults.server_url),
            enabled: settings.enabled.unwrap_or(defaults.enabled),
            max_queue_items: settings.max_queue_items.unwrap_or(defaults.max_queue_items),
            queue_prefix: settings.queue_prefix.unwrap_or(defaults.queue_prefix),
            batch_size: settings.batch_size.unwrap_or(defaults.batch_size),
            plugin_timeout: settings
                .plugin_timeout_ms
                .map(Duration::from_millis)
                .or(defaults.plugin_timeout),
            exclusions: settings.exclusions.unwrap_or(defaults.exclusions),
            data_dir: settings.data_dir.unwrap_or(defaults.data_dir),
            storage: settings.storage.unwrap_or(defaults.storage),
        }
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_prefix.is_empty() {
            anyhow::bail!("Queue prefix cannot be empty");
        }

        if self.max_queue_items == 0 {
            anyhow::bail!("Queue capacity must be at least 1");
        }

        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }

        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            anyhow::bail!("Server URL must be http(s): {}", self.server_url);
        }

        Ok(())
    }

    /// Directory holding the file-backed queue
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".flare"))
        .unwrap_or_else(|| PathBuf::from(".flare"))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Config> {
    let result = CONFIG.get_or_init(|| Config::load().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
