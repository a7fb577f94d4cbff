//! Configuration management for Cadence
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Builder overrides (set by the host program)
//! 2. Environment variables (CADENCE_DURABILITY, etc.)
//! 3. Config file (cadence.toml in the working directory or ~/.config/cadence/config.toml)
//! 4. Built-in defaults
//!
//! # Example Config File (cadence.toml)
//!
//! ```toml
//! [engine]
//! durability = "MAX_SURVIVABILITY"
//! safepoint_budget = 10000
//! stop_timeout_ms = 10000
//! pickle_timeout_ms = 60000
//! thread_dump_timeout_ms = 60000
//! migrate_storage_on_complete = true
//! sandbox = false
//! ```
//!
//! # Environment Variables
//!
//! - CADENCE_CONFIG_PATH
//! - CADENCE_DURABILITY
//! - CADENCE_SAFEPOINT_BUDGET
//! - CADENCE_STOP_TIMEOUT_MS
//! - CADENCE_PICKLE_TIMEOUT_MS
//! - CADENCE_THREAD_DUMP_TIMEOUT_MS
//! - CADENCE_MIGRATE_STORAGE
//! - CADENCE_SANDBOX

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/* ===================== Durability ===================== */

/// How aggressively execution state is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurabilityHint {
    /// Bulk history storage; state is only persisted at checkpoints
    PerformanceOptimized,
    /// Per-node history with deferred action writes; program saved when idle
    SurvivableNonatomic,
    /// Per-node history written immediately; program and record saved when idle
    #[default]
    MaxSurvivability,
}

impl DurabilityHint {
    /// Whether history action writes may be deferred until the node completes
    pub fn defers_action_writes(&self) -> bool {
        !matches!(self, DurabilityHint::MaxSurvivability)
    }

    /// Whether the program is saved every time the thread group goes idle
    pub fn persists_when_idle(&self) -> bool {
        !matches!(self, DurabilityHint::PerformanceOptimized)
    }
}

impl fmt::Display for DurabilityHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DurabilityHint::PerformanceOptimized => "PERFORMANCE_OPTIMIZED",
            DurabilityHint::SurvivableNonatomic => "SURVIVABLE_NONATOMIC",
            DurabilityHint::MaxSurvivability => "MAX_SURVIVABILITY",
        };
        f.write_str(name)
    }
}

impl FromStr for DurabilityHint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PERFORMANCE_OPTIMIZED" => Ok(DurabilityHint::PerformanceOptimized),
            "SURVIVABLE_NONATOMIC" => Ok(DurabilityHint::SurvivableNonatomic),
            "MAX_SURVIVABILITY" => Ok(DurabilityHint::MaxSurvivability),
            other => anyhow::bail!("Unknown durability hint: {}", other),
        }
    }
}

/* ===================== Config ===================== */

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default durability for new executions
    #[serde(default)]
    pub durability: DurabilityHint,

    /// Instructions a continuation runs before yielding at a safepoint
    #[serde(default = "default_safepoint_budget")]
    pub safepoint_budget: usize,

    /// Bound on a step's stop hook
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Bound on resolving all pickles while loading a program
    #[serde(default = "default_pickle_timeout_ms")]
    pub pickle_timeout_ms: u64,

    /// Bound on collecting a thread dump from a busy lane
    #[serde(default = "default_thread_dump_timeout_ms")]
    pub thread_dump_timeout_ms: u64,

    /// Rewrite per-node history into bulk storage once an execution completes
    #[serde(default = "default_migrate_storage_on_complete")]
    pub migrate_storage_on_complete: bool,

    /// Run new executions sandboxed
    #[serde(default)]
    pub sandbox: bool,
}

// Default value functions for serde
fn default_safepoint_budget() -> usize {
    10_000
}
fn default_stop_timeout_ms() -> u64 {
    10_000
}
fn default_pickle_timeout_ms() -> u64 {
    60_000
}
fn default_thread_dump_timeout_ms() -> u64 {
    60_000
}
fn default_migrate_storage_on_complete() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityHint::default(),
            safepoint_budget: default_safepoint_budget(),
            stop_timeout_ms: default_stop_timeout_ms(),
            pickle_timeout_ms: default_pickle_timeout_ms(),
            thread_dump_timeout_ms: default_thread_dump_timeout_ms(),
            migrate_storage_on_complete: default_migrate_storage_on_complete(),
            sandbox: false,
        }
    }
}

impl EngineConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn pickle_timeout(&self) -> Duration {
        Duration::from_millis(self.pickle_timeout_ms)
    }

    pub fn thread_dump_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_dump_timeout_ms)
    }
}

impl Config {
    /// Load configuration with full priority chain:
    /// builder overrides → env vars → config file → defaults
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Load configuration from a specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Create a builder for constructing config with overrides
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for constructing Config with optional overrides
#[derive(Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    durability: Option<DurabilityHint>,
    safepoint_budget: Option<usize>,
    stop_timeout_ms: Option<u64>,
    pickle_timeout_ms: Option<u64>,
    thread_dump_timeout_ms: Option<u64>,
    migrate_storage_on_complete: Option<bool>,
    sandbox: Option<bool>,
}

impl ConfigBuilder {
    /// Override the config file path
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn durability(mut self, durability: Option<DurabilityHint>) -> Self {
        self.durability = durability;
        self
    }

    pub fn safepoint_budget(mut self, budget: Option<usize>) -> Self {
        self.safepoint_budget = budget;
        self
    }

    pub fn stop_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.stop_timeout_ms = timeout;
        self
    }

    pub fn pickle_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.pickle_timeout_ms = timeout;
        self
    }

    pub fn thread_dump_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.thread_dump_timeout_ms = timeout;
        self
    }

    pub fn migrate_storage_on_complete(mut self, migrate: Option<bool>) -> Self {
        self.migrate_storage_on_complete = migrate;
        self
    }

    pub fn sandbox(mut self, sandbox: Option<bool>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Build the final config by applying priority chain
    pub fn build(self) -> Result<Config> {
        // Load .env file if present (do this first, so env vars can override it)
        let _ = dotenvy::dotenv();

        let mut config = match self.load_from_file()? {
            Some(file_config) => file_config,
            None => Config::default(),
        };

        self.apply_env_vars(&mut config)?;
        self.apply_overrides(&mut config);

        if config.engine.safepoint_budget == 0 {
            anyhow::bail!("safepoint_budget must be greater than zero");
        }

        Ok(config)
    }

    /// Try to load config from file (searches default locations if no path specified)
    fn load_from_file(&self) -> Result<Option<Config>> {
        let config_path = if let Some(path) = &self.config_path {
            if !path.exists() {
                anyhow::bail!("Config file not found: {:?}", path);
            }
            Some(path.clone())
        } else if let Ok(path_str) = env::var("CADENCE_CONFIG_PATH") {
            let path = PathBuf::from(path_str);
            if !path.exists() {
                anyhow::bail!("Config file not found: {:?}", path);
            }
            Some(path)
        } else {
            self.find_config_file()
        };

        match config_path {
            Some(path) => Ok(Some(Config::from_file(&path)?)),
            None => Ok(None),
        }
    }

    /// Search for config file in default locations
    fn find_config_file(&self) -> Option<PathBuf> {
        let project_config = PathBuf::from("cadence.toml");
        if project_config.exists() {
            return Some(project_config);
        }

        if let Some(home) = env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("cadence")
                .join("config.toml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Apply environment variables to config
    fn apply_env_vars(&self, config: &mut Config) -> Result<()> {
        if let Ok(durability) = env::var("CADENCE_DURABILITY") {
            config.engine.durability = durability
                .parse()
                .context("Invalid CADENCE_DURABILITY")?;
        }

        if let Ok(budget) = env::var("CADENCE_SAFEPOINT_BUDGET") {
            if let Ok(budget) = budget.parse() {
                config.engine.safepoint_budget = budget;
            }
        }

        if let Ok(timeout) = env::var("CADENCE_STOP_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                config.engine.stop_timeout_ms = timeout;
            }
        }

        if let Ok(timeout) = env::var("CADENCE_PICKLE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                config.engine.pickle_timeout_ms = timeout;
            }
        }

        if let Ok(timeout) = env::var("CADENCE_THREAD_DUMP_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                config.engine.thread_dump_timeout_ms = timeout;
            }
        }

        if let Ok(migrate) = env::var("CADENCE_MIGRATE_STORAGE") {
            if let Ok(migrate) = migrate.parse() {
                config.engine.migrate_storage_on_complete = migrate;
            }
        }

        if let Ok(sandbox) = env::var("CADENCE_SANDBOX") {
            if let Ok(sandbox) = sandbox.parse() {
                config.engine.sandbox = sandbox;
            }
        }

        Ok(())
    }

    /// Apply builder overrides (highest priority)
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(durability) = self.durability {
            config.engine.durability = durability;
        }

        if let Some(budget) = self.safepoint_budget {
            config.engine.safepoint_budget = budget;
        }

        if let Some(timeout) = self.stop_timeout_ms {
            config.engine.stop_timeout_ms = timeout;
        }

        if let Some(timeout) = self.pickle_timeout_ms {
            config.engine.pickle_timeout_ms = timeout;
        }

        if let Some(timeout) = self.thread_dump_timeout_ms {
            config.engine.thread_dump_timeout_ms = timeout;
        }

        if let Some(migrate) = self.migrate_storage_on_complete {
            config.engine.migrate_storage_on_complete = migrate;
        }

        if let Some(sandbox) = self.sandbox {
            config.engine.sandbox = sandbox;
        }
    }
}
