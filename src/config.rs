//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (DOCVIEW_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [limits]
//! max_group_count = 100000
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! DOCVIEW_LIMITS__MAX_GROUP_COUNT=500000
//! DOCVIEW_LOGGING__LEVEL=debug
//! ```
//!
//! Configuration here is strictly ambient: narrowing a limit or changing
//! the log level never changes what a pipeline computes, only how much of
//! it it's allowed to accumulate before reporting an evaluation error.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: ResourceLimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bounds on per-pipeline accumulation, so a runaway `$group` or `$push`
/// turns into a reported evaluation error rather than unbounded growth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    /// Maximum number of distinct groups a `$group` stage may hold.
    /// `None` = unlimited.
    #[serde(default)]
    pub max_group_count: Option<usize>,

    /// Maximum number of elements a `$push`/`$addToSet` accumulator may
    /// hold per group. `None` = unlimited.
    #[serde(default)]
    pub max_accumulator_elements: Option<usize>,

    /// Maximum number of rows any single stage's active set may hold.
    /// `None` = unlimited.
    #[serde(default)]
    pub max_active_set_size: Option<usize>,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        ResourceLimitsConfig {
            max_group_count: None,
            max_accumulator_elements: None,
            max_active_set_size: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. `config.toml` (base configuration)
    /// 2. `config.local.toml` (local overrides, git-ignored)
    /// 3. Environment variables (`DOCVIEW_*` prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("DOCVIEW_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DOCVIEW_").split("__"))
            .extract()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            limits: ResourceLimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
