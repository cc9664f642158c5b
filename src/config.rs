//! Configuration loading and tunables.
//!
//! Settings merge from three layers, lowest to highest precedence: built-in
//! defaults, an optional TOML file, and `PORTHOLE`-prefixed environment
//! variables (nested keys separated by `__`, e.g.
//! `PORTHOLE__STORAGES__SETTLE_MS=750`).

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;

fn default_page_size() -> u64 {
    32
}

fn default_display_cap() -> u64 {
    32_000
}

fn default_selection_chunk() -> usize {
    1024
}

fn default_confirm_threshold() -> usize {
    1000
}

fn default_min_pattern_len() -> usize {
    3
}

/// Per-view overrides for debounce and polling. Unset fields fall back to the
/// view's built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewTuningOverlay {
    pub settle_ms: Option<u64>,
    pub poll_secs: Option<u64>,
}

/// Resolved per-view timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewTuning {
    /// Settle window merging requests that arrive shortly after a wake.
    pub settle: Duration,
    /// Periodic re-poll interval when no requests arrive.
    pub poll: Duration,
}

impl ViewTuningOverlay {
    fn resolve(&self, settle_ms: u64, poll_secs: u64) -> ViewTuning {
        ViewTuning {
            settle: Duration::from_millis(self.settle_ms.unwrap_or(settle_ms)),
            poll: Duration::from_secs(self.poll_secs.unwrap_or(poll_secs)),
        }
    }
}

/// All synchronizer tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortholeConfig {
    /// Rows per remote page fetch.
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Display ceiling for the flat views. Counts beyond this are reported
    /// but rows past it are never materialized.
    #[serde(default = "default_display_cap")]
    pub display_cap: u64,

    /// Maximum ids per selection add/remove command.
    #[serde(default = "default_selection_chunk")]
    pub selection_chunk: usize,

    /// Bulk operations above this many items require caller confirmation.
    #[serde(default = "default_confirm_threshold")]
    pub confirm_threshold: usize,

    /// Non-empty filter patterns shorter than this are queried as empty.
    #[serde(default = "default_min_pattern_len")]
    pub min_pattern_len: usize,

    #[serde(default)]
    pub storages: ViewTuningOverlay,

    #[serde(default)]
    pub entries: ViewTuningOverlay,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PortholeConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            display_cap: default_display_cap(),
            selection_chunk: default_selection_chunk(),
            confirm_threshold: default_confirm_threshold(),
            min_pattern_len: default_min_pattern_len(),
            storages: ViewTuningOverlay::default(),
            entries: ViewTuningOverlay::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PortholeConfig {
    /// Load config with the environment overlay on top of an optional file.
    pub fn load(file: Option<&Path>) -> Result<PortholeConfig, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let builder = builder.add_source(
            Environment::with_prefix("PORTHOLE")
                .separator("__")
                .try_parsing(true),
        );
        let config: PortholeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Message("page_size must be at least 1".to_string()));
        }
        if self.display_cap < self.page_size {
            return Err(ConfigError::Message(
                "display_cap must be at least one page".to_string(),
            ));
        }
        if self.selection_chunk == 0 {
            return Err(ConfigError::Message(
                "selection_chunk must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Storage view timing: 500 ms settle, 30 s poll unless overridden.
    pub fn storages_tuning(&self) -> ViewTuning {
        self.storages.resolve(500, 30)
    }

    /// Entry view timing: 2 s settle, 5 min poll unless overridden.
    pub fn entries_tuning(&self) -> ViewTuning {
        self.entries.resolve(2000, 300)
    }
}
