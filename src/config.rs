//! # Configuration Module
//!
//! This module handles configuration management and data directory setup for the
//! engine. Tuning parameters for every component live in one [`EngineConfig`],
//! which can be loaded from a TOML file; any section or key left out falls back
//! to its default.
//!
//! ## Data Storage
//!
//! The engine stores the user profile in the platform-standard data directory:
//! - Linux: `~/.local/share/muse-engine/`
//! - macOS: `~/Library/Application Support/muse-engine/`
//! - Windows: `%APPDATA%\muse-engine\`
//!
//! ## Example
//!
//! ```toml
//! [index]
//! dimension = 64
//! max_connections = 12
//!
//! [aggregator]
//! strategy = "merge"
//! provider_timeout_ms = 2500
//!
//! [radio]
//! refill_threshold = 5
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::features::AggregatorConfig;
use crate::generator::GeneratorConfig;
use crate::index::IndexConfig;
use crate::radio::RadioConfig;
use crate::scoring::ScoringConfig;

const APP_DIR: &str = "muse-engine";

/// Returns the platform-appropriate data directory for the engine.
///
/// The directory is created if it does not exist yet.
///
/// # Errors
///
/// Returns an error if the system data directory cannot be determined or the
/// subdirectory cannot be created.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let engine_dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&engine_dir).with_context(|| {
        format!(
            "Failed to create data directory at {}. Please check file permissions.",
            engine_dir.display()
        )
    })?;

    Ok(engine_dir)
}

/// Returns the path of the SQLite file holding the persisted user profile.
pub fn get_profile_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("profile.db"))
}

/// Returns the default location of the optional configuration file.
pub fn get_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("engine.toml"))
}

/// Tuning parameters for every engine component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub index: IndexConfig,
    pub aggregator: AggregatorConfig,
    pub scoring: ScoringConfig,
    pub generator: GeneratorConfig,
    pub radio: RadioConfig,
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("In config file {}", path.display()))
    }

    /// Load the configuration from the default location, or defaults if the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self> {
        match get_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.index.dimension == 0 {
            anyhow::bail!("index.dimension must be positive");
        }
        if self.index.max_connections < 2 {
            anyhow::bail!("index.max_connections must be at least 2");
        }
        if !(0.0..=1.0).contains(&self.scoring.max_model_weight) {
            anyhow::bail!("scoring.max_model_weight must be within [0, 1]");
        }
        if self.radio.batch_size == 0 {
            anyhow::bail!("radio.batch_size must be positive");
        }
        Ok(())
    }
}
