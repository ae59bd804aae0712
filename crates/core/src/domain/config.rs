//! Engine configuration
//!
//! Contents:
//! - [`EngineConfig`], the TOML-backed startup settings of the pipeline
//! - Async load/save through `tokio::fs`
//! - [`ConfigManager`] for the main config file at `<config_dir>/ampdsp/engine.toml`

use crate::domain::engine::EmergencyLimiterSettings;
use crate::domain::routing::RoutingMatrix;
use crate::domain::stage::limits::{DEFAULT_SAMPLE_RATE, MAX_FRAMES};
use crate::domain::state::PipelineState;
use crate::domain::swap::SwapPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Accepted sample rates, in Hz
pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Failures while reading, writing or validating the engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is not valid TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config could not be encoded as TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("config rejected: {0}")]
    Invalid(String),
}

/// Startup settings of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate of the converters
    pub sample_rate: u32,

    /// Frames per block handed to the audio engine
    pub block_frames: usize,

    /// Seed the parametric-EQ band region on every channel at startup
    pub seed_peq_bands: bool,

    pub swap: SwapPolicy,

    pub emergency_limiter: EmergencyLimiterSettings,

    /// Output routing matrix the pipeline starts with
    pub routing: RoutingMatrix,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_frames: MAX_FRAMES,
            seed_peq_bands: true,
            swap: SwapPolicy::default(),
            emergency_limiter: EmergencyLimiterSettings::default(),
            routing: RoutingMatrix::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !SAMPLE_RATE_RANGE.contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate {} outside {}..={}",
                self.sample_rate,
                SAMPLE_RATE_RANGE.start(),
                SAMPLE_RATE_RANGE.end()
            )));
        }
        if self.block_frames == 0 || self.block_frames > MAX_FRAMES {
            return Err(ConfigError::Invalid(format!(
                "block_frames {} outside 1..={MAX_FRAMES}",
                self.block_frames
            )));
        }
        if self.swap.wait_interval_ms == 0 {
            return Err(ConfigError::Invalid("swap.wait_interval_ms must be positive".into()));
        }
        if !self.emergency_limiter.threshold_db.is_finite() || self.emergency_limiter.threshold_db > 0.0 {
            return Err(ConfigError::Invalid(format!(
                "emergency_limiter.threshold_db {} must be a finite value ≤ 0",
                self.emergency_limiter.threshold_db
            )));
        }
        if self.routing.rows().iter().flatten().any(|g| !g.is_finite()) {
            return Err(ConfigError::Invalid("routing gains must be finite".into()));
        }
        Ok(())
    }

    /// Initial pipeline state described by this configuration
    pub fn initial_state(&self) -> PipelineState {
        let mut state = if self.seed_peq_bands {
            PipelineState::with_peq_bands(self.sample_rate)
        } else {
            PipelineState::new(self.sample_rate)
        };
        state.set_routing(self.routing);
        state
    }

    /// Read and validate a TOML engine config
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Reading engine config");

        let text = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;

        debug!(sample_rate = config.sample_rate, "Engine config read");
        Ok(config)
    }

    /// Write this config as TOML, creating parent directories
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Writing engine config");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = toml::to_string_pretty(self)?;
        fs::write(path, encoded).await?;

        debug!("Engine config written");
        Ok(())
    }
}

/// Manager for the main engine configuration file
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("engine.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// `~/.config/ampdsp` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("ampdsp"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the configuration, falling back to defaults
    ///
    /// A missing file is created with the defaults. A corrupt or invalid one
    /// is copied to `engine.toml.corrupt` and replaced in memory by the
    /// defaults.
    #[instrument(skip(self))]
    pub async fn load(&self) -> EngineConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating default"
            );

            let config = EngineConfig::default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default config"
                );
            }
            return config;
        }

        match EngineConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let corrupt = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &corrupt).await {
                    error!(
                        path = %corrupt.display(),
                        error = %copy_err,
                        "Failed to back up corrupt config"
                    );
                }
                EngineConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EngineConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    /// Delete the config file
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        if self.config_path.exists() {
            fs::remove_file(&self.config_path).await?;
            info!(path = %self.config_path.display(), "Configuration cleared");
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
