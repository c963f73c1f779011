use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::AppPaths;
use crate::voice::{BiometricsConfig, LivenessConfig, QualityConfig};

/// Snapshot store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Overrides the platform voiceprints directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub biometrics: BiometricsConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub quality: QualityConfig,
}

impl AppConfig {
    /// Load config from file or create default
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            config.validate()?;
            log::info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            log::info!("Default config created at: {}", path.display());
            Ok(config)
        }
    }

    /// Write config with owner-only permissions (0600)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)
                .context("Failed to read config permissions")?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.biometrics
            .validate()
            .context("Invalid [biometrics] section")?;

        let liveness = &self.liveness;
        if !(liveness.min_norm.is_finite()
            && liveness.max_norm.is_finite()
            && liveness.min_norm < liveness.max_norm)
        {
            anyhow::bail!(
                "Invalid [liveness] section: min_norm {} must be below max_norm {}",
                liveness.min_norm,
                liveness.max_norm
            );
        }

        if !(self.quality.min_sample_secs >= 0.0
            && self.quality.min_sample_secs <= self.quality.max_sample_secs)
        {
            anyhow::bail!(
                "Invalid [quality] section: sample window [{}, {}]",
                self.quality.min_sample_secs,
                self.quality.max_sample_secs
            );
        }

        Ok(())
    }

    /// Snapshot store root: the configured override or the platform default
    pub fn store_dir(&self, paths: &AppPaths) -> PathBuf {
        self.store
            .dir
            .clone()
            .unwrap_or_else(|| paths.voiceprints_dir())
    }
}
