use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Application paths following OS conventions
#[derive(Clone, Debug)]
pub struct AppPaths {
    /// Configuration directory (config.toml)
    pub config: PathBuf,
    /// Data directory (voiceprints/)
    pub data: PathBuf,
}

impl AppPaths {
    /// Resolve OS-specific paths for Emberleaf
    ///
    /// # Platform Paths
    ///
    /// ## Linux
    /// - Config: `~/.config/Emberleaf/`
    /// - Data: `~/.local/share/Emberleaf/` → voiceprints/
    ///
    /// ## macOS
    /// - Config: `~/Library/Preferences/Emberleaf/`
    /// - Data: `~/Library/Application Support/Emberleaf/`
    ///
    /// ## Windows
    /// - Config: `%APPDATA%\Emberleaf\config\`
    /// - Data: `%LOCALAPPDATA%\Emberleaf\`
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "LotusEmberLabs", "Emberleaf")
            .context("Failed to determine project directories")?;

        Ok(Self {
            config: proj_dirs.config_dir().to_path_buf(),
            data: proj_dirs.data_dir().to_path_buf(),
        })
    }

    /// Keep everything under one root (`config/`, `data/`)
    pub fn with_data_dir(root: &Path) -> Self {
        Self {
            config: root.join("config"),
            data: root.join("data"),
        }
    }

    /// Create all necessary directories with subdirectories
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.config).context("Failed to create config directory")?;
        fs::create_dir_all(self.voiceprints_dir())
            .context("Failed to create voiceprints directory")?;

        log::debug!("Application directories initialized");
        log::debug!("  Config: {}", self.config.display());
        log::debug!("  Data:   {}", self.data.display());

        Ok(())
    }

    /// Get path to config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Get path to voiceprints directory
    pub fn voiceprints_dir(&self) -> PathBuf {
        self.data.join("voiceprints")
    }
}
