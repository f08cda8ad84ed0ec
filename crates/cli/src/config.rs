// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// netstack - CLI Config Module
// Locates the settings file and applies command-line overrides

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use netstack_common::Settings;

/// Command-line path overrides, applied after the settings file is read
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub engine_bin: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// Settings plus the file they came from (if any)
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub settings: Settings,
    pub source: Option<PathBuf>,
}

impl CliConfig {
    /// Load settings from `explicit`, or from the default location
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (expand_path(path), true),
            None => (Self::config_path()?, false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Settings file not found: {}", path.display());
            }
            return Ok(Self::from_settings(Settings::default(), None));
        }

        let settings = Settings::load(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        Ok(Self::from_settings(settings, Some(path)))
    }

    /// Get the path to the default settings file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("netstack").join("netstack.toml"))
    }

    fn from_settings(mut settings: Settings, source: Option<PathBuf>) -> Self {
        settings.paths.config_dir = expand_path(&settings.paths.config_dir);
        settings.paths.log_dir = expand_path(&settings.paths.log_dir);
        settings.paths.engine_bin = expand_path(&settings.paths.engine_bin);
        Self { settings, source }
    }

    pub fn apply_overrides(&mut self, overrides: &PathOverrides) {
        if let Some(engine_bin) = &overrides.engine_bin {
            self.settings.paths.engine_bin = expand_path(engine_bin);
        }
        if let Some(config_dir) = &overrides.config_dir {
            self.settings.paths.config_dir = expand_path(config_dir);
        }
        if let Some(log_dir) = &overrides.log_dir {
            self.settings.paths.log_dir = expand_path(log_dir);
        }
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }
}

/// Expand a leading `~` to the home directory
fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
        None => path.to_path_buf(),
    }
}
