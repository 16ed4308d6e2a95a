//! Configuration system for Provtrack.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config directory (`config.toml`) and/or
//! `.provtrack/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::event::DEFAULT_MAX_PARAM_BYTES;
use crate::run::RunKey;

/// Top-level configuration for a tracking session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

/// Grouping metadata attached to every run the tracker opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_name: String,
    pub pipeline_name: String,
    #[serde(default)]
    pub user_tag: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            project_name: "default".to_string(),
            pipeline_name: "main".to_string(),
            user_tag: None,
            description: None,
        }
    }
}

impl RunConfig {
    pub fn new(project_name: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            pipeline_name: pipeline_name.into(),
            ..Self::default()
        }
    }

    pub fn with_user_tag(mut self, tag: impl Into<String>) -> Self {
        self.user_tag = Some(tag.into());
        self
    }

    pub fn key(&self) -> RunKey {
        RunKey {
            project_name: self.project_name.clone(),
            pipeline_name: self.pipeline_name.clone(),
            user_tag: self.user_tag.clone(),
        }
    }
}

/// Parameter capture limits for the interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Parameters whose JSON form exceeds this many bytes are summarized.
    #[serde(default = "default_max_param_bytes")]
    pub max_param_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_param_bytes: default_max_param_bytes(),
        }
    }
}

fn default_max_param_bytes() -> usize {
    DEFAULT_MAX_PARAM_BYTES
}

/// Where the file-backed snapshot store lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root. Falls back to the platform data directory when unset.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the store root directory.
    pub fn resolved_root(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.clone();
        }
        directories::ProjectDirs::from("dev", "provtrack", "provtrack")
            .map(|d| d.data_dir().join("store"))
            .unwrap_or_else(|| PathBuf::from(".provtrack").join("store"))
    }
}

/// Console writer settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Attach a console writer to every tracker built from this config.
    #[serde(default)]
    pub enabled: bool,
}

impl TrackerConfig {
    /// Check values that figment cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.project_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "run.project_name must not be empty".to_string(),
            });
        }
        if self.run.pipeline_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "run.pipeline_name must not be empty".to_string(),
            });
        }
        if self.capture.max_param_bytes == 0 {
            return Err(ConfigError::Invalid {
                message: "capture.max_param_bytes must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `PROVTRACK_`)
/// 3. Workspace-local config (`.provtrack/config.toml`)
/// 4. User config (`<config dir>/provtrack/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TrackerConfig>,
) -> Result<TrackerConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrackerConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PROVTRACK_RUN__PROJECT_NAME, PROVTRACK_STORE__ROOT, etc.
    figment = figment.merge(Env::prefixed("PROVTRACK_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrackerConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// User-level config file location, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "provtrack", "provtrack")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Workspace-level config file location.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".provtrack").join("config.toml")
}

/// Write `config` as TOML to the workspace config file.
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn write_workspace_config(
    workspace: &Path,
    config: &TrackerConfig,
    force: bool,
) -> Result<PathBuf, ConfigError> {
    let path = workspace_config_path(workspace);
    if path.exists() && !force {
        return Err(ConfigError::Invalid {
            message: format!("{} already exists", path.display()),
        });
    }
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    crate::persistence::atomic_write(&path, content.as_bytes()).map_err(|e| {
        ConfigError::Invalid {
            message: format!("failed to write {}: {e}", path.display()),
        }
    })?;
    Ok(path)
}
