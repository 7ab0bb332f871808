//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/braid/config.toml` (user config, or `BRAID_CONFIG_DIR`)
//! 2. `./braid.toml` (project-local)
//!
//! Missing files are skipped.

use std::path::{Path, PathBuf};

use crate::{BraidConfig, ConfigError, Result};

/// Default config filename for project-local config.
pub const PROJECT_CONFIG_FILE: &str = "braid.toml";

/// Config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "braid";

/// Overrides the platform config directory.
const CONFIG_DIR_ENV: &str = "BRAID_CONFIG_DIR";

/// Result of loading a stack of config layers.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: BraidConfig,
    /// Files that existed and were merged, lowest precedence first.
    pub loaded_from: Vec<PathBuf>,
}

/// Load config from a specific file path (no layering).
pub fn load_config_file(path: &Path) -> Result<BraidConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    BraidConfig::from_toml(&contents)
}

/// Discover and merge the user and project config layers.
///
/// `project_dir` defaults to the current directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    let project = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    let paths: Vec<PathBuf> = user_config_path().into_iter().chain([project]).collect();
    load_layered(&paths)
}

/// Path of the user config file.
///
/// Checks `BRAID_CONFIG_DIR` first, then the platform config directory.
pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir).join(USER_CONFIG_FILE));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME).join(USER_CONFIG_FILE))
}

/// Load and merge each existing file in `paths`, then validate the result.
pub fn load_layered<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let mut config = BraidConfig::new();
    let mut loaded_from = Vec::new();

    for path in paths {
        let path = path.as_ref();
        if !path.exists() {
            continue;
        }
        config.merge(load_config_file(path)?);
        loaded_from.push(path.to_path_buf());
    }

    config.validate()?;
    Ok(LoadedConfig {
        config,
        loaded_from,
    })
}
