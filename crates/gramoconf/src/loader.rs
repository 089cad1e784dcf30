//! Config file discovery and loading.

use crate::sections::RecordingConfig;
use crate::ConfigError;
use std::path::{Path, PathBuf};

/// Locate the config file to load.
///
/// A CLI-provided path always wins. Otherwise the system location is tried,
/// then a local `gramophone.toml`. Returns `None` when nothing exists, in
/// which case compiled defaults apply.
pub fn discover_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    let system = PathBuf::from("/etc/gramophone/config.toml");
    if system.exists() {
        return Some(system);
    }

    let local = PathBuf::from("gramophone.toml");
    if local.exists() {
        return Some(local);
    }

    None
}

/// Load and parse a TOML config file.
pub fn load_from_file(path: &Path) -> Result<RecordingConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
