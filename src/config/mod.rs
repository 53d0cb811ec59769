pub mod profiles;
pub mod settings;

pub use profiles::*;
pub use settings::*;

use crate::error::{EngineError, EngineResult};
use std::path::PathBuf;

/// Get the sshdeck config directory
pub fn get_config_dir() -> EngineResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| EngineError::Config("Could not find config directory".into()))?
        .join("sshdeck");

    Ok(config_dir)
}

/// Expand a leading `~/` against the local home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
