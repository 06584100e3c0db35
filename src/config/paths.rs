//! Configuration paths
//!
//! Utilities for resolving configuration and state locations.

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("SANDRUN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("sandrun"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("sandrun"))
                .unwrap_or_else(|| PathBuf::from(".sandrun"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SANDRUN_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.toml")
}

/// Get the state directory (workspaces live here by default)
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDRUN_STATE_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG data directory or fallback
    dirs::data_dir()
        .map(|d| d.join("sandrun"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local").join("share").join("sandrun"))
                .unwrap_or_else(|| PathBuf::from(".sandrun"))
        })
}

/// Get the default workspace root
pub fn workspace_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDRUN_WORKSPACE") {
        return PathBuf::from(dir);
    }

    state_dir().join("workspaces")
}
