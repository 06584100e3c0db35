//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use super::types::Config;
use crate::error::{Error, Result};

/// Load a `.env` file if present; variables already set win
///
/// Must run before anything reads `SANDRUN_*` variables, including
/// `config_path()` and `Config::default()`.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Load configuration with layered precedence:
/// 1. `.env` into the environment
/// 2. Config file if it exists, otherwise defaults
/// 3. Environment variable overrides
pub fn load_config() -> Result<Config> {
    load_dotenv();
    load_layered()
}

fn load_layered() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().map_or(false, |ext| ext == "json") {
        // Parse as JSON5 (more lenient than strict JSON)
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().map_or(false, |ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Overlays any set variables; call `load_dotenv` first for `.env` values.
/// Unparsable numeric values are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(root) = std::env::var("SANDRUN_WORKSPACE_ROOT") {
        config.workspace.root = std::path::PathBuf::from(root);
    }
    if let Ok(timeout) = std::env::var("SANDRUN_DEFAULT_TIMEOUT") {
        if let Ok(v) = timeout.parse() {
            config.sandbox.default_timeout_secs = v;
        }
    }
    if let Ok(timeout) = std::env::var("SANDRUN_MAX_TIMEOUT") {
        if let Ok(v) = timeout.parse() {
            config.sandbox.max_timeout_secs = v;
        }
    }
    if let Ok(memory) = std::env::var("SANDRUN_MEMORY_LIMIT") {
        config.sandbox.memory_limit = memory;
    }
    if let Ok(cpu) = std::env::var("SANDRUN_CPU_LIMIT") {
        if let Ok(v) = cpu.parse() {
            config.sandbox.cpu_limit = v;
        }
    }
    if let Ok(pids) = std::env::var("SANDRUN_PIDS_LIMIT") {
        if let Ok(v) = pids.parse() {
            config.sandbox.pids_limit = v;
        }
    }
    if let Ok(tolerance) = std::env::var("SANDRUN_VERIFY_TOLERANCE") {
        if let Ok(v) = tolerance.parse() {
            config.verification.tolerance = v;
        }
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().map_or(false, |ext| ext == "json") {
        serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

/// Render the default configuration as TOML
pub fn sample_config() -> Result<String> {
    toml::to_string_pretty(&Config::default())
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();

        for name in ["config.toml", "config.json"] {
            let path = dir.path().join(name);
            let mut config = Config::default();
            config.sandbox.default_timeout_secs = 7;
            save_config(&config, &path).unwrap();

            let loaded = load_config_from_path(&path).unwrap();
            assert_eq!(loaded.sandbox.default_timeout_secs, 7);
            assert_eq!(loaded.languages.len(), config.languages.len());
            assert_eq!(loaded.sandbox.grace_period, config.sandbox.grace_period);
        }
    }

    #[test]
    fn test_missing_required_language_field_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[languages.python]\nimage = \"python:3.11-slim\"\nfile_ext = \"py\"\n",
        )
        .unwrap();

        let err = load_config_from_path(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_json5_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                sandbox: { memory_limit: "128m", grace_period: "1s" },
            }"#,
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.sandbox.memory_limit, "128m");
        assert!(config.languages.contains_key("go"));
    }

    #[test]
    fn test_env_file_selects_config_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("from-env-file.toml");
        std::fs::write(&config_path, "[sandbox]\ndefault_timeout_secs = 7\n").unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, format!("SANDRUN_CONFIG={}\n", config_path.display())).unwrap();

        dotenvy::from_path(&env_file).unwrap();
        let config = load_layered().unwrap();
        assert_eq!(config.sandbox.default_timeout_secs, 7);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.sandbox.pids_limit, 50);
    }
}
