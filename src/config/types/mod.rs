//! Configuration types module

pub mod language;
pub mod sandbox;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace store configuration
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Sandbox policy
    #[serde(default)]
    pub sandbox: sandbox::SandboxConfig,

    /// Numeric verification policy
    #[serde(default)]
    pub verification: sandbox::VerificationConfig,

    /// Execution registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Language table, keyed by language id
    #[serde(default = "language::default_languages")]
    pub languages: BTreeMap<String, language::LanguageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: WorkspaceConfig::default(),
            sandbox: sandbox::SandboxConfig::default(),
            verification: sandbox::VerificationConfig::default(),
            registry: RegistryConfig::default(),
            languages: language::default_languages(),
        }
    }
}

/// Workspace store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory holding one subdirectory per session
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    crate::config::workspace_dir()
}

/// Execution registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Terminal handles kept for `get`/`list` after they finish
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            history_limit: default_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    256
}
