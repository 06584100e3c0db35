//! Configuration module - Modular configuration management
//!
//! - types/mod.rs: Core configuration types (Config, WorkspaceConfig, RegistryConfig)
//! - types/sandbox.rs: Sandbox policy and verification configuration
//! - types/language.rs: Language table entries and built-in defaults
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{Config, RegistryConfig, WorkspaceConfig};

// Re-export sandbox policy types
pub use types::sandbox::{
    parse_memory_limit, SandboxConfig, VerificationConfig, VerificationMode,
    HARD_TIMEOUT_CEILING_SECS,
};

// Re-export language table types
pub use types::language::{
    builtin_language, default_languages, CommandLine, LanguageConfig, FILE_PLACEHOLDER,
    STEM_PLACEHOLDER,
};

// Re-export IO and utilities
pub use io::{
    apply_env_overrides, load_config, load_config_from_path, load_dotenv, sample_config,
    save_config,
};
pub use paths::{config_dir, config_path, state_dir, workspace_dir};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
