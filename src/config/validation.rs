//! Configuration validation
//!
//! Validates configuration and reports issues. Errors are fatal at engine
//! construction; warnings are logged.

use regex::Regex;

use super::types::sandbox::HARD_TIMEOUT_CEILING_SECS;
use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }

    /// Collapse all errors into a single message
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_workspace_config(config, result);
    result = validate_sandbox_config(config, result);
    result = validate_verification_config(config, result);
    result = validate_language_table(config, result);

    result
}

fn validate_workspace_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.workspace.root.as_os_str().is_empty() {
        result = result.with_error(
            ValidationIssue::new("workspace.root", "Workspace root is empty")
                .with_suggestion("Set workspace.root or SANDRUN_WORKSPACE_ROOT"),
        );
    } else if !config.workspace.root.exists() {
        result = result.with_warning(
            ValidationIssue::new(
                "workspace.root",
                format!(
                    "Workspace root does not exist and will be created: {}",
                    config.workspace.root.display()
                ),
            ),
        );
    }

    result
}

fn validate_sandbox_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;

    if sandbox.max_timeout_secs == 0 || sandbox.max_timeout_secs > HARD_TIMEOUT_CEILING_SECS {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.max_timeout_secs",
                format!(
                    "Maximum timeout must be within 1..={}s, got {}s",
                    HARD_TIMEOUT_CEILING_SECS, sandbox.max_timeout_secs
                ),
            ),
        );
    }

    if sandbox.default_timeout_secs == 0 || sandbox.default_timeout_secs > sandbox.max_timeout_secs {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.default_timeout_secs",
                format!(
                    "Default timeout {}s must be within 1..={}s",
                    sandbox.default_timeout_secs, sandbox.max_timeout_secs
                ),
            )
            .with_suggestion("Lower default_timeout_secs or raise max_timeout_secs"),
        );
    }

    match sandbox.memory_bytes() {
        // Docker refuses limits below 6MB
        Some(bytes) if bytes >= 6 * 1024 * 1024 => {}
        _ => {
            result = result.with_error(
                ValidationIssue::new(
                    "sandbox.memory_limit",
                    format!("Invalid memory limit: {}", sandbox.memory_limit),
                )
                .with_suggestion("Use a size of at least 6m, e.g. \"256m\" or \"1g\""),
            );
        }
    }

    if sandbox.scratch_bytes().map_or(true, |bytes| bytes <= 0) {
        result = result.with_error(ValidationIssue::new(
            "sandbox.scratch_size",
            format!("Invalid scratch size: {}", sandbox.scratch_size),
        ));
    }

    if !(sandbox.cpu_limit > 0.0) {
        result = result.with_error(ValidationIssue::new(
            "sandbox.cpu_limit",
            format!("CPU limit must be positive, got {}", sandbox.cpu_limit),
        ));
    }

    if sandbox.pids_limit <= 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.pids_limit",
            "Process limit must be positive",
        ));
    }

    if sandbox.max_output_bytes == 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.max_output_bytes",
            "Output capture limit must be positive",
        ));
    }

    if sandbox.container_prefix.is_empty()
        || !sandbox
            .container_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container_prefix",
            "Container prefix must be non-empty and contain only [A-Za-z0-9_-]",
        ));
    }

    if sandbox.grace_period.is_zero() {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.grace_period",
                "Zero grace period: units are killed without a chance to exit cleanly",
            ),
        );
    }

    result
}

fn validate_verification_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if !(config.verification.tolerance > 0.0) || !config.verification.tolerance.is_finite() {
        result = result.with_error(ValidationIssue::new(
            "verification.tolerance",
            format!(
                "Tolerance must be a positive number, got {}",
                config.verification.tolerance
            ),
        ));
    }

    result
}

fn validate_language_table(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.languages.is_empty() {
        return result.with_error(
            ValidationIssue::new("languages", "No languages configured")
                .with_suggestion("Remove the [languages] section to use the built-in table"),
        );
    }

    for (id, language) in &config.languages {
        let path = |field: &str| format!("languages.{}.{}", id, field);

        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            result = result.with_error(ValidationIssue::new(
                format!("languages.{}", id),
                "Language id must contain only [A-Za-z0-9_-]",
            ));
        }
        if language.image.trim().is_empty() {
            result = result.with_error(ValidationIssue::new(path("image"), "Image is empty"));
        }
        if language.file_ext.is_empty()
            || !language.file_ext.chars().all(|c| c.is_ascii_alphanumeric())
        {
            result = result.with_error(
                ValidationIssue::new(
                    path("file_ext"),
                    format!("Invalid file extension: '{}'", language.file_ext),
                )
                .with_suggestion("Use a bare extension such as \"py\""),
            );
        }
        if language.cmd.is_empty() {
            result = result.with_error(ValidationIssue::new(path("cmd"), "Run command is empty"));
        }
        if language.compile.as_ref().map_or(false, |c| c.is_empty()) {
            result = result.with_error(ValidationIssue::new(
                path("compile"),
                "Compile command is present but empty",
            ));
        }
        if !language.packages.is_empty() && language.install_cmd.is_empty() {
            result = result.with_error(ValidationIssue::new(
                path("install_cmd"),
                "Packages are listed but no install command is set",
            ));
        }

        for (field, patterns) in [
            ("syntax_patterns", &language.syntax_patterns),
            ("runtime_patterns", &language.runtime_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = Regex::new(pattern) {
                    result = result.with_error(ValidationIssue::new(
                        path(field),
                        format!("Invalid pattern '{}': {}", pattern, e),
                    ));
                }
            }
        }
    }

    result
}
