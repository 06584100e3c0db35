//! Request validation
//!
//! Everything a request can get wrong is caught here, before any sandbox
//! resource exists. On success the source is already on disk in `code/`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::executor::{ExecutionId, ExecutionRequest};
use super::languages::{LanguageDescriptor, LanguageRegistry};
use super::verify::ConstantTag;
use super::workspace::{normalize_session_key, validate_file_name, Workspace, WorkspaceDir, WorkspaceStore};
use crate::config::{parse_memory_limit, SandboxConfig};
use crate::error::{Result, ValidationError};

/// A request that passed validation, with concrete paths and limits
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub execution_id: ExecutionId,
    pub language: Arc<LanguageDescriptor>,
    pub workspace: Workspace,
    pub file_name: String,
    /// Host path of the written source file
    pub source_path: PathBuf,
    pub timeout: Duration,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub verify: Option<ConstantTag>,
}

/// Limits and names resolved from a request, before any side effect
#[derive(Debug, Clone)]
struct Resolved {
    language: Arc<LanguageDescriptor>,
    session_key: String,
    file_name: String,
    timeout: Duration,
    memory_bytes: i64,
    nano_cpus: i64,
}

pub struct RequestValidator {
    languages: Arc<LanguageRegistry>,
    workspaces: WorkspaceStore,
    policy: SandboxConfig,
}

impl RequestValidator {
    pub fn new(languages: Arc<LanguageRegistry>, workspaces: WorkspaceStore, policy: SandboxConfig) -> Self {
        RequestValidator {
            languages,
            workspaces,
            policy,
        }
    }

    /// Validate a request and write its source into the workspace
    pub async fn validate(&self, request: ExecutionRequest) -> Result<ValidatedRequest> {
        let execution_id = ExecutionId::generate();
        let resolved = self.resolve(&request, &execution_id)?;

        let workspace = self.workspaces.open(&resolved.session_key).await?;
        let source_path = workspace
            .write_file(WorkspaceDir::Code, &resolved.file_name, &request.code)
            .await?;

        debug!(
            "Validated execution {} ({}) -> {}",
            execution_id,
            resolved.language.id,
            source_path.display()
        );

        Ok(ValidatedRequest {
            execution_id,
            language: resolved.language,
            workspace,
            file_name: resolved.file_name,
            source_path,
            timeout: resolved.timeout,
            memory_bytes: resolved.memory_bytes,
            nano_cpus: resolved.nano_cpus,
            verify: request.verify,
        })
    }

    fn resolve(&self, request: &ExecutionRequest, id: &ExecutionId) -> std::result::Result<Resolved, ValidationError> {
        let language = self
            .languages
            .resolve(&request.language)
            .map_err(|_| ValidationError::UnknownLanguage {
                language: request.language.clone(),
                supported: self.languages.supported(),
            })?;

        if request.code.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }

        let max = self.policy.max_timeout_secs;
        let timeout_secs = request.timeout_secs.unwrap_or(self.policy.default_timeout_secs);
        if timeout_secs == 0 || timeout_secs > max {
            return Err(ValidationError::TimeoutOutOfRange {
                requested: timeout_secs,
                max,
            });
        }

        let memory_bytes = self.memory_bytes(request.memory_limit.as_deref())?;
        let nano_cpus = self.nano_cpus(request.cpu_limit)?;

        let session_key = normalize_session_key(&request.session)?;

        let file_name = match request.file_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => language.ensure_extension(name),
            _ => language.default_file_name(id.short()),
        };
        validate_file_name(&file_name)?;

        Ok(Resolved {
            language,
            session_key,
            file_name,
            timeout: Duration::from_secs(timeout_secs),
            memory_bytes,
            nano_cpus,
        })
    }

    fn memory_bytes(&self, requested: Option<&str>) -> std::result::Result<i64, ValidationError> {
        let limit = self
            .policy
            .memory_bytes()
            .ok_or_else(|| ValidationError::InvalidMemoryLimit(self.policy.memory_limit.clone()))?;

        let Some(requested) = requested else {
            return Ok(limit);
        };
        let bytes = parse_memory_limit(requested)
            .filter(|b| *b > 0)
            .ok_or_else(|| ValidationError::InvalidMemoryLimit(requested.to_string()))?;

        if bytes > limit {
            return Err(ValidationError::ExceedsPolicy {
                resource: "memory",
                requested: requested.to_string(),
                limit: self.policy.memory_limit.clone(),
            });
        }
        Ok(bytes)
    }

    fn nano_cpus(&self, requested: Option<f64>) -> std::result::Result<i64, ValidationError> {
        let limit = self.policy.cpu_limit;
        let cpus = match requested {
            None => limit,
            Some(cpus) if !cpus.is_finite() || cpus <= 0.0 => {
                return Err(ValidationError::InvalidCpuLimit(cpus))
            }
            Some(cpus) if cpus > limit => {
                return Err(ValidationError::ExceedsPolicy {
                    resource: "cpu",
                    requested: cpus.to_string(),
                    limit: limit.to_string(),
                })
            }
            Some(cpus) => cpus,
        };
        Ok((cpus * 1_000_000_000.0) as i64)
    }
}
