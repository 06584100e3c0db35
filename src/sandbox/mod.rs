//! Sandbox module - Sandboxed execution engine
//!
//! - languages: language registry (image, commands, failure signatures)
//! - workspace: per-session `code/`, `data/`, `output/` directories
//! - validator: request validation, before any sandbox resource exists
//! - runtime / container: container runtime boundary and its Docker backend
//! - driver: one hardened, time-bounded unit per execution
//! - analyzer / verify: classification and numeric verification
//! - registry: in-flight and recent executions, cancellation

mod analyzer;
mod container;
mod driver;
mod executor;
mod languages;
mod registry;
mod runtime;
mod validator;
mod verify;
mod workspace;

pub use analyzer::{truncate_utf8, ResultAnalyzer};
pub use container::DockerRuntime;
pub use driver::{unit_name, ExecutionDriver};
pub use executor::{
    ErrorClassification, ExecutionId, ExecutionRequest, ExecutionResult, ExecutionStatus,
    RawCapture, Verification, DEFAULT_SESSION,
};
pub use languages::{FailureSignature, LanguageDescriptor, LanguageRegistry};
pub use registry::{CancelToken, ExecutionHandle, ExecutionRegistry};
pub use runtime::{
    is_past_deadline, BindMount, CappedOutput, ContainerRuntime, UnitExit, UnitHandle, UnitLogs,
    UnitSignal, UnitSpec, LABEL_DEADLINE, LABEL_EXECUTION, LABEL_MANAGED, LABEL_SESSION,
};
pub use validator::{RequestValidator, ValidatedRequest};
pub use verify::{ConstantTag, Verifier};
pub use workspace::{
    normalize_session_key, validate_file_name, Workspace, WorkspaceDir, WorkspaceFile,
    WorkspaceInfo, WorkspaceStore,
};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{validate_config, Config};
use crate::error::{Error, Result};

/// A submitted execution running in the background
pub struct ExecutionTicket {
    pub execution_id: ExecutionId,
    pub join: JoinHandle<ExecutionResult>,
}

/// Entry point: validate, run, analyze and track executions
pub struct SandboxEngine {
    config: Config,
    languages: Arc<LanguageRegistry>,
    workspaces: WorkspaceStore,
    validator: RequestValidator,
    registry: Arc<ExecutionRegistry>,
    driver: Arc<ExecutionDriver>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl SandboxEngine {
    /// Build an engine over any container runtime
    ///
    /// Configuration errors are fatal here; warnings are logged.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let validation = validate_config(&config);
        for warning in &validation.warnings {
            warn!("Config warning: {}", warning);
        }
        if !validation.valid {
            return Err(Error::Config(validation.error_summary()));
        }

        let languages = Arc::new(LanguageRegistry::from_table(&config.languages)?);
        let workspaces = WorkspaceStore::new(config.workspace.root.clone());
        let validator = RequestValidator::new(
            languages.clone(),
            workspaces.clone(),
            config.sandbox.clone(),
        );
        let registry = Arc::new(ExecutionRegistry::new(config.registry.history_limit));
        let analyzer = Arc::new(ResultAnalyzer::new(
            languages.clone(),
            &config.verification,
            config.sandbox.max_output_bytes,
        )?);
        let driver = Arc::new(ExecutionDriver::new(
            runtime.clone(),
            registry.clone(),
            analyzer,
            config.sandbox.clone(),
        ));

        info!(
            "Sandbox engine ready: runtime={}, languages=[{}], workspaces={}",
            runtime.name(),
            languages.supported(),
            workspaces.root().display()
        );

        Ok(SandboxEngine {
            config,
            languages,
            workspaces,
            validator,
            registry,
            driver,
            runtime,
        })
    }

    /// Build an engine over the local Docker daemon
    pub async fn connect(config: Config) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::connect().await?);
        let engine = SandboxEngine::new(config, runtime)?;

        if engine.config.sandbox.reap_orphans_on_start {
            if let Err(e) = engine.reap_orphans().await {
                warn!("Failed to reap orphaned units: {}", e);
            }
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Open the workspace for a session key
    pub async fn workspace(&self, session: &str) -> Result<Workspace> {
        self.workspaces.open(session).await
    }

    /// Run a request to completion
    ///
    /// Validation failures come back as `Err`; every execution that got past
    /// validation comes back as a terminal result, whatever happened to it.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let validated = self.validator.validate(request).await?;
        let token = self.driver.prepare(&validated)?;
        Ok(run_and_record(self.driver.clone(), validated, token, self.config.sandbox.record_results).await)
    }

    /// Validate and register now, run in the background
    ///
    /// The id is known (and cancellable) before this returns.
    pub async fn spawn(&self, request: ExecutionRequest) -> Result<ExecutionTicket> {
        let validated = self.validator.validate(request).await?;
        let token = self.driver.prepare(&validated)?;
        let execution_id = validated.execution_id.clone();

        let driver = self.driver.clone();
        let record = self.config.sandbox.record_results;
        let join = tokio::spawn(run_and_record(driver, validated, token, record));

        Ok(ExecutionTicket { execution_id, join })
    }

    pub fn list(&self) -> Vec<ExecutionHandle> {
        self.registry.list()
    }

    /// Executions of one session; the key is normalized first
    pub fn list_for_session(&self, session: &str) -> Vec<ExecutionHandle> {
        match normalize_session_key(session) {
            Ok(key) => self.registry.list_for_session(&key),
            Err(_) => Vec::new(),
        }
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ExecutionHandle> {
        self.registry.get(id)
    }

    /// Terminal result of a recent execution
    pub fn result(&self, id: &ExecutionId) -> Option<ExecutionResult> {
        self.registry.result(id)
    }

    /// Cancel a live execution; false if unknown, finished or already cancelled
    pub fn cancel(&self, id: &ExecutionId) -> bool {
        self.registry.cancel(id)
    }

    /// Check that the container runtime is reachable
    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// Remove units left behind by a previous process
    pub async fn reap_orphans(&self) -> Result<usize> {
        self.runtime.reap(LABEL_MANAGED).await
    }

    /// Make the runtime images of the given languages (all when empty) available
    pub async fn prepare_images(&self, language_ids: &[String]) -> Vec<(String, Result<()>)> {
        let descriptors: Vec<Arc<LanguageDescriptor>> = if language_ids.is_empty() {
            self.languages.iter().cloned().collect()
        } else {
            let mut found = Vec::new();
            for id in language_ids {
                match self.languages.resolve(id) {
                    Ok(descriptor) => found.push(descriptor),
                    Err(e) => return vec![(id.clone(), Err(e))],
                }
            }
            found
        };

        let sandbox = &self.config.sandbox;
        let mut outcomes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let outcome = self
                .runtime
                .ensure_image(&descriptor.runtime_image, true, sandbox.image_pull_timeout)
                .await;
            outcomes.push((descriptor.id.clone(), outcome));
        }
        outcomes
    }
}

async fn run_and_record(
    driver: Arc<ExecutionDriver>,
    validated: ValidatedRequest,
    token: CancelToken,
    record: bool,
) -> ExecutionResult {
    let workspace = validated.workspace.clone();
    let result = driver.run(validated, token).await;
    if record {
        record_result(&workspace, &result).await;
    }
    result
}

/// Write `result_<id>.txt` (stdout) or `error_<id>.txt` (stderr) into `output/`
async fn record_result(workspace: &Workspace, result: &ExecutionResult) {
    let (name, content) = if result.success() {
        (format!("result_{}.txt", result.execution_id), result.stdout.clone())
    } else {
        let content = if result.stderr.is_empty() {
            result.error_summary.clone().unwrap_or_else(|| result.status.to_string())
        } else {
            result.stderr.clone()
        };
        (format!("error_{}.txt", result.execution_id), content)
    };

    if let Err(e) = workspace.write_file(WorkspaceDir::Output, &name, content).await {
        warn!("Failed to record result of {}: {}", result.execution_id, e);
    }
}
