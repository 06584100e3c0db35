//! Container execution driver
//!
//! Turns a validated request into one hardened, time-bounded unit and a raw
//! capture. Teardown happens on every path: explicitly on the normal ones,
//! and from `Drop` if the driving future itself is abandoned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::analyzer::ResultAnalyzer;
use super::executor::{ExecutionId, ExecutionResult, ExecutionStatus, RawCapture};
use super::registry::{CancelToken, ExecutionRegistry};
use super::runtime::{
    BindMount, ContainerRuntime, UnitExit, UnitHandle, UnitLogs, UnitSignal, UnitSpec,
    LABEL_DEADLINE, LABEL_EXECUTION, LABEL_MANAGED, LABEL_SESSION,
};
use super::validator::ValidatedRequest;
use super::workspace::WorkspaceDir;
use crate::config::SandboxConfig;
use crate::error::Result;

/// How long to wait for a unit to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Allowance for log collection and removal on top of the time limits
const TEARDOWN_SLACK: Duration = Duration::from_secs(60);

/// Working directory inside every unit
const UNIT_WORKDIR: &str = "/code";

/// Removes the unit when dropped while still armed
struct UnitGuard {
    runtime: Arc<dyn ContainerRuntime>,
    unit: Option<UnitHandle>,
}

impl UnitGuard {
    /// Explicit teardown on the normal paths
    async fn remove(mut self) {
        if let Some(unit) = self.unit.take() {
            if let Err(e) = self.runtime.remove(&unit).await {
                warn!("Failed to remove unit {}: {}", unit.name, e);
            }
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        let Some(unit) = self.unit.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Execution abandoned, removing unit {} in the background", unit.name);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&unit).await {
                        error!("Failed to remove abandoned unit {}: {}", unit.name, e);
                    }
                });
            }
            Err(_) => error!(
                "No async runtime to remove unit {}; it will be reaped on next start",
                unit.name
            ),
        }
    }
}

/// Gives the registry entry a terminal status if the run never got to it
struct FinishGuard {
    registry: Arc<ExecutionRegistry>,
    capture: Option<RawCapture>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.status = ExecutionStatus::Failed;
            capture.infrastructure_error = Some("execution was abandoned before completion".to_string());
            let id = capture.execution_id.clone();
            if self.registry.finish(&id, ExecutionResult::from_raw(capture)) {
                warn!("Execution {} abandoned; marked failed", id);
            }
        }
    }
}

/// How the wait for a started unit ended
enum Outcome {
    Exited(UnitExit),
    WaitFailed(String),
    TimedOut,
    Cancelled,
}

pub struct ExecutionDriver {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ExecutionRegistry>,
    analyzer: Arc<ResultAnalyzer>,
    policy: SandboxConfig,
}

impl ExecutionDriver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ExecutionRegistry>,
        analyzer: Arc<ResultAnalyzer>,
        policy: SandboxConfig,
    ) -> Self {
        ExecutionDriver {
            runtime,
            registry,
            analyzer,
            policy,
        }
    }

    /// Register the execution as Pending
    pub fn prepare(&self, request: &ValidatedRequest) -> Result<CancelToken> {
        self.registry.register(
            &request.execution_id,
            &request.language.id,
            request.workspace.key(),
        )
    }

    /// Register and run to a terminal result
    pub async fn execute(&self, request: ValidatedRequest) -> Result<ExecutionResult> {
        let token = self.prepare(&request)?;
        Ok(self.run(request, token).await)
    }

    /// Run a prepared execution. Always yields a terminal result.
    pub async fn run(&self, request: ValidatedRequest, token: CancelToken) -> ExecutionResult {
        let mut finish_guard = FinishGuard {
            registry: self.registry.clone(),
            capture: Some(base_capture(&request)),
        };

        let raw = self.drive(&request, &token).await;
        let result = self.analyzer.analyze_or_raw(raw);

        finish_guard.capture = None;
        if !self.registry.finish(&request.execution_id, result.clone()) {
            warn!(
                "Execution {} was already terminal when its result arrived",
                request.execution_id
            );
        }

        info!(
            "Execution {} finished: {} in {}ms",
            request.execution_id, result.status, result.duration_millis
        );
        result
    }

    fn unit_spec(&self, request: &ValidatedRequest) -> UnitSpec {
        let id = &request.execution_id;
        let language = &request.language;

        let mounts = WorkspaceDir::ALL
            .iter()
            .map(|dir| BindMount {
                host: request.workspace.dir(*dir),
                container: dir.container_path().to_string(),
                read_only: !dir.is_writable_in_unit(),
            })
            .collect();

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_EXECUTION.to_string(), id.to_string()),
            (LABEL_SESSION.to_string(), request.workspace.key().to_string()),
            (LABEL_DEADLINE.to_string(), self.deadline(request).to_string()),
        ]);

        UnitSpec {
            name: unit_name(&self.policy.container_prefix, &language.id, id),
            image: language.runtime_image.clone(),
            cmd: language.command_for(&request.file_name),
            env: language.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            working_dir: UNIT_WORKDIR.to_string(),
            mounts,
            memory_bytes: request.memory_bytes,
            nano_cpus: request.nano_cpus,
            pids_limit: self.policy.pids_limit,
            scratch_bytes: self.policy.scratch_bytes().unwrap_or(64 * 1024 * 1024),
            user: self.policy.run_as_user.clone(),
            labels,
        }
    }

    /// Unix time after which this engine no longer owns the unit
    fn deadline(&self, request: &ValidatedRequest) -> i64 {
        let lifetime = request.timeout + self.policy.grace_period + KILL_WAIT + TEARDOWN_SLACK;
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        chrono::Utc::now().timestamp().saturating_add(lifetime).saturating_add(1)
    }

    async fn drive(&self, request: &ValidatedRequest, token: &CancelToken) -> RawCapture {
        let id = &request.execution_id;
        let began = Instant::now();
        let mut capture = base_capture(request);

        let failed = |mut capture: RawCapture, message: String| {
            error!("Execution {} infrastructure failure: {}", id, message);
            capture.status = ExecutionStatus::Failed;
            capture.infrastructure_error = Some(message);
            capture.duration = began.elapsed();
            capture
        };
        let killed = |mut capture: RawCapture| {
            info!("Execution {} cancelled before start", id);
            capture.status = ExecutionStatus::Killed;
            capture.duration = began.elapsed();
            capture
        };

        if token.is_cancelled() {
            return killed(capture);
        }

        // Image presence, raced against cancellation
        let image = &request.language.runtime_image;
        let ensured = tokio::select! {
            ensured = self.runtime.ensure_image(
                image,
                self.policy.pull_missing_images,
                self.policy.image_pull_timeout,
            ) => ensured,
            _ = token.cancelled() => return killed(capture),
        };
        if let Err(e) = ensured {
            return failed(capture, e.to_string());
        }

        let spec = self.unit_spec(request);
        let unit = match self.runtime.create(&spec).await {
            Ok(unit) => unit,
            Err(e) => return failed(capture, e.to_string()),
        };
        let guard = UnitGuard {
            runtime: self.runtime.clone(),
            unit: Some(unit.clone()),
        };

        if !self.registry.mark_running(id) {
            guard.remove().await;
            return killed(capture);
        }

        info!(
            "Executing {} ({}) in {} with timeout {:?}",
            id, request.language.id, unit.name, request.timeout
        );

        let started = Instant::now();
        if let Err(e) = self.runtime.start(&unit).await {
            guard.remove().await;
            return failed(capture, e.to_string());
        }

        let outcome = tokio::select! {
            exit = self.runtime.wait(&unit) => match exit {
                Ok(exit) => Outcome::Exited(exit),
                Err(e) => Outcome::WaitFailed(e.to_string()),
            },
            _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
            _ = token.cancelled() => Outcome::Cancelled,
        };
        capture.duration = started.elapsed();

        // From here on a late cancel has nothing to stop and is refused
        let settled = !matches!(outcome, Outcome::Cancelled) && self.registry.settle(id);

        match &outcome {
            Outcome::Exited(_) if !settled => {
                info!("Execution {} cancelled as its unit exited", id);
                capture.status = ExecutionStatus::Killed;
            }
            Outcome::Exited(exit) => {
                debug!("Unit {} exited with {}", unit.name, exit.exit_code);
                capture.exit_code = Some(exit.exit_code);
                capture.oom_killed = exit.oom_killed;
                capture.status = if exit.exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
            }
            Outcome::WaitFailed(message) => {
                self.terminate(&unit).await;
                capture.status = ExecutionStatus::Failed;
                capture.infrastructure_error = Some(message.clone());
            }
            Outcome::TimedOut => {
                warn!("Execution {} timed out after {:?}", id, request.timeout);
                self.terminate(&unit).await;
                capture.status = ExecutionStatus::TimedOut;
            }
            Outcome::Cancelled => {
                info!("Execution {} cancelled", id);
                self.terminate(&unit).await;
                capture.status = ExecutionStatus::Killed;
            }
        }

        match self.runtime.logs(&unit, self.policy.max_output_bytes).await {
            Ok(logs) => apply_logs(&mut capture, logs),
            Err(e) if settled && matches!(outcome, Outcome::Exited(_)) => {
                capture.status = ExecutionStatus::Failed;
                capture.infrastructure_error = Some(format!("Failed to collect output: {}", e));
            }
            Err(e) => warn!("Failed to collect output of {}: {}", unit.name, e),
        }

        guard.remove().await;
        capture
    }

    /// SIGTERM, bounded grace period, then SIGKILL
    async fn terminate(&self, unit: &UnitHandle) {
        if let Err(e) = self.runtime.signal(unit, UnitSignal::Terminate).await {
            warn!("Failed to terminate {}: {}", unit.name, e);
        }
        let stopped = tokio::time::timeout(self.policy.grace_period, self.runtime.wait(unit)).await;
        if matches!(stopped, Ok(Ok(_))) {
            return;
        }

        debug!("Unit {} ignored SIGTERM, killing", unit.name);
        if let Err(e) = self.runtime.signal(unit, UnitSignal::Kill).await {
            warn!("Failed to kill {}: {}", unit.name, e);
        }
        if tokio::time::timeout(KILL_WAIT, self.runtime.wait(unit))
            .await
            .is_err()
        {
            warn!("Unit {} still present after SIGKILL; removal will force it", unit.name);
        }
    }
}

/// `<prefix>_<language>_<execution id>`
pub fn unit_name(prefix: &str, language: &str, id: &ExecutionId) -> String {
    format!("{}_{}_{}", prefix, language, id)
}

fn base_capture(request: &ValidatedRequest) -> RawCapture {
    RawCapture {
        execution_id: request.execution_id.clone(),
        language: request.language.id.clone(),
        session: request.workspace.key().to_string(),
        file_name: request.file_name.clone(),
        status: ExecutionStatus::Failed,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        duration: Duration::ZERO,
        oom_killed: false,
        infrastructure_error: None,
        verify: request.verify,
    }
}

fn apply_logs(capture: &mut RawCapture, logs: UnitLogs) {
    capture.stdout = logs.stdout;
    capture.stderr = logs.stderr;
    capture.stdout_truncated = logs.stdout_truncated;
    capture.stderr_truncated = logs.stderr_truncated;
}
