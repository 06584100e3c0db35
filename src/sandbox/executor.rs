//! Execution request, handle and result types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::verify::ConstantTag;

/// Session used when a request does not name one
pub const DEFAULT_SESSION: &str = "default";

/// Opaque, unique identifier of one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        ExecutionId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for file and unit names
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        ExecutionId(id)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        ExecutionId(id.to_string())
    }
}

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    TimedOut,
    Failed,
    Killed,
}

impl ExecutionStatus {
    /// Terminal states are final; a handle reaches exactly one of them
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::TimedOut => write!(f, "timed_out"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Parse or compile-time failure of the submitted program
    SyntaxError,
    /// The submitted program raised or crashed at runtime
    RuntimeException,
    /// The runtime killed the unit for exceeding its memory/CPU ceiling
    ResourceViolation,
    /// Engine-side failure not attributable to the program
    InfrastructureError,
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClassification::SyntaxError => write!(f, "syntax_error"),
            ErrorClassification::RuntimeException => write!(f, "runtime_exception"),
            ErrorClassification::ResourceViolation => write!(f, "resource_violation"),
            ErrorClassification::InfrastructureError => write!(f, "infrastructure_error"),
        }
    }
}

/// Request to execute code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Language id, resolved against the language registry
    pub language: String,
    /// The code to execute
    pub code: String,
    /// Session key selecting the workspace
    #[serde(default = "default_session")]
    pub session: String,
    /// File name within `code/`; generated when absent
    #[serde(default)]
    pub file_name: Option<String>,
    /// Timeout in seconds; policy default when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Memory ceiling (e.g. "128m"); may only narrow the policy
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// CPU share in cores; may only narrow the policy
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    /// Known constant the program is expected to compute
    #[serde(default)]
    pub verify: Option<ConstantTag>,
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

impl ExecutionRequest {
    /// Create a new execution request
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        ExecutionRequest {
            language: language.into(),
            code: code.into(),
            session: default_session(),
            file_name: None,
            timeout_secs: None,
            memory_limit: None,
            cpu_limit: None,
            verify: None,
        }
    }

    /// Set the session key
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Set the file name
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Set timeout
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set memory ceiling
    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Set CPU share
    pub fn with_cpu_limit(mut self, cpus: f64) -> Self {
        self.cpu_limit = Some(cpus);
        self
    }

    /// Tag the request as computing a known constant
    pub fn with_verify(mut self, constant: ConstantTag) -> Self {
        self.verify = Some(constant);
        self
    }
}

/// Outcome of the verification pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub constant: ConstantTag,
    pub expected: f64,
    /// Closest numeric token found in stdout
    pub actual: Option<f64>,
    pub within_tolerance: bool,
    pub tolerance: f64,
}

/// Raw capture handed from the driver to the analyzer
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub execution_id: ExecutionId,
    pub language: String,
    pub session: String,
    pub file_name: String,
    /// Status decided by the driver
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    /// The runtime reported an out-of-memory kill
    pub oom_killed: bool,
    /// Set when the engine, not the program, caused the failure
    pub infrastructure_error: Option<String>,
    pub verify: Option<ConstantTag>,
}

/// Result of code execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub language: String,
    /// Normalized session key
    pub session: String,
    pub file_name: String,
    pub status: ExecutionStatus,
    /// Absent for timed out and killed executions
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_millis: u64,
    pub error_classification: Option<ErrorClassification>,
    /// Extracted error line, or the infrastructure failure message
    pub error_summary: Option<String>,
    pub verification: Option<Verification>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Build a result straight from the capture, with no classification
    ///
    /// Used when analysis itself fails so the execution record is not lost.
    pub fn from_raw(raw: RawCapture) -> Self {
        ExecutionResult {
            execution_id: raw.execution_id,
            language: raw.language,
            session: raw.session,
            file_name: raw.file_name,
            status: raw.status,
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            duration_millis: raw.duration.as_millis() as u64,
            error_classification: None,
            error_summary: raw.infrastructure_error,
            verification: None,
            stdout_truncated: raw.stdout_truncated,
            stderr_truncated: raw.stderr_truncated,
        }
    }

    /// Whether execution was successful
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.error_classification.is_none()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_millis)
    }

    /// Get combined output
    pub fn combined_output(&self) -> String {
        let mut output = String::new();
        if !self.stdout.is_empty() {
            output.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&self.stderr);
        }
        output
    }
}
