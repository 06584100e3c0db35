//! Container runtime boundary
//!
//! The driver only talks to this trait, so the Docker implementation can be
//! swapped for another runtime (or a scripted one in tests).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Label present on every unit this engine creates
pub const LABEL_MANAGED: &str = "sandrun.managed";
/// Label carrying the execution id
pub const LABEL_EXECUTION: &str = "sandrun.execution";
/// Label carrying the normalized session key
pub const LABEL_SESSION: &str = "sandrun.session";
/// Label carrying the unix time by which the owning engine is done with the unit
pub const LABEL_DEADLINE: &str = "sandrun.deadline";

/// Whether a unit is past its deadline, so no live engine can still own it
///
/// Units without a readable deadline count as expired.
pub fn is_past_deadline(labels: &HashMap<String, String>, now: i64) -> bool {
    labels
        .get(LABEL_DEADLINE)
        .and_then(|deadline| deadline.parse::<i64>().ok())
        .map_or(true, |deadline| deadline <= now)
}

/// Host directory mounted into a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl BindMount {
    /// Docker `-v` style bind string
    pub fn to_bind_string(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything needed to create one execution unit
///
/// The hardening flags (no network, no capabilities, read-only root,
/// no-new-privileges) are not optional and so are not fields here.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<BindMount>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    /// Size of the ephemeral `/tmp`
    pub scratch_bytes: i64,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
}

/// A created unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    pub id: String,
    pub name: String,
}

/// How a unit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitExit {
    pub exit_code: i64,
    pub oom_killed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSignal {
    Terminate,
    Kill,
}

impl UnitSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitSignal::Terminate => "SIGTERM",
            UnitSignal::Kill => "SIGKILL",
        }
    }
}

/// Captured output of a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitLogs {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Byte buffer that stops growing at a limit and remembers it did
#[derive(Debug)]
pub struct CappedOutput {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedOutput {
    pub fn new(limit: usize) -> Self {
        CappedOutput {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8; a multi-byte char cut at the limit becomes U+FFFD
    pub fn into_string(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.data).into_owned(), self.truncated)
    }
}

/// Operations the driver needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name for logs
    fn name(&self) -> &str;

    /// Check that the runtime is reachable
    async fn ping(&self) -> Result<()>;

    /// Make sure an image is present locally, pulling it when allowed
    async fn ensure_image(&self, image: &str, pull: bool, timeout: Duration) -> Result<()>;

    /// Create a unit without starting it
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle>;

    async fn start(&self, unit: &UnitHandle) -> Result<()>;

    /// Wait until the unit stops. Dropping the future abandons the wait
    /// without affecting the unit.
    async fn wait(&self, unit: &UnitHandle) -> Result<UnitExit>;

    async fn signal(&self, unit: &UnitHandle, signal: UnitSignal) -> Result<()>;

    /// Collect stdout and stderr, each capped at `limit` bytes
    async fn logs(&self, unit: &UnitHandle, limit: usize) -> Result<UnitLogs>;

    /// Force-remove a unit; removing an already removed unit is not an error
    async fn remove(&self, unit: &UnitHandle) -> Result<()>;

    /// Remove every unit carrying `label` that is past its deadline,
    /// returning how many were removed
    async fn reap(&self, label: &str) -> Result<usize>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory runtime
    //!
    //! Each unit's behavior is chosen from its source text, read through the
    //! `/code` bind mount the same way a real unit would see it.

    use super::*;
    use crate::error::Error;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailAt {
        Create,
        Start,
        Wait,
    }

    /// Behavior of one fake unit
    #[derive(Debug, Clone)]
    pub struct Script {
        pub exit_code: i64,
        pub stdout: String,
        pub stderr: String,
        /// `None` runs until signaled
        pub run_for: Option<Duration>,
        pub ignore_terminate: bool,
        pub oom: bool,
        pub output_file: Option<(String, String)>,
        pub fail_at: Option<FailAt>,
        pub logs_delay: Option<Duration>,
    }

    impl Script {
        pub fn exit(code: i64) -> Self {
            Script {
                exit_code: code,
                stdout: String::new(),
                stderr: String::new(),
                run_for: Some(Duration::ZERO),
                ignore_terminate: false,
                oom: false,
                output_file: None,
                fail_at: None,
                logs_delay: None,
            }
        }

        pub fn hang() -> Self {
            Script {
                run_for: None,
                ..Script::exit(0)
            }
        }

        pub fn oom() -> Self {
            Script {
                oom: true,
                ..Script::exit(137)
            }
        }

        pub fn failing(at: FailAt) -> Self {
            Script {
                fail_at: Some(at),
                ..Script::exit(0)
            }
        }

        pub fn stdout(mut self, text: impl Into<String>) -> Self {
            self.stdout = text.into();
            self
        }

        pub fn stderr(mut self, text: impl Into<String>) -> Self {
            self.stderr = text.into();
            self
        }

        pub fn running_for(mut self, duration: Duration) -> Self {
            self.run_for = Some(duration);
            self
        }

        pub fn ignoring_terminate(mut self) -> Self {
            self.ignore_terminate = true;
            self
        }

        pub fn slow_logs(mut self, delay: Duration) -> Self {
            self.logs_delay = Some(delay);
            self
        }

        pub fn writes_output(mut self, name: &str, content: &str) -> Self {
            self.output_file = Some((name.to_string(), content.to_string()));
            self
        }
    }

    type Behavior = dyn Fn(&str) -> Script + Send + Sync;

    struct Unit {
        spec: UnitSpec,
        script: Script,
        started_at: Option<Instant>,
        stopped: watch::Sender<Option<i64>>,
        signals: Vec<UnitSignal>,
        removed: bool,
    }

    #[derive(Default)]
    struct State {
        units: HashMap<String, Unit>,
        missing_images: HashSet<String>,
        pulled: Vec<String>,
        unavailable: bool,
    }

    pub struct FakeRuntime {
        behavior: Box<Behavior>,
        state: Arc<Mutex<State>>,
    }

    impl FakeRuntime {
        pub fn new(behavior: impl Fn(&str) -> Script + Send + Sync + 'static) -> Self {
            FakeRuntime {
                behavior: Box::new(behavior),
                state: Arc::new(Mutex::new(State::default())),
            }
        }

        /// Every unit prints its own source and exits 0
        pub fn echo() -> Self {
            FakeRuntime::new(|source| Script::exit(0).stdout(source))
        }

        /// Image is absent and cannot be pulled
        pub fn with_unpullable_image(self, image: &str) -> Self {
            self.lock().missing_images.insert(image.to_string());
            self
        }

        pub fn unavailable(self) -> Self {
            self.lock().unavailable = true;
            self
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        pub fn created(&self) -> usize {
            self.lock().units.len()
        }

        /// Units created but not removed
        pub fn live_units(&self) -> Vec<String> {
            self.lock()
                .units
                .iter()
                .filter(|(_, u)| !u.removed)
                .map(|(name, _)| name.clone())
                .collect()
        }

        pub fn signals(&self, name: &str) -> Vec<UnitSignal> {
            self.lock()
                .units
                .get(name)
                .map(|u| u.signals.clone())
                .unwrap_or_default()
        }

        pub fn spec(&self, name: &str) -> Option<UnitSpec> {
            self.lock().units.get(name).map(|u| u.spec.clone())
        }

        pub fn pulled(&self) -> Vec<String> {
            self.lock().pulled.clone()
        }

        fn read_source(spec: &UnitSpec) -> String {
            let Some(code) = spec.mounts.iter().find(|m| m.container == "/code") else {
                return String::new();
            };
            spec.cmd
                .iter()
                .rev()
                .flat_map(|arg| arg.split_whitespace())
                .find_map(|token| std::fs::read_to_string(code.host.join(token)).ok())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &str {
            "fake"
        }

        async fn ping(&self) -> Result<()> {
            if self.lock().unavailable {
                return Err(Error::Container("runtime unavailable".to_string()));
            }
            Ok(())
        }

        async fn ensure_image(&self, image: &str, pull: bool, _timeout: Duration) -> Result<()> {
            let mut state = self.lock();
            if state.unavailable {
                return Err(Error::Container("runtime unavailable".to_string()));
            }
            if state.missing_images.contains(image) {
                return Err(Error::Container(format!("Failed to pull image {}", image)));
            }
            if pull {
                state.pulled.push(image.to_string());
            }
            Ok(())
        }

        async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle> {
            let script = (self.behavior)(&Self::read_source(spec));
            if script.fail_at == Some(FailAt::Create) {
                return Err(Error::Container("create failed".to_string()));
            }

            let mut state = self.lock();
            if state.units.contains_key(&spec.name) {
                return Err(Error::Container(format!("name {} already in use", spec.name)));
            }
            let (stopped, _) = watch::channel(None);
            state.units.insert(
                spec.name.clone(),
                Unit {
                    spec: spec.clone(),
                    script,
                    started_at: None,
                    stopped,
                    signals: Vec::new(),
                    removed: false,
                },
            );
            Ok(UnitHandle {
                id: format!("fake-{}", spec.name),
                name: spec.name.clone(),
            })
        }

        async fn start(&self, unit: &UnitHandle) -> Result<()> {
            let mut state = self.lock();
            let entry = state
                .units
                .get_mut(&unit.name)
                .ok_or_else(|| Error::Container(format!("no such unit {}", unit.name)))?;
            if entry.script.fail_at == Some(FailAt::Start) {
                return Err(Error::Container("start failed".to_string()));
            }
            if let Some((name, content)) = &entry.script.output_file {
                if let Some(output) = entry.spec.mounts.iter().find(|m| m.container == "/output") {
                    std::fs::write(output.host.join(name), content)?;
                }
            }
            entry.started_at = Some(Instant::now());
            Ok(())
        }

        async fn wait(&self, unit: &UnitHandle) -> Result<UnitExit> {
            let (script, started_at, mut stopped) = {
                let state = self.lock();
                let entry = state
                    .units
                    .get(&unit.name)
                    .ok_or_else(|| Error::Container(format!("no such unit {}", unit.name)))?;
                (entry.script.clone(), entry.started_at, entry.stopped.subscribe())
            };
            if script.fail_at == Some(FailAt::Wait) {
                return Err(Error::Container("wait failed".to_string()));
            }

            let natural = async {
                match script.run_for {
                    Some(run_for) => {
                        let started = started_at.unwrap_or_else(Instant::now);
                        tokio::time::sleep_until(started + run_for).await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = natural => Ok(UnitExit { exit_code: script.exit_code, oom_killed: script.oom }),
                code = stopped.wait_for(|code| code.is_some()) => {
                    let code: Option<i64> =
                        *code.map_err(|_| Error::Container("unit vanished".to_string()))?;
                    Ok(UnitExit { exit_code: code.unwrap_or(137), oom_killed: false })
                }
            }
        }

        async fn signal(&self, unit: &UnitHandle, signal: UnitSignal) -> Result<()> {
            let mut state = self.lock();
            let entry = state
                .units
                .get_mut(&unit.name)
                .ok_or_else(|| Error::Container(format!("no such unit {}", unit.name)))?;
            entry.signals.push(signal);
            let code = match signal {
                UnitSignal::Terminate if entry.script.ignore_terminate => None,
                UnitSignal::Terminate => Some(143),
                UnitSignal::Kill => Some(137),
            };
            if let Some(code) = code {
                entry.stopped.send_replace(Some(code));
            }
            Ok(())
        }

        async fn logs(&self, unit: &UnitHandle, limit: usize) -> Result<UnitLogs> {
            let delay = self.lock().units.get(&unit.name).and_then(|u| u.script.logs_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let state = self.lock();
            let entry = state
                .units
                .get(&unit.name)
                .ok_or_else(|| Error::Container(format!("no such unit {}", unit.name)))?;

            let mut stdout = CappedOutput::new(limit);
            stdout.push(entry.script.stdout.as_bytes());
            let mut stderr = CappedOutput::new(limit);
            stderr.push(entry.script.stderr.as_bytes());
            let (stdout, stdout_truncated) = stdout.into_string();
            let (stderr, stderr_truncated) = stderr.into_string();
            Ok(UnitLogs {
                stdout,
                stderr,
                stdout_truncated,
                stderr_truncated,
            })
        }

        async fn remove(&self, unit: &UnitHandle) -> Result<()> {
            if let Some(entry) = self.lock().units.get_mut(&unit.name) {
                entry.removed = true;
                entry.stopped.send_replace(Some(137));
            }
            Ok(())
        }

        async fn reap(&self, label: &str) -> Result<usize> {
            let now = chrono::Utc::now().timestamp();
            let mut state = self.lock();
            let mut reaped = 0;
            for entry in state.units.values_mut() {
                if !entry.removed
                    && entry.spec.labels.contains_key(label)
                    && is_past_deadline(&entry.spec.labels, now)
                {
                    entry.removed = true;
                    entry.stopped.send_replace(Some(137));
                    reaped += 1;
                }
            }
            Ok(reaped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_output() {
        let mut out = CappedOutput::new(5);
        out.push(b"abc");
        assert!(!out.truncated());
        out.push(b"defgh");
        assert!(out.truncated());
        let (text, truncated) = out.into_string();
        assert_eq!(text, "abcde");
        assert!(truncated);
    }

    #[test]
    fn test_bind_string() {
        let mount = BindMount {
            host: PathBuf::from("/srv/ws/team/code"),
            container: "/code".to_string(),
            read_only: true,
        };
        assert_eq!(mount.to_bind_string(), "/srv/ws/team/code:/code:ro");
    }

    #[test]
    fn test_deadline() {
        let labels = |deadline: &str| {
            HashMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_DEADLINE.to_string(), deadline.to_string()),
            ])
        };
        assert!(is_past_deadline(&labels("100"), 100));
        assert!(is_past_deadline(&labels("100"), 250));
        assert!(!is_past_deadline(&labels("300"), 250));
        assert!(is_past_deadline(&labels("soon"), 250));
        assert!(is_past_deadline(&HashMap::new(), 250));
    }
}
