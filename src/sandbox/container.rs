//! Docker container runtime
//!
//! Ephemeral, hardened containers: no network, every capability dropped,
//! read-only root with a small tmpfs `/tmp`, and hard memory/CPU/pid limits.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::runtime::{
    is_past_deadline, CappedOutput, ContainerRuntime, UnitExit, UnitHandle, UnitLogs, UnitSignal,
    UnitSpec,
};
use crate::error::{Error, Result};

/// Docker-backed runtime
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (socket or DOCKER_HOST) and ping
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

        let runtime = DockerRuntime { docker };
        runtime.ping().await?;

        info!("Container runtime connected to Docker");
        Ok(runtime)
    }

    fn container_config(spec: &UnitSpec) -> Config<String> {
        let host_config = HostConfig {
            binds: Some(spec.mounts.iter().map(|m| m.to_bind_string()).collect()),
            memory: Some(spec.memory_bytes),
            // Equal to memory: no swap on top of the ceiling
            memory_swap: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,exec,nosuid,nodev,size={}", spec.scratch_bytes),
            )])),
            // Removed explicitly after the logs are read
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Container(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }
}

/// Docker answers 404 for a unit that is already gone and 409 for a kill
/// of a unit that is no longer running
fn is_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str, pull: bool, timeout: Duration) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !pull {
            return Err(Error::Container(format!(
                "Image {} is not present locally and pulling is disabled",
                image
            )));
        }

        tokio::time::timeout(timeout, self.pull_image(image))
            .await
            .map_err(|_| {
                Error::Container(format!("Pulling image {} exceeded {:?}", image, timeout))
            })?
    }

    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }
        debug!("Created container: {} ({})", spec.name, response.id);

        Ok(UnitHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, unit: &UnitHandle) -> Result<()> {
        self.docker
            .start_container(&unit.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))
    }

    async fn wait(&self, unit: &UnitHandle) -> Result<UnitExit> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&unit.id, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(Error::Container(format!("Wait failed: {}", e))),
            None => return Err(Error::Container("Container wait stream ended".to_string())),
        };

        let oom_killed = match self
            .docker
            .inspect_container(&unit.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", unit.name, e);
                false
            }
        };

        Ok(UnitExit {
            exit_code,
            oom_killed,
        })
    }

    async fn signal(&self, unit: &UnitHandle, signal: UnitSignal) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.as_str(),
        };
        match self.docker.kill_container(&unit.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::Container(format!(
                "Failed to send {} to {}: {}",
                signal.as_str(),
                unit.name,
                e
            ))),
        }
    }

    async fn logs(&self, unit: &UnitHandle, limit: usize) -> Result<UnitLogs> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(&unit.id, Some(options));

        let mut stdout = CappedOutput::new(limit);
        let mut stderr = CappedOutput::new(limit);

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                Err(e) => {
                    warn!("Error reading logs: {}", e);
                    break;
                }
                _ => {}
            }
            // Both streams full: the rest is discarded anyway
            if stdout.truncated() && stderr.truncated() {
                break;
            }
        }

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
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(&unit.id, Some(options)).await {
            Ok(()) => {
                debug!("Removed container: {}", unit.name);
                Ok(())
            }
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(Error::Container(format!(
                "Failed to remove container {}: {}",
                unit.name, e
            ))),
        }
    }

    async fn reap(&self, label: &str) -> Result<usize> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to list containers: {}", e)))?;

        let now = chrono::Utc::now().timestamp();
        let mut reaped = 0;
        for container in containers {
            // Units of other live engines keep running until their deadline
            if !container
                .labels
                .as_ref()
                .map_or(true, |labels| is_past_deadline(labels, now))
            {
                continue;
            }
            let Some(id) = container.id else { continue };
            let name = container
                .names
                .and_then(|names| names.into_iter().next())
                .unwrap_or_else(|| id.clone());
            let unit = UnitHandle {
                id,
                name: name.trim_start_matches('/').to_string(),
            };
            match self.remove(&unit).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!("Failed to reap {}: {}", unit.name, e),
            }
        }

        if reaped > 0 {
            info!("Reaped {} orphaned container(s)", reaped);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::BindMount;
    use std::path::PathBuf;

    fn spec() -> UnitSpec {
        UnitSpec {
            name: "sandrun_python_abc".to_string(),
            image: "python:3.11-slim".to_string(),
            cmd: vec!["python".to_string(), "-u".to_string(), "main.py".to_string()],
            env: vec!["PYTHONDONTWRITEBYTECODE=1".to_string()],
            working_dir: "/code".to_string(),
            mounts: vec![
                BindMount {
                    host: PathBuf::from("/ws/s/code"),
                    container: "/code".to_string(),
                    read_only: true,
                },
                BindMount {
                    host: PathBuf::from("/ws/s/output"),
                    container: "/output".to_string(),
                    read_only: false,
                },
            ],
            memory_bytes: 256 * 1024 * 1024,
            nano_cpus: 500_000_000,
            pids_limit: 50,
            scratch_bytes: 64 * 1024 * 1024,
            user: None,
            labels: HashMap::from([("sandrun.managed".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_container_config_is_hardened() {
        let config = DockerRuntime::container_config(&spec());
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.working_dir.as_deref(), Some("/code"));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.pids_limit, Some(50));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges".to_string()])
        );
        assert_eq!(
            host.binds.unwrap(),
            vec!["/ws/s/code:/code:ro", "/ws/s/output:/output:rw"]
        );
        assert!(host.tmpfs.unwrap()["/tmp"].ends_with("size=67108864"));
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_docker_ping() {
        let runtime = DockerRuntime::connect().await.unwrap();
        runtime.ping().await.unwrap();
        assert_eq!(runtime.reap("sandrun.test-nothing").await.unwrap(), 0);
    }
}
