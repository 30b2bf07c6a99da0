use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Commands are given this long before the runtime is declared wedged.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container runtime failed: {0}")]
    Failed(String),
    #[error("container runtime timed out after {0:?}")]
    Timeout(Duration),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a runtime failure; "no such container" and HTTP 404 bodies
    /// both mean the container is gone.
    fn classify(subject: &str, stderr: &str) -> Self {
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("no such container") || lowered.contains("404") {
            Self::NotFound(subject.to_string())
        } else {
            Self::Failed(stderr.trim().to_string())
        }
    }
}

/// Parameters for one managed container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Carries the original stdio command/args for the in-container runner.
    pub env: HashMap<String, String>,
    /// Internal bridge network to attach; `None` uses host-port publishing.
    pub network: Option<String>,
    pub internal_port: u16,
    /// Host port to publish `internal_port` on, for the host-port deployment.
    pub host_port: Option<u16>,
}

/// Snapshot of one container as the runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub running: bool,
    pub restart_count: u32,
}

/// External container runtime seam (`docker`, `podman`, or a fake in tests).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn inspect(&self, id_or_name: &str) -> Result<ContainerState, RuntimeError>;

    async fn stop(&self, id_or_name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id_or_name: &str) -> Result<(), RuntimeError>;

    /// Last `tail` combined stdout/stderr lines, optionally timestamped.
    async fn logs(
        &self,
        id_or_name: &str,
        tail: usize,
        timestamps: bool,
    ) -> Result<Vec<String>, RuntimeError>;
}

/// Container runtime backed by the `docker` CLI.
///
/// Arguments are always built programmatically; nothing passes through a
/// shell.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            binary: "docker".to_string(),
        })
    }

    pub fn with_binary(binary: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            binary: binary.into(),
        })
    }

    async fn exec(&self, subject: &str, args: &[String]) -> Result<String, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(command = %format!("{} {}", self.binary, args.join(" ")), "container runtime call");

        let child = cmd
            .spawn()
            .map_err(|error| RuntimeError::Failed(format!("failed to spawn {}: {error}", self.binary)))?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| RuntimeError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|error| RuntimeError::Failed(error.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RuntimeError::classify(
                subject,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(host_port) = spec.host_port {
            args.push("-p".to_string());
            args.push(format!("{host_port}:{}", spec.internal_port));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let stdout = self.exec(&spec.name, &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn inspect(&self, id_or_name: &str) -> Result<ContainerState, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}} {{.State.Running}} {{.RestartCount}}".to_string(),
            id_or_name.to_string(),
        ];
        let stdout = self.exec(id_or_name, &args).await?;
        let mut fields = stdout.split_whitespace();
        let id = fields
            .next()
            .ok_or_else(|| RuntimeError::Failed("empty inspect output".to_string()))?
            .to_string();
        let running = fields.next() == Some("true");
        let restart_count = fields
            .next()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        Ok(ContainerState {
            id,
            running,
            restart_count,
        })
    }

    async fn stop(&self, id_or_name: &str) -> Result<(), RuntimeError> {
        self.exec(id_or_name, &["stop".to_string(), id_or_name.to_string()])
            .await
            .map(|_| ())
    }

    async fn remove(&self, id_or_name: &str) -> Result<(), RuntimeError> {
        self.exec(
            id_or_name,
            &["rm".to_string(), "-f".to_string(), id_or_name.to_string()],
        )
        .await
        .map(|_| ())
    }

    async fn logs(
        &self,
        id_or_name: &str,
        tail: usize,
        timestamps: bool,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
        ];
        if timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(id_or_name.to_string());

        let stdout = self.exec(id_or_name, &args).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_container_classifies_as_not_found() {
        let error = RuntimeError::classify("c1", "Error: No such container: c1");
        assert!(error.is_not_found());

        let error = RuntimeError::classify("c1", "server returned 404 for object c1");
        assert!(error.is_not_found());

        let error = RuntimeError::classify("c1", "permission denied");
        assert!(!error.is_not_found());
    }
}
