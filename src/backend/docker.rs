use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionOutcome, OutcomeKind, RunSpec, StartAck};
use crate::error::{BatchError, Result};

/// Runs each instance in a detached Docker container.
///
/// `start` launches `docker run -d` with the definition's resource limits
/// and environment bindings; a background task waits on the container and
/// reports the outcome. Placement identifiers are opaque to the control
/// plane and are attached as labels for the surrounding infrastructure to
/// act on.
pub struct DockerBackend {
    outcome_tx: mpsc::Sender<ExecutionOutcome>,
    containers: Arc<Mutex<HashMap<Uuid, ContainerHandle>>>,
}

struct ContainerHandle {
    container_id: String,
    cancel_requested: bool,
}

impl DockerBackend {
    pub fn new(outcome_tx: mpsc::Sender<ExecutionOutcome>) -> Self {
        Self {
            outcome_tx,
            containers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        args.push(format!("--cpus={}", spec.resources.vcpus));
        args.push(format!("--memory={}m", spec.resources.memory_mib));
        if spec.resources.gpus > 0 {
            args.push(format!("--gpus={}", spec.resources.gpus));
        }

        for (name, value) in &spec.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", name, value));
        }

        for subnet in &spec.placement.subnet_ids {
            args.push(format!("--label=subnet={}", subnet));
        }
        for sg in &spec.placement.security_group_ids {
            args.push(format!("--label=security-group={}", sg));
        }
        args.push(format!("--label=instance-id={}", spec.instance_id));

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Wait for the container to exit and report the outcome.
    async fn watch(
        instance_id: Uuid,
        container_id: String,
        containers: Arc<Mutex<HashMap<Uuid, ContainerHandle>>>,
        outcome_tx: mpsc::Sender<ExecutionOutcome>,
    ) {
        let wait = Command::new("docker")
            .args(["wait", container_id.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let cancelled = {
            let mut held = containers.lock().await;
            held.remove(&instance_id)
                .map(|h| h.cancel_requested)
                .unwrap_or(false)
        };

        let outcome = match wait {
            Ok(output) if output.status.success() => {
                let exit_code = String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .parse::<i32>()
                    .ok();
                let kind = if cancelled {
                    OutcomeKind::Cancelled
                } else if exit_code == Some(0) {
                    OutcomeKind::Succeeded
                } else {
                    OutcomeKind::Failed
                };
                ExecutionOutcome {
                    instance_id,
                    kind,
                    exit_code,
                    message: None,
                }
            }
            Ok(output) => ExecutionOutcome {
                instance_id,
                kind: if cancelled {
                    OutcomeKind::Cancelled
                } else {
                    OutcomeKind::Failed
                },
                exit_code: None,
                message: Some(String::from_utf8_lossy(&output.stderr).to_string()),
            },
            Err(e) => ExecutionOutcome {
                instance_id,
                kind: OutcomeKind::Failed,
                exit_code: None,
                message: Some(e.to_string()),
            },
        };

        tracing::info!(
            instance_id = %instance_id,
            container_id = %container_id,
            exit_code = ?outcome.exit_code,
            "container exited"
        );
        let _ = outcome_tx.send(outcome).await;
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn start(&self, spec: RunSpec) -> Result<StartAck> {
        let instance_id = spec.instance_id;
        let args = Self::run_args(&spec);
        tracing::info!(
            instance_id = %instance_id,
            image = %spec.image,
            "starting container"
        );

        let output = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BatchError::Backend(e.to_string()))?;

        if !output.status.success() {
            return Err(BatchError::Backend(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.containers.lock().await.insert(
            instance_id,
            ContainerHandle {
                container_id: container_id.clone(),
                cancel_requested: false,
            },
        );

        tokio::spawn(Self::watch(
            instance_id,
            container_id.clone(),
            self.containers.clone(),
            self.outcome_tx.clone(),
        ));

        Ok(StartAck {
            instance_id,
            runtime_ref: container_id,
        })
    }

    async fn terminate(&self, instance_id: Uuid) -> Result<()> {
        let container_id = {
            let mut held = self.containers.lock().await;
            match held.get_mut(&instance_id) {
                Some(handle) => {
                    handle.cancel_requested = true;
                    handle.container_id.clone()
                }
                None => return Ok(()), // already gone
            }
        };

        tracing::info!(
            instance_id = %instance_id,
            container_id = %container_id,
            "terminating container"
        );
        let output = Command::new("docker")
            .args(["stop", "--time", "10", container_id.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BatchError::Backend(e.to_string()))?;

        if !output.status.success() {
            return Err(BatchError::Backend(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }
}
