//! Test harness for in-process control plane integration tests.
//!
//! Spins up a full control plane over the simulated backend and provides
//! polling helpers for instance state assertions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batch_lite::backend::{ExecutionBackend, SimBackend};
use batch_lite::config::ClusterConfig;
use batch_lite::plane::{ControlPlane, PlaneHandle};
use batch_lite::queue::{InstanceState, JobInstance};

/// Handle to a running in-process control plane.
pub struct TestPlane {
    pub handle: PlaneHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestPlane {
    /// Build and start a control plane from TOML over the sim backend.
    pub async fn start(toml: &str) -> Self {
        let config = ClusterConfig::from_toml(toml).expect("valid test config");
        let (outcome_tx, outcome_rx) = ControlPlane::outcome_channel();
        let backend: Arc<dyn ExecutionBackend> = Arc::new(SimBackend::new(outcome_tx));
        let plane = ControlPlane::new(&config, backend, outcome_rx).expect("plane builds");
        let handle = plane.handle();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(plane.run(shutdown.clone()));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    /// Poll until the instance reaches `state`, panicking on timeout or on
    /// an unexpected terminal state.
    #[allow(dead_code)]
    pub async fn await_state(
        &self,
        instance_id: Uuid,
        state: InstanceState,
        timeout: Duration,
    ) -> JobInstance {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(instance) = self.handle.instance(instance_id).await {
                if instance.state == state {
                    return instance;
                }
                if instance.is_terminal() {
                    panic!(
                        "instance {} reached terminal {} while waiting for {}",
                        instance_id, instance.state, state
                    );
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} to reach {}", instance_id, state);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the instance is terminal.
    pub async fn await_terminal(&self, instance_id: Uuid, timeout: Duration) -> JobInstance {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(instance) = self.handle.instance(instance_id).await {
                if instance.is_terminal() {
                    return instance;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {} to become terminal", instance_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Current state snapshot, panicking if the instance is unknown.
    #[allow(dead_code)]
    pub async fn state_of(&self, instance_id: Uuid) -> InstanceState {
        self.handle
            .instance(instance_id)
            .await
            .expect("instance exists")
            .state
    }
}

impl Drop for TestPlane {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

/// A single-environment cluster with one queue (`main`, priority 100) and
/// definitions covering the sim backend's directives. Fast loop settings
/// keep tests snappy.
#[allow(dead_code)]
pub fn sim_cluster(max_vcpus: u32) -> String {
    format!(
        r#"
[plane]
dispatch_interval_ms = 20
confirm_timeout_ms = 200
deadline_check_interval_ms = 50
poll_min_ms = 20
poll_max_ms = 60

[[compute_environment]]
name = "env"
strategy = "best-fit-progressive"
min_vcpus = 0
max_vcpus = {max_vcpus}

[[compute_environment.unit_type]]
name = "unit-4"
vcpus = 4
memory_mib = 16384
gpus = 0

[[job_definition]]
name = "quick"
image = "sim"
command = ["sleep:50"]
timeout_secs = 60
[job_definition.resources]
vcpus = 1.0
memory_mib = 256

[[job_definition]]
name = "heavy"
image = "sim"
command = ["sleep:300"]
timeout_secs = 60
[job_definition.resources]
vcpus = 4.0
memory_mib = 1024

[[job_definition]]
name = "stuck"
image = "sim"
command = ["hang"]
timeout_secs = 7200
[job_definition.resources]
vcpus = 4.0
memory_mib = 1024

[[job_definition]]
name = "brief-window"
image = "sim"
command = ["hang"]
timeout_secs = 1
[job_definition.resources]
vcpus = 1.0
memory_mib = 256

[[job_definition]]
name = "failing"
image = "sim"
command = ["fail:3"]
timeout_secs = 60
[job_definition.resources]
vcpus = 1.0
memory_mib = 256

[[job_definition]]
name = "staller"
image = "sim"
command = ["stall"]
timeout_secs = 60
[job_definition.resources]
vcpus = 1.0
memory_mib = 256

[[job_queue]]
name = "main"
priority = 100
[[job_queue.binding]]
order = 1
environment = "env"
"#
    )
}
