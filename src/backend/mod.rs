//! Execution backends: the seam between the control plane and the
//! infrastructure that actually runs containers.
//!
//! The control plane hands a backend an opaque runnable unit (image,
//! resolved command, environment variables) plus a network placement, and
//! receives a start acknowledgement synchronously and an
//! [`ExecutionOutcome`] asynchronously on the outcome channel. Termination
//! requests are cooperative: the instance is only considered cancelled once
//! the backend reports a cancelled outcome.

pub mod docker;
pub mod sim;

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::definition::ResourceRequirements;
use crate::environment::NetworkPlacement;
use crate::error::Result;

pub use docker::DockerBackend;
pub use sim::SimBackend;

/// Everything a backend needs to start one execution.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub instance_id: Uuid,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub resources: ResourceRequirements,
    pub placement: NetworkPlacement,
}

/// Confirmation that an execution has started.
#[derive(Debug, Clone)]
pub struct StartAck {
    pub instance_id: Uuid,
    /// Backend-specific handle, e.g. a container id.
    pub runtime_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal result of one execution, delivered on the outcome channel.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub instance_id: Uuid,
    pub kind: OutcomeKind,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Start an execution. Returns once the runtime confirms the start; the
    /// caller bounds the wait and treats overrun as a dispatch stall.
    async fn start(&self, spec: RunSpec) -> Result<StartAck>;

    /// Request cooperative termination of a running execution. The
    /// cancelled outcome arrives on the outcome channel once the runtime
    /// acknowledges.
    async fn terminate(&self, instance_id: Uuid) -> Result<()>;
}
