use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::queue::{FailureCause, InstanceState};

/// A job lifecycle event, exposed to collaborators for telemetry and log
/// correlation.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub instance_id: Uuid,
    pub state: InstanceState,
    pub cause: Option<FailureCause>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast fan-out of job lifecycle events.
///
/// Subscribers that fall behind lose old events rather than blocking the
/// control plane; consumers needing durable history should read instance
/// records from the queue instead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, instance_id: Uuid, state: InstanceState, cause: Option<FailureCause>) {
        let event = JobEvent {
            instance_id,
            state,
            cause,
            timestamp: Utc::now(),
        };
        tracing::debug!(
            instance_id = %event.instance_id,
            state = %event.state,
            cause = ?event.cause,
            "job lifecycle event"
        );
        // No receivers is fine; events are advisory.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
