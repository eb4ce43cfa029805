use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionOutcome};
use crate::config::{ClusterConfig, PlaneSettings};
use crate::definition::{DefinitionRegistry, JobDefinition};
use crate::environment::EnvironmentRegistry;
use crate::error::{BatchError, Result};
use crate::events::{EventBus, JobEvent};
use crate::queue::{
    ControlEvent, Dispatcher, FailureCause, InstanceState, JobInstance, JobRequest, QueueRegistry,
};
use crate::schedule::Scheduler;

/// Channel depth for control events and execution outcomes.
const CHANNEL_CAPACITY: usize = 256;

/// The assembled control plane: owning registries for environments, queues,
/// and definitions, the dispatcher, the deadline watch, the retention
/// sweep, and the calendar scheduler.
///
/// All subsystems are independent tasks coordinated only through the shared
/// registries and one internal control-event channel; there is no global
/// lock over the whole system.
pub struct ControlPlane {
    settings: PlaneSettings,
    queues: Arc<RwLock<QueueRegistry>>,
    environments: Arc<RwLock<EnvironmentRegistry>>,
    definitions: Arc<RwLock<DefinitionRegistry>>,
    events: EventBus,
    backend: Arc<dyn ExecutionBackend>,
    scheduler: Scheduler,
    event_tx: mpsc::Sender<ControlEvent>,
    event_rx: mpsc::Receiver<ControlEvent>,
    outcome_rx: mpsc::Receiver<ExecutionOutcome>,
}

impl ControlPlane {
    /// Create the outcome channel a backend reports into.
    pub fn outcome_channel() -> (mpsc::Sender<ExecutionOutcome>, mpsc::Receiver<ExecutionOutcome>)
    {
        mpsc::channel(CHANNEL_CAPACITY)
    }

    /// Build a control plane from operator configuration and an execution
    /// backend. `outcome_rx` must be the receiving side of the channel the
    /// backend was constructed with.
    pub fn new(
        config: &ClusterConfig,
        backend: Arc<dyn ExecutionBackend>,
        outcome_rx: mpsc::Receiver<ExecutionOutcome>,
    ) -> Result<Self> {
        config.validate()?;

        let mut environments = EnvironmentRegistry::new();
        for env in config.build_environments() {
            environments.insert(env);
        }

        let mut definitions = DefinitionRegistry::new();
        for def in config.build_definitions() {
            definitions.register(def);
        }

        let mut queues = QueueRegistry::new();
        for queue in config.build_queues() {
            queues.insert(queue);
        }

        let scheduler = Scheduler::new(config.schedule_specs())?;
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Ok(Self {
            settings: config.settings(),
            queues: Arc::new(RwLock::new(queues)),
            environments: Arc::new(RwLock::new(environments)),
            definitions: Arc::new(RwLock::new(definitions)),
            events: EventBus::default(),
            backend,
            scheduler,
            event_tx,
            event_rx,
            outcome_rx,
        })
    }

    /// A cloneable handle for submitting, cancelling, and observing jobs.
    pub fn handle(&self) -> PlaneHandle {
        PlaneHandle {
            queues: self.queues.clone(),
            definitions: self.definitions.clone(),
            events: self.events.clone(),
            backend: self.backend.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Run the control plane until the token is cancelled.
    ///
    /// Spawns, in order: the outcome forwarder (backend completions onto
    /// the control channel), the dispatch loop, the deadline watch, the
    /// retention sweep, and — when schedules are configured — the calendar
    /// tick loop.
    pub async fn run(self, shutdown: CancellationToken) {
        let dispatcher = Arc::new(Dispatcher::new(
            self.queues.clone(),
            self.environments.clone(),
            self.backend.clone(),
            self.events.clone(),
            self.event_tx.clone(),
            self.settings.dispatch_settings(),
        ));

        // Backend completions feed the same control channel as
        // submissions, keeping one concurrency primitive for both.
        let mut outcome_rx = self.outcome_rx;
        let outcome_forward_tx = self.event_tx.clone();
        let forward_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_shutdown.cancelled() => break,
                    outcome = outcome_rx.recv() => match outcome {
                        Some(outcome) => {
                            let _ = outcome_forward_tx
                                .send(ControlEvent::Outcome(outcome))
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });

        tokio::spawn(dispatcher.clone().run(self.event_rx, shutdown.clone()));
        tokio::spawn(dispatcher.clone().run_deadline_watch(shutdown.clone()));
        tokio::spawn(dispatcher.run_retention_sweep(shutdown.clone()));

        if !self.scheduler.is_empty() {
            let mut scheduler = self.scheduler;
            let handle = PlaneHandle {
                queues: self.queues.clone(),
                definitions: self.definitions.clone(),
                events: self.events.clone(),
                backend: self.backend.clone(),
                event_tx: self.event_tx.clone(),
            };
            let tick = Duration::from_millis(self.settings.scheduler_tick_ms);
            let scheduler_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = scheduler_shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            for request in scheduler.due(Utc::now()) {
                                // Fire-and-forget: a failed submission is
                                // logged, never retried, and the resulting
                                // instance is not tracked.
                                if let Err(e) = handle.submit(request).await {
                                    tracing::warn!(error = %e, "scheduled submission failed");
                                }
                            }
                        }
                    }
                }
            });
        }

        tracing::info!("control plane started");
        shutdown.cancelled().await;
        tracing::info!("control plane stopping");
    }
}

/// Submission and observation surface shared by the CLI, the scheduler, and
/// workflows.
#[derive(Clone)]
pub struct PlaneHandle {
    queues: Arc<RwLock<QueueRegistry>>,
    definitions: Arc<RwLock<DefinitionRegistry>>,
    events: EventBus,
    backend: Arc<dyn ExecutionBackend>,
    event_tx: mpsc::Sender<ControlEvent>,
}

impl PlaneHandle {
    /// Validate and admit a request; returns the instance id synchronously.
    /// Dispatch onto capacity happens asynchronously.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        let definition = {
            let definitions = self.definitions.read().await;
            definitions
                .latest(&request.definition)
                .cloned()
                .ok_or_else(|| BatchError::DefinitionNotFound(request.definition.clone()))?
        };

        let instance_id = {
            let mut queues = self.queues.write().await;
            let queue = queues
                .get_mut(&request.queue)
                .ok_or_else(|| BatchError::QueueNotFound(request.queue.clone()))?;
            let id = queue.submit(&definition, request)?;
            self.events.emit(id, InstanceState::Submitted, None);
            id
        };

        let _ = self.event_tx.send(ControlEvent::Submitted).await;
        Ok(instance_id)
    }

    /// Request cancellation. Cooperative: a SUBMITTED instance fails
    /// immediately (it never held capacity); a dispatched one is marked and
    /// reaches FAILED(CANCELLED) once the backend acknowledges termination.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<()> {
        let mut request_terminate = false;
        {
            let mut queues = self.queues.write().await;
            let queue_name = match queues.find_instance(&instance_id) {
                Some(instance) => instance.queue.clone(),
                None => return Err(BatchError::InstanceNotFound(instance_id)),
            };
            let queue = queues
                .get_mut(&queue_name)
                .ok_or(BatchError::InstanceNotFound(instance_id))?;

            let mut drop_pending = false;
            {
                let instance = queue
                    .get_instance_mut(&instance_id)
                    .ok_or(BatchError::InstanceNotFound(instance_id))?;
                if instance.is_terminal() {
                    return Ok(());
                }
                instance.cancel_requested = true;
                match instance.state {
                    InstanceState::Submitted => {
                        if instance.try_fail(FailureCause::Cancelled, Utc::now()) {
                            self.events.emit(
                                instance_id,
                                InstanceState::Failed,
                                Some(FailureCause::Cancelled),
                            );
                        }
                        drop_pending = true;
                    }
                    _ => request_terminate = true,
                }
            }
            if drop_pending {
                queue.remove_pending(instance_id);
            }
        }

        tracing::info!(instance_id = %instance_id, "cancellation requested");
        if request_terminate {
            // Best effort; the cancelled outcome arrives via the backend.
            if let Err(e) = self.backend.terminate(instance_id).await {
                tracing::warn!(instance_id = %instance_id, error = %e, "terminate request failed");
            }
        }
        let _ = self.event_tx.send(ControlEvent::CapacityChanged).await;
        Ok(())
    }

    /// Read-only snapshot of an instance.
    pub async fn instance(&self, instance_id: Uuid) -> Option<JobInstance> {
        let queues = self.queues.read().await;
        queues.find_instance(&instance_id).cloned()
    }

    /// All instances of a queue, chronologically.
    pub async fn queue_instances(&self, queue: &str) -> Result<Vec<JobInstance>> {
        let queues = self.queues.read().await;
        let queue = queues
            .get(queue)
            .ok_or_else(|| BatchError::QueueNotFound(queue.to_string()))?;
        Ok(queue.all_instances().into_iter().cloned().collect())
    }

    /// Register a new definition revision at runtime.
    pub async fn register_definition(&self, definition: JobDefinition) -> u32 {
        self.definitions.write().await.register(definition)
    }

    /// Latest revision of a definition, including its resource-requirement
    /// declaration for capacity planning.
    pub async fn definition(&self, name: &str) -> Option<JobDefinition> {
        self.definitions.read().await.latest(name).cloned()
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
