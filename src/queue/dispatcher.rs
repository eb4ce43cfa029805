use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{ExecutionBackend, ExecutionOutcome, OutcomeKind, RunSpec};
use crate::environment::EnvironmentRegistry;
use crate::events::EventBus;
use crate::queue::instance::{FailureCause, InstanceState};
use crate::queue::queue::QueueRegistry;

/// Internal control events. Both trigger paths (scheduler fire-and-forget
/// and workflow submissions) and the backend's completions all funnel into
/// this one channel; the dispatch loop is its only consumer.
#[derive(Debug)]
pub enum ControlEvent {
    /// A request was admitted; a dispatch pass may find new work.
    Submitted,
    /// Capacity was released or changed; blocked heads may now fit.
    CapacityChanged,
    /// An execution reached a terminal result.
    Outcome(ExecutionOutcome),
}

/// Tunables for the dispatch and watch loops.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Fallback pass interval when no events arrive.
    pub dispatch_interval: Duration,
    /// Bounded wait for a start/terminate confirmation.
    pub confirm_timeout: Duration,
    /// How often running instances are checked against their deadline.
    pub deadline_check_interval: Duration,
    /// How long terminal instances stay readable.
    pub retention: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(100),
            confirm_timeout: Duration::from_secs(5),
            deadline_check_interval: Duration::from_millis(250),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A dispatch decision carried out after the registry locks are released.
struct StartOrder {
    instance_id: Uuid,
    environment: String,
    spec: RunSpec,
}

/// Drives instances from SUBMITTED through RUNNING to a terminal state.
///
/// One logical pass runs per capacity-change or queue-change event (with a
/// fallback interval): first the capacity controller sizes every
/// environment to the unsatisfied demand, then the dispatch sweep admits
/// queue heads in strict priority order. Start confirmations are awaited
/// off-lock with a bounded timeout; overruns take the stall path.
pub struct Dispatcher {
    queues: Arc<RwLock<QueueRegistry>>,
    environments: Arc<RwLock<EnvironmentRegistry>>,
    backend: Arc<dyn ExecutionBackend>,
    events: EventBus,
    nudge_tx: mpsc::Sender<ControlEvent>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        queues: Arc<RwLock<QueueRegistry>>,
        environments: Arc<RwLock<EnvironmentRegistry>>,
        backend: Arc<dyn ExecutionBackend>,
        events: EventBus,
        nudge_tx: mpsc::Sender<ControlEvent>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queues,
            environments,
            backend,
            events,
            nudge_tx,
            settings,
        }
    }

    /// Main dispatch loop. Consumes control events and runs one pass per
    /// wakeup; the interval tick covers events lost to channel pressure.
    pub async fn run(
        self: Arc<Self>,
        mut event_rx: mpsc::Receiver<ControlEvent>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.settings.dispatch_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = event_rx.recv() => {
                    match event {
                        Some(ControlEvent::Outcome(outcome)) => {
                            self.apply_outcome(outcome).await;
                            self.pass().await;
                        }
                        Some(_) => self.pass().await,
                        None => break,
                    }
                }

                _ = interval.tick() => self.pass().await,
            }
        }
        tracing::debug!("dispatch loop stopped");
    }

    /// Deadline watch loop: forces RUNNING instances past `start + timeout`
    /// to FAILED(TIMEOUT) exactly once and tells the backend to terminate
    /// the underlying execution.
    pub async fn run_deadline_watch(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.deadline_check_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let expired = self.expire_overdue().await;
                    for instance_id in expired {
                        // Bounded, best-effort terminate; the instance is
                        // already terminal either way.
                        let _ = tokio::time::timeout(
                            self.settings.confirm_timeout,
                            self.backend.terminate(instance_id),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Retention sweep loop: drops terminal instances past the retention
    /// window.
    pub async fn run_retention_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.sweep_interval);
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    let mut queues = self.queues.write().await;
                    for queue in queues.queues_mut() {
                        let removed = queue.sweep_expired(now, retention);
                        if removed > 0 {
                            tracing::debug!(
                                queue = %queue.name,
                                removed,
                                "swept expired instances"
                            );
                        }
                    }
                }
            }
        }
    }

    /// One logical pass: size capacity to demand, then dispatch.
    async fn pass(&self) {
        self.scale_environments().await;
        let orders = self.dispatch_sweep().await;
        for order in orders {
            self.confirm_start(order);
        }
    }

    /// Capacity controller: desired capacity tracks the sum of unsatisfied
    /// requirements across all queues bound to each environment. This is
    /// the single writer of desired capacity.
    async fn scale_environments(&self) {
        let queues = self.queues.read().await;
        let mut environments = self.environments.write().await;

        for env_name in environments.names() {
            let mut demand = Vec::new();
            for queue in queues.queues() {
                if queue.bindings().iter().any(|b| b.environment == env_name) {
                    demand.extend(queue.pending_instances().iter().map(|i| i.resources));
                }
            }

            let env = match environments.get_mut(&env_name) {
                Some(env) => env,
                None => continue,
            };

            // Requirements no shape can ever satisfy are the operator's to
            // fix; they must not wedge scaling for the rest.
            let (satisfiable, unsatisfiable): (Vec<_>, Vec<_>) =
                demand.into_iter().partition(|r| env.can_ever_fit(r));
            for req in &unsatisfiable {
                tracing::warn!(
                    environment = %env_name,
                    vcpus = req.vcpus,
                    memory_mib = req.memory_mib,
                    gpus = req.gpus,
                    "pending requirement exceeds environment maximum"
                );
            }

            let desired = satisfiable.iter().map(|r| r.vcpus).sum::<f64>().ceil() as u32;
            if let Err(e) = env.set_desired_capacity(desired, &satisfiable) {
                tracing::warn!(environment = %env_name, error = %e, "capacity update rejected");
            }
        }
    }

    /// Dispatch sweep over all queues in descending priority.
    ///
    /// Within a queue the head is matched against bindings in ascending
    /// order; a head no binding can admit blocks the whole queue (strict
    /// FIFO) and closes that queue's environments to lower-priority queues
    /// for the remainder of the pass (no priority bypass).
    async fn dispatch_sweep(&self) -> Vec<StartOrder> {
        let mut orders = Vec::new();
        let mut queues = self.queues.write().await;
        let mut environments = self.environments.write().await;
        let mut blocked: HashSet<String> = HashSet::new();

        for queue_name in queues.names_by_priority() {
            let queue = match queues.get_mut(&queue_name) {
                Some(queue) => queue,
                None => continue,
            };

            loop {
                let (head_id, requirements) = match queue.head() {
                    Some(head) => (head.id, head.resources),
                    None => break,
                };

                let mut admitted: Option<String> = None;
                for binding in queue.bindings().to_vec() {
                    if blocked.contains(&binding.environment) {
                        continue;
                    }
                    if let Some(env) = environments.get_mut(&binding.environment) {
                        if env.admit(head_id, &requirements) {
                            admitted = Some(binding.environment);
                            break;
                        }
                    }
                }

                let env_name = match admitted {
                    Some(env_name) => env_name,
                    None => {
                        for binding in queue.bindings() {
                            blocked.insert(binding.environment.clone());
                        }
                        break;
                    }
                };

                queue.pop_head();
                let now = Utc::now();
                let placement = environments
                    .get(&env_name)
                    .map(|e| e.placement.clone())
                    .unwrap_or_default();
                let instance = match queue.get_instance_mut(&head_id) {
                    Some(instance) => instance,
                    None => {
                        environments.release_everywhere(head_id);
                        continue;
                    }
                };

                if !instance.try_transition(InstanceState::Runnable, now) {
                    // Raced with a cancellation; give the capacity back.
                    if let Some(env) = environments.get_mut(&env_name) {
                        env.release(head_id);
                    }
                    continue;
                }
                instance.environment_id = Some(env_name.clone());
                self.events.emit(head_id, InstanceState::Runnable, None);
                tracing::debug!(
                    instance_id = %head_id,
                    queue = %queue_name,
                    environment = %env_name,
                    "instance dispatched"
                );

                orders.push(StartOrder {
                    instance_id: head_id,
                    environment: env_name,
                    spec: RunSpec {
                        instance_id: head_id,
                        image: instance.image.clone(),
                        command: instance.command.clone(),
                        environment: instance.environment.clone(),
                        resources: instance.resources,
                        placement,
                    },
                });
            }
        }

        orders
    }

    /// Await the backend's start confirmation off-lock, bounded by
    /// `confirm_timeout`. A confirmation that never arrives is a dispatch
    /// stall, not an indefinite wait.
    fn confirm_start(&self, order: StartOrder) {
        let queues = self.queues.clone();
        let environments = self.environments.clone();
        let backend = self.backend.clone();
        let events = self.events.clone();
        let nudge_tx = self.nudge_tx.clone();
        let confirm_timeout = self.settings.confirm_timeout;

        tokio::spawn(async move {
            let started =
                tokio::time::timeout(confirm_timeout, backend.start(order.spec.clone())).await;

            match started {
                Ok(Ok(ack)) => {
                    let cancel_pending = {
                        let mut queues = queues.write().await;
                        let now = Utc::now();
                        match queues.find_instance_mut(&order.instance_id) {
                            Some(instance) => {
                                if instance.try_transition(InstanceState::Running, now) {
                                    events.emit(order.instance_id, InstanceState::Running, None);
                                    tracing::info!(
                                        instance_id = %order.instance_id,
                                        runtime_ref = %ack.runtime_ref,
                                        environment = %order.environment,
                                        "instance running"
                                    );
                                    instance.cancel_requested
                                } else {
                                    // Already terminal: timed out or
                                    // cancelled between dispatch and
                                    // confirmation.
                                    true
                                }
                            }
                            None => true,
                        }
                    };
                    if cancel_pending {
                        let _ = backend.terminate(order.instance_id).await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        instance_id = %order.instance_id,
                        environment = %order.environment,
                        error = %e,
                        "start rejected by backend"
                    );
                    Self::handle_stall(&queues, &environments, &events, order.instance_id).await;
                    let _ = nudge_tx.send(ControlEvent::CapacityChanged).await;
                }
                Err(_) => {
                    let stall =
                        crate::error::BatchError::DispatchStall(order.instance_id, confirm_timeout);
                    tracing::warn!(
                        environment = %order.environment,
                        error = %stall,
                        "no start confirmation within bounded wait"
                    );
                    Self::handle_stall(&queues, &environments, &events, order.instance_id).await;
                    let _ = nudge_tx.send(ControlEvent::CapacityChanged).await;
                }
            }
        });
    }

    /// Stall policy: the first stall returns the instance to SUBMITTED for
    /// one re-dispatch attempt; a recurring stall fails it permanently with
    /// RESOURCE_UNAVAILABLE.
    async fn handle_stall(
        queues: &Arc<RwLock<QueueRegistry>>,
        environments: &Arc<RwLock<EnvironmentRegistry>>,
        events: &EventBus,
        instance_id: Uuid,
    ) {
        let mut queues = queues.write().await;
        let mut environments = environments.write().await;
        environments.release_everywhere(instance_id);

        let queue_name = match queues.find_instance(&instance_id) {
            Some(instance) => instance.queue.clone(),
            None => return,
        };
        let queue = match queues.get_mut(&queue_name) {
            Some(queue) => queue,
            None => return,
        };
        let now = Utc::now();
        let requeue = {
            let Some(instance) = queue.get_instance_mut(&instance_id) else {
                return;
            };
            if instance.stalled_once {
                if instance.try_fail(FailureCause::ResourceUnavailable, now) {
                    instance.environment_id = None;
                    events.emit(
                        instance_id,
                        InstanceState::Failed,
                        Some(FailureCause::ResourceUnavailable),
                    );
                }
                false
            } else {
                instance.stalled_once = true;
                if instance.try_transition(InstanceState::Submitted, now) {
                    instance.environment_id = None;
                    true
                } else {
                    false
                }
            }
        };

        if requeue {
            queue.requeue_front(instance_id);
            events.emit(instance_id, InstanceState::Submitted, None);
        }
    }

    /// Apply a terminal execution outcome. A racing timeout or cancellation
    /// may already have won; the compare-and-transition keeps exactly one
    /// winner and capacity release is idempotent.
    async fn apply_outcome(&self, outcome: ExecutionOutcome) {
        let mut queues = self.queues.write().await;
        let mut environments = self.environments.write().await;
        let now = Utc::now();

        if let Some(instance) = queues.find_instance_mut(&outcome.instance_id) {
            let transitioned = match outcome.kind {
                OutcomeKind::Succeeded => {
                    instance.try_transition(InstanceState::Succeeded, now)
                }
                OutcomeKind::Failed => instance.try_fail(FailureCause::NonZeroExit, now),
                OutcomeKind::Cancelled => instance.try_fail(FailureCause::Cancelled, now),
            };
            if transitioned {
                instance.exit_code = outcome.exit_code;
                self.events
                    .emit(outcome.instance_id, instance.state, instance.failure_cause);
                tracing::info!(
                    instance_id = %outcome.instance_id,
                    state = %instance.state,
                    exit_code = ?outcome.exit_code,
                    "instance reached terminal state"
                );
            }
            if instance.is_terminal() {
                environments.release_everywhere(outcome.instance_id);
            }
        }
    }

    /// Force overdue RUNNING instances to FAILED(TIMEOUT). Returns the ids
    /// whose transition this call won.
    async fn expire_overdue(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut expired = Vec::new();

        {
            let mut queues = self.queues.write().await;
            for queue in queues.queues_mut() {
                let overdue: Vec<Uuid> = queue
                    .running_instances()
                    .iter()
                    .filter(|i| i.past_deadline(now))
                    .map(|i| i.id)
                    .collect();
                for instance_id in overdue {
                    if let Some(instance) = queue.get_instance_mut(&instance_id) {
                        if instance.try_fail(FailureCause::Timeout, now) {
                            self.events.emit(
                                instance_id,
                                InstanceState::Failed,
                                Some(FailureCause::Timeout),
                            );
                            tracing::warn!(
                                instance_id = %instance_id,
                                queue = %queue.name,
                                "execution window elapsed"
                            );
                            expired.push(instance_id);
                        }
                    }
                }
            }
        }

        if !expired.is_empty() {
            let mut environments = self.environments.write().await;
            for instance_id in &expired {
                environments.release_everywhere(*instance_id);
            }
            let _ = self.nudge_tx.send(ControlEvent::CapacityChanged).await;
        }

        expired
    }
}
