use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::JobDefinition;
use crate::error::{BatchError, Result};
use crate::queue::instance::{InstanceState, JobInstance};

/// Ranked binding of a queue to a compute environment. Lower `order` is
/// preferred at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentBinding {
    pub order: u32,
    pub environment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueState {
    Enabled,
    Disabled,
}

/// An ephemeral ask to run a job definition with specific parameter
/// bindings. Consumed on admission and transformed into a [`JobInstance`];
/// never persisted standalone.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub definition: String,
    pub queue: String,
    pub parameters: BTreeMap<String, String>,
    /// Requested instance name; generated from the definition name when
    /// absent.
    pub name: Option<String>,
}

impl JobRequest {
    pub fn new(definition: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            queue: queue.into(),
            parameters: BTreeMap::new(),
            name: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Priority-ordered admission and dispatch point bound to one or more
/// compute environments.
///
/// The queue owns its instances: pending ones in FIFO submission order
/// (all instances of one queue share the queue's priority, so ordering
/// within the queue is submission time alone), and terminal ones retained
/// read-only until the retention sweep removes them.
#[derive(Debug)]
pub struct JobQueue {
    pub name: String,
    /// Higher priority queues are served first on shared environments.
    pub priority: i32,
    bindings: Vec<EnvironmentBinding>,
    state: QueueState,
    instances: HashMap<Uuid, JobInstance>,
    pending: VecDeque<Uuid>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            bindings: Vec::new(),
            state: QueueState::Enabled,
            instances: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Add an environment binding. Bindings are kept sorted by ascending
    /// order; `order` values must be unique within one queue (validated at
    /// config load).
    pub fn with_binding(mut self, order: u32, environment: impl Into<String>) -> Self {
        self.bindings.push(EnvironmentBinding {
            order,
            environment: environment.into(),
        });
        self.bindings.sort_by_key(|b| b.order);
        self
    }

    pub fn bindings(&self) -> &[EnvironmentBinding] {
        &self.bindings
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn disable(&mut self) {
        self.state = QueueState::Disabled;
    }

    pub fn enable(&mut self) {
        self.state = QueueState::Enabled;
    }

    /// Validate and admit a request, creating a SUBMITTED instance.
    ///
    /// Admission-time failures (disabled queue, unresolvable bindings) are
    /// surfaced synchronously and produce no instance. Dispatch itself is
    /// asynchronous.
    pub fn submit(&mut self, definition: &JobDefinition, request: JobRequest) -> Result<Uuid> {
        if self.state == QueueState::Disabled {
            return Err(BatchError::QueueDisabled(self.name.clone()));
        }

        let now = Utc::now();
        let command = definition.resolve(&request.parameters)?;
        let name = request.name.unwrap_or_else(|| {
            format!("{}-{}", definition.name, now.timestamp_millis())
        });

        let instance = JobInstance::new(name, definition, self.name.clone(), command, now);
        let id = instance.id;
        tracing::info!(
            instance_id = %id,
            queue = %self.name,
            definition = %definition.name,
            revision = definition.revision,
            "job submitted"
        );
        self.instances.insert(id, instance);
        self.pending.push_back(id);
        Ok(id)
    }

    /// The head of the pending list, if any.
    pub fn head(&self) -> Option<&JobInstance> {
        self.pending.front().and_then(|id| self.instances.get(id))
    }

    /// Pop the pending head. Callers transition the popped instance.
    pub fn pop_head(&mut self) -> Option<Uuid> {
        self.pending.pop_front()
    }

    /// Return a stalled instance to the head of the pending list, keeping
    /// its original position ahead of later submissions.
    pub fn requeue_front(&mut self, instance_id: Uuid) {
        self.pending.push_front(instance_id);
    }

    /// Drop an instance from the pending list without dispatching it
    /// (cancellation before dispatch).
    pub fn remove_pending(&mut self, instance_id: Uuid) {
        self.pending.retain(|id| *id != instance_id);
    }

    pub fn get_instance(&self, id: &Uuid) -> Option<&JobInstance> {
        self.instances.get(id)
    }

    pub fn get_instance_mut(&mut self, id: &Uuid) -> Option<&mut JobInstance> {
        self.instances.get_mut(id)
    }

    /// Pending instances in dispatch order.
    pub fn pending_instances(&self) -> Vec<&JobInstance> {
        self.pending
            .iter()
            .filter_map(|id| self.instances.get(id))
            .collect()
    }

    pub fn running_instances(&self) -> Vec<&JobInstance> {
        self.instances
            .values()
            .filter(|i| i.state == InstanceState::Running)
            .collect()
    }

    /// All instances sorted chronologically by submission time.
    pub fn all_instances(&self) -> Vec<&JobInstance> {
        let mut instances: Vec<&JobInstance> = self.instances.values().collect();
        instances.sort_by_key(|i| i.submitted_at);
        instances
    }

    /// Remove terminal instances whose retention period has elapsed.
    /// Returns the number removed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.instances.len();
        self.instances.retain(|_, instance| {
            !instance.is_terminal()
                || instance
                    .completed_at
                    .map(|done| now - done < retention)
                    .unwrap_or(true)
        });
        let instances = &self.instances;
        self.pending.retain(|id| instances.contains_key(id));
        before - self.instances.len()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Owning registry of job queues keyed by identifier.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, JobQueue>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, queue: JobQueue) {
        self.queues.insert(queue.name.clone(), queue);
    }

    pub fn get(&self, name: &str) -> Option<&JobQueue> {
        self.queues.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut JobQueue> {
        self.queues.get_mut(name)
    }

    /// Queue names sorted by descending priority, the order a dispatch pass
    /// visits them.
    pub fn names_by_priority(&self) -> Vec<String> {
        let mut names: Vec<(&String, i32)> = self
            .queues
            .iter()
            .map(|(name, q)| (name, q.priority))
            .collect();
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        names.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Find an instance in whichever queue owns it.
    pub fn find_instance(&self, id: &Uuid) -> Option<&JobInstance> {
        self.queues.values().find_map(|q| q.get_instance(id))
    }

    pub fn find_instance_mut(&mut self, id: &Uuid) -> Option<&mut JobInstance> {
        self.queues.values_mut().find_map(|q| q.get_instance_mut(id))
    }

    pub fn queues(&self) -> impl Iterator<Item = &JobQueue> {
        self.queues.values()
    }

    pub fn queues_mut(&mut self) -> impl Iterator<Item = &mut JobQueue> {
        self.queues.values_mut()
    }
}
