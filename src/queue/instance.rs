use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{JobDefinition, ResourceRequirements};

/// Lifecycle states of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Submitted,
    Runnable,
    Running,
    Succeeded,
    Failed,
}

impl InstanceState {
    /// Whether a transition into `next` is allowed.
    ///
    /// The normal path is Submitted → Runnable → Running → Succeeded|Failed.
    /// Runnable → Submitted is the one backward edge: a dispatch whose start
    /// confirmation stalled returns the instance for re-dispatch. Terminal
    /// states admit no outgoing transitions, and any state may fail.
    pub fn can_transition_to(&self, next: &InstanceState) -> bool {
        match (self, next) {
            (s, n) if s == n => false,
            (InstanceState::Submitted, InstanceState::Runnable) => true,
            (InstanceState::Submitted, InstanceState::Failed) => true,
            (InstanceState::Runnable, InstanceState::Running) => true,
            (InstanceState::Runnable, InstanceState::Submitted) => true,
            (InstanceState::Runnable, InstanceState::Failed) => true,
            (InstanceState::Running, InstanceState::Succeeded) => true,
            (InstanceState::Running, InstanceState::Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Succeeded | InstanceState::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Submitted => write!(f, "SUBMITTED"),
            InstanceState::Runnable => write!(f, "RUNNABLE"),
            InstanceState::Running => write!(f, "RUNNING"),
            InstanceState::Succeeded => write!(f, "SUCCEEDED"),
            InstanceState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a failed instance failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    Timeout,
    NonZeroExit,
    ResourceUnavailable,
    Cancelled,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Timeout => write!(f, "TIMEOUT"),
            FailureCause::NonZeroExit => write!(f, "NON_ZERO_EXIT"),
            FailureCause::ResourceUnavailable => write!(f, "RESOURCE_UNAVAILABLE"),
            FailureCause::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// The materialized, stateful execution of a job request.
///
/// Owned by the queue that admitted it until terminal, then retained
/// read-only for the configured retention period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub name: String,
    pub definition: String,
    pub revision: u32,
    pub queue: String,
    pub image: String,
    /// Command with all placeholders substituted at submission time.
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub resources: ResourceRequirements,
    pub timeout: Duration,
    pub state: InstanceState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// `started_at + timeout`, set when the instance reaches RUNNING.
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_cause: Option<FailureCause>,
    pub exit_code: Option<i32>,
    /// Environment currently holding a capacity reservation for this instance.
    pub environment_id: Option<String>,
    /// Cancellation is cooperative; this marks intent only.
    pub cancel_requested: bool,
    /// Set after the first dispatch stall; a second stall fails the instance.
    pub stalled_once: bool,
}

impl JobInstance {
    pub fn new(
        name: String,
        definition: &JobDefinition,
        queue: String,
        command: Vec<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            definition: definition.name.clone(),
            revision: definition.revision,
            queue,
            image: definition.image.clone(),
            command,
            environment: definition.environment.clone(),
            resources: definition.resources,
            timeout: definition.timeout,
            state: InstanceState::Submitted,
            submitted_at,
            started_at: None,
            deadline: None,
            completed_at: None,
            failure_cause: None,
            exit_code: None,
            environment_id: None,
            cancel_requested: false,
            stalled_once: false,
        }
    }

    /// Attempt an atomic transition to `next` at `now`.
    ///
    /// Returns `true` only if the transition is valid from the current state;
    /// callers must hold the owning queue's lock, which serializes concurrent
    /// attempts so exactly one of two racing transitions wins. Timestamps and
    /// the deadline are maintained as side effects of the winning transition.
    pub fn try_transition(&mut self, next: InstanceState, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(&next) {
            return false;
        }
        match next {
            InstanceState::Running => {
                self.started_at = Some(now);
                self.deadline = Some(
                    now + chrono::Duration::from_std(self.timeout)
                        .unwrap_or_else(|_| chrono::Duration::days(36_500)),
                );
            }
            InstanceState::Succeeded | InstanceState::Failed => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.state = next;
        true
    }

    /// Attempt the terminal FAILED transition with a cause.
    pub fn try_fail(&mut self, cause: FailureCause, now: DateTime<Utc>) -> bool {
        if self.try_transition(InstanceState::Failed, now) {
            self.failure_cause = Some(cause);
            true
        } else {
            false
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the execution window has elapsed for a still-running instance.
    pub fn past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.state == InstanceState::Running
            && self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}
