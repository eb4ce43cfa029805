use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::{JobDefinition, ResourceRequirements};
use crate::environment::{
    AllocationStrategy, ComputeEnvironment, ComputeUnitType, NetworkPlacement,
};
use crate::error::{BatchError, Result};
use crate::queue::{DispatchSettings, JobQueue};
use crate::schedule::ScheduleSpec;
use crate::workflow::WorkflowSpec;

/// Loop tunables for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneSettings {
    /// Fallback dispatch pass interval when no events arrive
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Bounded wait for backend start/terminate confirmations
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    /// Deadline check cadence for running instances
    #[serde(default = "default_deadline_check_interval_ms")]
    pub deadline_check_interval_ms: u64,
    /// How long terminal instances stay readable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Calendar evaluation cadence
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    /// Workflow poll interval bounds; the actual interval is jittered
    /// between them
    #[serde(default = "default_poll_min_ms")]
    pub poll_min_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
}

fn default_dispatch_interval_ms() -> u64 {
    100
}
fn default_confirm_timeout_ms() -> u64 {
    5_000
}
fn default_deadline_check_interval_ms() -> u64 {
    250
}
fn default_retention_secs() -> u64 {
    3_600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_scheduler_tick_ms() -> u64 {
    1_000
}
fn default_poll_min_ms() -> u64 {
    500
}
fn default_poll_max_ms() -> u64 {
    2_000
}

impl Default for PlaneSettings {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            deadline_check_interval_ms: default_deadline_check_interval_ms(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            poll_min_ms: default_poll_min_ms(),
            poll_max_ms: default_poll_max_ms(),
        }
    }
}

impl PlaneSettings {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms),
            confirm_timeout: Duration::from_millis(self.confirm_timeout_ms),
            deadline_check_interval: Duration::from_millis(self.deadline_check_interval_ms),
            retention: Duration::from_secs(self.retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeEnvironmentConfig {
    pub name: String,
    pub strategy: AllocationStrategy,
    pub min_vcpus: u32,
    pub max_vcpus: u32,
    #[serde(default)]
    pub placement: NetworkPlacement,
    #[serde(rename = "unit_type")]
    pub unit_types: Vec<ComputeUnitType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinitionConfig {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub resources: ResourceRequirements,
    /// Environment variable bindings passed to the runnable unit
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Placeholder defaults
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub order: u32,
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    pub name: String,
    pub priority: i32,
    #[serde(rename = "binding")]
    pub bindings: Vec<BindingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron: String,
    pub definition: String,
    pub queue: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub definition: String,
    pub queue: String,
    pub timeout_secs: u64,
    /// Values starting with `$.` resolve against the invocation input
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// The whole operator-facing configuration surface: environments,
/// definitions, queues, schedules, and workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub plane: Option<PlaneSettings>,
    #[serde(default, rename = "compute_environment")]
    pub compute_environments: Vec<ComputeEnvironmentConfig>,
    #[serde(default, rename = "job_definition")]
    pub job_definitions: Vec<JobDefinitionConfig>,
    #[serde(default, rename = "job_queue")]
    pub job_queues: Vec<JobQueueConfig>,
    #[serde(default, rename = "schedule")]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default, rename = "workflow")]
    pub workflows: Vec<WorkflowConfig>,
}

impl ClusterConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn settings(&self) -> PlaneSettings {
        self.plane.clone().unwrap_or_default()
    }

    /// Cross-check the whole configuration before anything is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BatchError::InvalidConfig(msg));

        let mut env_names = HashSet::new();
        for env in &self.compute_environments {
            if !env_names.insert(env.name.as_str()) {
                return invalid(format!("duplicate compute environment `{}`", env.name));
            }
            if env.min_vcpus > env.max_vcpus {
                return invalid(format!(
                    "environment `{}`: min_vcpus {} exceeds max_vcpus {}",
                    env.name, env.min_vcpus, env.max_vcpus
                ));
            }
            if env.unit_types.is_empty() {
                return invalid(format!("environment `{}` has no unit types", env.name));
            }
            for unit in &env.unit_types {
                if unit.vcpus == 0 {
                    return invalid(format!(
                        "environment `{}`: unit type `{}` has zero vCPUs",
                        env.name, unit.name
                    ));
                }
            }
        }

        let mut def_names = HashSet::new();
        for def in &self.job_definitions {
            if !def_names.insert(def.name.as_str()) {
                return invalid(format!("duplicate job definition `{}`", def.name));
            }
            if def.command.is_empty() {
                return invalid(format!("definition `{}` has an empty command", def.name));
            }
            if def.timeout_secs == 0 {
                return invalid(format!("definition `{}` has a zero timeout", def.name));
            }
            if def.resources.vcpus <= 0.0 {
                return invalid(format!("definition `{}` requires no vCPUs", def.name));
            }
            if def.resources.memory_mib == 0 {
                return invalid(format!("definition `{}` requires no memory", def.name));
            }
        }

        let mut queue_names = HashSet::new();
        for queue in &self.job_queues {
            if !queue_names.insert(queue.name.as_str()) {
                return invalid(format!("duplicate job queue `{}`", queue.name));
            }
            if queue.bindings.is_empty() {
                return invalid(format!("queue `{}` has no environment bindings", queue.name));
            }
            let mut orders = HashSet::new();
            for binding in &queue.bindings {
                if !orders.insert(binding.order) {
                    return invalid(format!(
                        "queue `{}`: duplicate binding order {}",
                        queue.name, binding.order
                    ));
                }
                if !env_names.contains(binding.environment.as_str()) {
                    return invalid(format!(
                        "queue `{}` binds unknown environment `{}`",
                        queue.name, binding.environment
                    ));
                }
            }
        }

        for schedule in &self.schedules {
            if !def_names.contains(schedule.definition.as_str()) {
                return invalid(format!(
                    "schedule `{}` targets unknown definition `{}`",
                    schedule.name, schedule.definition
                ));
            }
            if !queue_names.contains(schedule.queue.as_str()) {
                return invalid(format!(
                    "schedule `{}` targets unknown queue `{}`",
                    schedule.name, schedule.queue
                ));
            }
            let normalized = crate::schedule::normalize_expression(&schedule.cron);
            cron::Schedule::from_str(&normalized).map_err(|source| BatchError::Calendar {
                expression: schedule.cron.clone(),
                source,
            })?;
        }

        for workflow in &self.workflows {
            if !def_names.contains(workflow.definition.as_str()) {
                return invalid(format!(
                    "workflow `{}` targets unknown definition `{}`",
                    workflow.name, workflow.definition
                ));
            }
            if !queue_names.contains(workflow.queue.as_str()) {
                return invalid(format!(
                    "workflow `{}` targets unknown queue `{}`",
                    workflow.name, workflow.queue
                ));
            }
            if workflow.timeout_secs == 0 {
                return invalid(format!("workflow `{}` has a zero timeout", workflow.name));
            }
        }

        let settings = self.settings();
        if settings.poll_min_ms > settings.poll_max_ms {
            return invalid(format!(
                "poll_min_ms {} exceeds poll_max_ms {}",
                settings.poll_min_ms, settings.poll_max_ms
            ));
        }

        Ok(())
    }

    pub fn build_environments(&self) -> Vec<ComputeEnvironment> {
        self.compute_environments
            .iter()
            .map(|env| {
                ComputeEnvironment::new(
                    env.name.clone(),
                    env.strategy,
                    env.min_vcpus,
                    env.max_vcpus,
                    env.unit_types.clone(),
                    env.placement.clone(),
                )
            })
            .collect()
    }

    pub fn build_definitions(&self) -> Vec<JobDefinition> {
        self.job_definitions
            .iter()
            .map(|def| JobDefinition {
                name: def.name.clone(),
                revision: 0,
                image: def.image.clone(),
                command: def.command.clone(),
                resources: def.resources,
                timeout: Duration::from_secs(def.timeout_secs),
                environment: def.env.clone(),
                default_parameters: def.parameters.clone(),
            })
            .collect()
    }

    pub fn build_queues(&self) -> Vec<JobQueue> {
        self.job_queues
            .iter()
            .map(|config| {
                let mut queue = JobQueue::new(config.name.clone(), config.priority);
                for binding in &config.bindings {
                    queue = queue.with_binding(binding.order, binding.environment.clone());
                }
                queue
            })
            .collect()
    }

    pub fn schedule_specs(&self) -> Vec<ScheduleSpec> {
        self.schedules
            .iter()
            .map(|config| ScheduleSpec {
                name: config.name.clone(),
                expression: config.cron.clone(),
                definition: config.definition.clone(),
                queue: config.queue.clone(),
                parameters: config.parameters.clone(),
            })
            .collect()
    }

    pub fn workflow_spec(&self, name: &str) -> Option<WorkflowSpec> {
        let settings = self.settings();
        self.workflows
            .iter()
            .find(|w| w.name == name)
            .map(|config| WorkflowSpec {
                name: config.name.clone(),
                definition: config.definition.clone(),
                queue: config.queue.clone(),
                parameters: config.parameters.clone(),
                timeout: Duration::from_secs(config.timeout_secs),
                poll_min: Duration::from_millis(settings.poll_min_ms),
                poll_max: Duration::from_millis(settings.poll_max_ms),
            })
    }
}
