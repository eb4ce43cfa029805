use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(
        "desired capacity {requested} vCPUs cannot satisfy a pending requirement \
         ({vcpus} vCPUs, {memory_mib} MiB, {gpus} GPUs) even at max {max} vCPUs"
    )]
    CapacityRange {
        requested: u32,
        max: u32,
        vcpus: f64,
        memory_mib: u64,
        gpus: u32,
    },

    #[error("unbound parameter `{0}` in command template")]
    UnboundParameter(String),

    #[error("unresolved dynamic reference `{0}` in workflow input")]
    ParameterResolution(String),

    #[error("no start confirmation for instance {0} within {1:?}")]
    DispatchStall(Uuid, Duration),

    #[error("job definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("job queue not found: {0}")]
    QueueNotFound(String),

    #[error("compute environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("job instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("job queue {0} is disabled")]
    QueueDisabled(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid calendar expression `{expression}`: {source}")]
    Calendar {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("execution backend error: {0}")]
    Backend(String),

    #[error("config file error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, BatchError>;
