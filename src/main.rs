use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use batch_lite::backend::{DockerBackend, ExecutionBackend, ExecutionOutcome, SimBackend};
use batch_lite::config::ClusterConfig;
use batch_lite::plane::{ControlPlane, PlaneHandle};
use batch_lite::queue::{InstanceState, JobInstance, JobRequest};
use batch_lite::shutdown::install_shutdown_handler;
use batch_lite::workflow;

#[derive(Parser, Debug)]
#[command(name = "batch-lite")]
#[command(version)]
#[command(about = "A batch job scheduling and lifecycle orchestration engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the control plane until interrupted
    Run(RunArgs),

    /// Check a configuration file and print a summary
    Validate {
        /// Path to the cluster configuration (TOML)
        #[arg(long, short = 'c')]
        config: PathBuf,
    },

    /// Submit one job and await its terminal state
    Submit(SubmitArgs),

    /// Invoke a configured workflow with a JSON input document
    Workflow(WorkflowArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Run instances as Docker containers
    Docker,
    /// Interpret commands in-process (dry runs, tests)
    Sim,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the cluster configuration (TOML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Execution backend
    #[arg(long, default_value = "docker")]
    backend: BackendKind,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Path to the cluster configuration (TOML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Target job queue
    #[arg(long, short = 'q')]
    queue: String,

    /// Target job definition
    #[arg(long, short = 'd')]
    definition: String,

    /// Parameter bindings, repeatable (format: "name=value")
    #[arg(long = "parameter", short = 'p')]
    parameters: Vec<String>,

    /// Requested job name (generated when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Execution backend
    #[arg(long, default_value = "docker")]
    backend: BackendKind,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct WorkflowArgs {
    /// Path to the cluster configuration (TOML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Workflow name from the configuration
    #[arg(long, short = 'n')]
    name: String,

    /// JSON input document resolved against the workflow's `$.` references
    #[arg(long, short = 'i', default_value = "{}")]
    input: String,

    /// Execution backend
    #[arg(long, default_value = "docker")]
    backend: BackendKind,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct InstanceOutput {
    instance_id: String,
    name: String,
    state: String,
    cause: Option<String>,
    exit_code: Option<i32>,
    queue: String,
    definition: String,
    revision: u32,
    submitted_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_parameters(pairs: &[String]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .filter_map(|pair| match pair.split_once('=') {
            Some((name, value)) => Some((name.to_string(), value.to_string())),
            None => {
                tracing::warn!(parameter = %pair, "Invalid parameter, expected name=value");
                None
            }
        })
        .collect()
}

fn build_backend(
    kind: BackendKind,
) -> (
    Arc<dyn ExecutionBackend>,
    tokio::sync::mpsc::Receiver<ExecutionOutcome>,
) {
    let (outcome_tx, outcome_rx) = ControlPlane::outcome_channel();
    let backend: Arc<dyn ExecutionBackend> = match kind {
        BackendKind::Docker => Arc::new(DockerBackend::new(outcome_tx)),
        BackendKind::Sim => Arc::new(SimBackend::new(outcome_tx)),
    };
    (backend, outcome_rx)
}

fn instance_output(instance: &JobInstance) -> InstanceOutput {
    InstanceOutput {
        instance_id: instance.id.to_string(),
        name: instance.name.clone(),
        state: instance.state.to_string(),
        cause: instance.failure_cause.map(|c| c.to_string()),
        exit_code: instance.exit_code,
        queue: instance.queue.clone(),
        definition: instance.definition.clone(),
        revision: instance.revision,
        submitted_at: instance.submitted_at.to_rfc3339(),
        started_at: instance.started_at.map(|t| t.to_rfc3339()),
        completed_at: instance.completed_at.map(|t| t.to_rfc3339()),
    }
}

fn print_instance(instance: &JobInstance, output: &OutputFormat) {
    match output {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&instance_output(instance))
                .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e));
            println!("{}", rendered);
        }
        OutputFormat::Table => {
            println!("Instance ID:  {}", instance.id);
            println!("Name:         {}", instance.name);
            println!("State:        {}", instance.state);
            if let Some(cause) = instance.failure_cause {
                println!("Cause:        {}", cause);
            }
            if let Some(exit_code) = instance.exit_code {
                println!("Exit Code:    {}", exit_code);
            }
            println!("Queue:        {}", instance.queue);
            println!(
                "Definition:   {} (revision {})",
                instance.definition, instance.revision
            );
            if let Some(started) = instance.started_at {
                println!("Started:      {}", started.to_rfc3339());
            }
            if let Some(completed) = instance.completed_at {
                println!("Completed:    {}", completed.to_rfc3339());
            }
        }
    }
}

/// Poll an instance until it reaches a terminal state.
async fn await_terminal(handle: &PlaneHandle, instance_id: Uuid) -> Option<JobInstance> {
    loop {
        match handle.instance(instance_id).await {
            Some(instance) if instance.is_terminal() => return Some(instance),
            Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            None => return None,
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_plane(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::load(&args.config).await?;
    let (backend, outcome_rx) = build_backend(args.backend);
    let plane = ControlPlane::new(&config, backend, outcome_rx)?;

    tracing::info!(
        config = %args.config.display(),
        environments = config.compute_environments.len(),
        queues = config.job_queues.len(),
        definitions = config.job_definitions.len(),
        schedules = config.schedules.len(),
        "Starting batch-lite control plane"
    );

    let shutdown = install_shutdown_handler();
    plane.run(shutdown).await;
    Ok(())
}

async fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::load(&path).await?;
    println!("Configuration OK: {}", path.display());
    println!("  compute environments: {}", config.compute_environments.len());
    println!("  job definitions:      {}", config.job_definitions.len());
    println!("  job queues:           {}", config.job_queues.len());
    println!("  schedules:            {}", config.schedules.len());
    println!("  workflows:            {}", config.workflows.len());
    Ok(())
}

async fn submit_job(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::load(&args.config).await?;
    let (backend, outcome_rx) = build_backend(args.backend);
    let plane = ControlPlane::new(&config, backend, outcome_rx)?;
    let handle = plane.handle();

    let shutdown = install_shutdown_handler();
    let plane_task = tokio::spawn(plane.run(shutdown.clone()));

    let mut request = JobRequest::new(args.definition, args.queue);
    request.parameters = parse_parameters(&args.parameters);
    request.name = args.name;

    let instance_id = match handle.submit(request).await {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error: submission failed: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!("Submitted instance {}", instance_id);

    let instance = await_terminal(&handle, instance_id).await;
    shutdown.cancel();
    let _ = plane_task.await;

    match instance {
        Some(instance) => {
            print_instance(&instance, &args.output);
            if instance.state != InstanceState::Succeeded {
                std::process::exit(1);
            }
        }
        None => {
            eprintln!("Error: instance {} disappeared", instance_id);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn run_workflow(args: WorkflowArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::load(&args.config).await?;
    let spec = match config.workflow_spec(&args.name) {
        Some(spec) => spec,
        None => {
            eprintln!("Error: workflow `{}` not found in configuration", args.name);
            std::process::exit(1);
        }
    };
    let input: serde_json::Value = serde_json::from_str(&args.input)?;

    let (backend, outcome_rx) = build_backend(args.backend);
    let plane = ControlPlane::new(&config, backend, outcome_rx)?;
    let handle = plane.handle();

    let shutdown = install_shutdown_handler();
    let plane_task = tokio::spawn(plane.run(shutdown.clone()));

    let report = workflow::run(&spec, &handle, &input).await;
    shutdown.cancel();
    let _ = plane_task.await;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            println!("Workflow:   {}", report.workflow);
            println!("Status:     {}", report.status);
            if let Some(instance_id) = report.instance_id {
                println!("Instance:   {}", instance_id);
            }
            if let Some(error) = &report.error {
                println!("Error:      {}", error);
            }
            println!("Steps:");
            for step in &report.trace {
                println!(
                    "  {:<16} {}",
                    step.step.to_string(),
                    step.entered_at.to_rfc3339()
                );
            }
        }
    }

    if report.status != workflow::WorkflowStep::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_plane(run_args).await?,
        Commands::Validate { config } => validate_config(config).await?,
        Commands::Submit(submit_args) => submit_job(submit_args).await?,
        Commands::Workflow(workflow_args) => run_workflow(workflow_args).await?,
    }

    Ok(())
}
