mod test_harness;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;

use batch_lite::queue::{FailureCause, InstanceState};
use batch_lite::workflow::{self, WorkflowSpec, WorkflowStep};
use test_harness::{sim_cluster, TestPlane};

fn spec(definition: &str, timeout: Duration) -> WorkflowSpec {
    WorkflowSpec {
        name: "test-workflow".to_string(),
        definition: definition.to_string(),
        queue: "main".to_string(),
        parameters: BTreeMap::new(),
        timeout,
        poll_min: Duration::from_millis(20),
        poll_max: Duration::from_millis(60),
    }
}

#[tokio::test]
async fn workflow_succeeds_with_job() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    let spec = spec("quick", Duration::from_secs(10));

    let report = workflow::run(&spec, &plane.handle, &json!({})).await;

    assert_eq!(report.status, WorkflowStep::Succeeded);
    let instance_id = report.instance_id.unwrap();
    let instance = plane.handle.instance(instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Succeeded);

    // SUBMIT → AWAIT_TERMINAL → SUCCEEDED, in that order.
    let steps: Vec<WorkflowStep> = report.trace.iter().map(|t| t.step).collect();
    assert_eq!(
        steps,
        vec![
            WorkflowStep::Submit,
            WorkflowStep::AwaitTerminal,
            WorkflowStep::Succeeded
        ]
    );
}

#[tokio::test]
async fn workflow_reports_job_failure() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    let spec = spec("failing", Duration::from_secs(10));

    let report = workflow::run(&spec, &plane.handle, &json!({})).await;

    assert_eq!(report.status, WorkflowStep::Failed);
    assert!(report.error.unwrap().contains("NON_ZERO_EXIT"));
}

/// Dynamic references resolve at SUBMIT time; a missing input field fails
/// the workflow synchronously and no instance is ever created.
#[tokio::test]
async fn missing_dynamic_reference_fails_before_submission() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    let mut spec = spec("quick", Duration::from_secs(10));
    spec.parameters
        .insert("symbol".to_string(), "$.symbol".to_string());

    let report = workflow::run(&spec, &plane.handle, &json!({"other": 1})).await;

    assert_eq!(report.status, WorkflowStep::Failed);
    assert!(report.instance_id.is_none());
    assert!(report.error.unwrap().contains("$.symbol"));
}

/// The workflow's own timeout is independent of (and here shorter than)
/// the job's: the workflow ends TIMED_OUT, requests cancellation, and the
/// instance eventually reaches FAILED(CANCELLED).
#[tokio::test]
async fn workflow_timeout_cancels_instance() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    // Job window is 7200 s; the workflow gives up after 1 s.
    let spec = spec("stuck", Duration::from_secs(1));

    let report = workflow::run(&spec, &plane.handle, &json!({})).await;

    assert_eq!(report.status, WorkflowStep::TimedOut);
    let instance_id = report.instance_id.unwrap();

    let instance = plane
        .await_terminal(instance_id, Duration::from_secs(5))
        .await;
    assert_eq!(instance.state, InstanceState::Failed);
    assert_eq!(instance.failure_cause, Some(FailureCause::Cancelled));
}

/// Dynamic and literal parameters flow into the resolved command.
#[tokio::test]
async fn workflow_parameters_reach_the_command() {
    let toml = sim_cluster(4).replace(
        r#"command = ["sleep:50"]"#,
        r#"command = ["sleep:50", "Ref::symbol"]"#,
    );
    let plane = TestPlane::start(&toml).await;

    let mut spec = spec("quick", Duration::from_secs(10));
    spec.parameters
        .insert("symbol".to_string(), "$.symbol".to_string());

    let report = workflow::run(&spec, &plane.handle, &json!({"symbol": "AAPL"})).await;
    assert_eq!(report.status, WorkflowStep::Succeeded);

    let instance = plane
        .handle
        .instance(report.instance_id.unwrap())
        .await
        .unwrap();
    assert_eq!(instance.command, vec!["sleep:50", "AAPL"]);
}
