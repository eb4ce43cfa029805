mod test_harness;

use std::time::Duration;

use batch_lite::queue::{FailureCause, InstanceState, JobRequest};
use test_harness::{sim_cluster, TestPlane};

/// The full lifecycle is visible on the event channel, in order:
/// SUBMITTED → RUNNABLE → RUNNING → SUCCEEDED.
#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    let mut events = plane.handle.subscribe();

    let id = plane
        .handle
        .submit(JobRequest::new("quick", "main"))
        .await
        .unwrap();
    plane.await_terminal(id, Duration::from_secs(5)).await;

    let mut observed = Vec::new();
    while observed.len() < 4 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        if event.instance_id == id {
            observed.push(event.state);
        }
    }

    assert_eq!(
        observed,
        vec![
            InstanceState::Submitted,
            InstanceState::Runnable,
            InstanceState::Running,
            InstanceState::Succeeded,
        ]
    );
}

/// Terminal failure events carry their cause.
#[tokio::test]
async fn failure_event_carries_cause() {
    let plane = TestPlane::start(&sim_cluster(4)).await;
    let mut events = plane.handle.subscribe();

    let id = plane
        .handle
        .submit(JobRequest::new("failing", "main"))
        .await
        .unwrap();
    plane.await_terminal(id, Duration::from_secs(5)).await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("channel open");
        if event.instance_id == id && event.state == InstanceState::Failed {
            assert_eq!(event.cause, Some(FailureCause::NonZeroExit));
            break;
        }
    }
}

/// Independent submissions (the scheduler path and the workflow path both
/// funnel through the same queue) interleave without interference.
#[tokio::test]
async fn concurrent_submissions_all_complete() {
    let plane = TestPlane::start(&sim_cluster(16)).await;

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(
            plane
                .handle
                .submit(JobRequest::new("quick", "main"))
                .await
                .unwrap(),
        );
    }

    for id in ids {
        let instance = plane.await_terminal(id, Duration::from_secs(10)).await;
        assert_eq!(instance.state, InstanceState::Succeeded);
    }
}

/// Resolution is per-request: distinct bindings yield distinct commands
/// against the same definition revision.
#[tokio::test]
async fn parameterized_submissions_resolve_independently() {
    let toml = sim_cluster(16).replace(
        r#"command = ["sleep:50"]"#,
        r#"command = ["sleep:50", "--symbol", "Ref::symbol"]"#,
    );
    let plane = TestPlane::start(&toml).await;

    let aapl = plane
        .handle
        .submit(JobRequest::new("quick", "main").with_parameter("symbol", "AAPL"))
        .await
        .unwrap();
    let msft = plane
        .handle
        .submit(JobRequest::new("quick", "main").with_parameter("symbol", "MSFT"))
        .await
        .unwrap();

    let a = plane.await_terminal(aapl, Duration::from_secs(5)).await;
    let m = plane.await_terminal(msft, Duration::from_secs(5)).await;
    assert_eq!(a.command.last().unwrap(), "AAPL");
    assert_eq!(m.command.last().unwrap(), "MSFT");
    assert_eq!(a.revision, m.revision);
}

/// A plane with schedules configured starts its calendar loop; the
/// schedule itself is exercised in the scheduler unit tests, so here we
/// only prove the wiring accepts a scheduled cluster.
#[tokio::test]
async fn plane_starts_with_schedules_configured() {
    let toml = format!(
        "{}\n{}",
        sim_cluster(4),
        r#"
[[schedule]]
name = "nightly"
cron = "0 2 * * *"
definition = "quick"
queue = "main"
"#
    );
    let plane = TestPlane::start(&toml).await;

    // The plane is live and serves ad-hoc submissions alongside the
    // scheduler loop.
    let id = plane
        .handle
        .submit(JobRequest::new("quick", "main"))
        .await
        .unwrap();
    let instance = plane.await_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(instance.state, InstanceState::Succeeded);
}
