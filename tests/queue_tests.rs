use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use batch_lite::definition::{JobDefinition, ResourceRequirements};
use batch_lite::error::BatchError;
use batch_lite::queue::{InstanceState, JobQueue, JobRequest, QueueRegistry};

fn noop_definition() -> JobDefinition {
    JobDefinition {
        name: "noop".to_string(),
        revision: 1,
        image: "alpine:latest".to_string(),
        command: vec!["true".to_string()],
        resources: ResourceRequirements::new(1.0, 256, 0),
        timeout: Duration::from_secs(60),
        environment: BTreeMap::new(),
        default_parameters: BTreeMap::new(),
    }
}

#[test]
fn submit_creates_submitted_instance() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();

    let id = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();

    let instance = queue.get_instance(&id).unwrap();
    assert_eq!(instance.state, InstanceState::Submitted);
    assert_eq!(instance.queue, "main");
    assert_eq!(instance.revision, 1);
    assert_eq!(queue.pending_instances().len(), 1);
}

#[test]
fn submit_generates_name_when_absent() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();

    let id = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();
    assert!(queue.get_instance(&id).unwrap().name.starts_with("noop-"));

    let named = queue
        .submit(&def, JobRequest::new("noop", "main").with_name("explicit"))
        .unwrap();
    assert_eq!(queue.get_instance(&named).unwrap().name, "explicit");
}

#[test]
fn submit_to_disabled_queue_fails() {
    let mut queue = JobQueue::new("main", 100);
    queue.disable();

    let err = queue
        .submit(&noop_definition(), JobRequest::new("noop", "main"))
        .unwrap_err();
    assert!(matches!(err, BatchError::QueueDisabled(name) if name == "main"));

    queue.enable();
    assert!(queue
        .submit(&noop_definition(), JobRequest::new("noop", "main"))
        .is_ok());
}

#[test]
fn pending_is_fifo_within_a_queue() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();

    let first = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();
    let second = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();

    assert_eq!(queue.head().unwrap().id, first);
    assert_eq!(queue.pop_head(), Some(first));
    assert_eq!(queue.head().unwrap().id, second);
}

#[test]
fn requeue_front_restores_head_position() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();

    let first = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();
    let _second = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();

    queue.pop_head();
    queue.requeue_front(first);
    // A stalled head goes back ahead of later submissions.
    assert_eq!(queue.head().unwrap().id, first);
}

#[test]
fn bindings_sorted_by_order() {
    let queue = JobQueue::new("main", 100)
        .with_binding(3, "spare")
        .with_binding(1, "primary")
        .with_binding(2, "secondary");

    let orders: Vec<u32> = queue.bindings().iter().map(|b| b.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert_eq!(queue.bindings()[0].environment, "primary");
}

#[test]
fn sweep_removes_only_expired_terminal_instances() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();
    let now = Utc::now();

    let done = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();
    let live = queue.submit(&def, JobRequest::new("noop", "main")).unwrap();

    // Drive one instance to a terminal state in the past.
    {
        let instance = queue.get_instance_mut(&done).unwrap();
        instance.try_transition(InstanceState::Runnable, now);
        instance.try_transition(InstanceState::Running, now);
        instance.try_transition(InstanceState::Succeeded, now);
        instance.completed_at = Some(now - chrono::Duration::hours(2));
    }

    let removed = queue.sweep_expired(now, chrono::Duration::hours(1));
    assert_eq!(removed, 1);
    assert!(queue.get_instance(&done).is_none());
    assert!(queue.get_instance(&live).is_some());

    // Recently-finished instances survive the sweep.
    {
        let instance = queue.get_instance_mut(&live).unwrap();
        instance.try_transition(InstanceState::Runnable, now);
        instance.try_transition(InstanceState::Running, now);
        instance.try_transition(InstanceState::Succeeded, now);
    }
    assert_eq!(queue.sweep_expired(now, chrono::Duration::hours(1)), 0);
}

#[test]
fn all_instances_sorted_chronologically() {
    let mut queue = JobQueue::new("main", 100);
    let def = noop_definition();

    let ids: Vec<Uuid> = (0..3)
        .map(|_| queue.submit(&def, JobRequest::new("noop", "main")).unwrap())
        .collect();

    let listed: Vec<Uuid> = queue.all_instances().iter().map(|i| i.id).collect();
    assert_eq!(listed, ids);
}

#[test]
fn registry_orders_queues_by_priority() {
    let mut registry = QueueRegistry::new();
    registry.insert(JobQueue::new("bulk", 10));
    registry.insert(JobQueue::new("interactive", 200));
    registry.insert(JobQueue::new("default", 100));

    assert_eq!(
        registry.names_by_priority(),
        vec!["interactive", "default", "bulk"]
    );
}

#[test]
fn registry_finds_instance_across_queues() {
    let mut registry = QueueRegistry::new();
    registry.insert(JobQueue::new("a", 1));
    registry.insert(JobQueue::new("b", 2));

    let def = noop_definition();
    let id = registry
        .get_mut("b")
        .unwrap()
        .submit(&def, JobRequest::new("noop", "b"))
        .unwrap();

    assert_eq!(registry.find_instance(&id).unwrap().queue, "b");
    assert!(registry.find_instance(&Uuid::new_v4()).is_none());
}
