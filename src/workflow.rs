use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BatchError, Result};
use crate::plane::PlaneHandle;
use crate::queue::{InstanceState, JobRequest};

/// Prefix marking a workflow parameter value as a dynamic reference into
/// the invocation input document, e.g. `$.symbol`.
pub const DYNAMIC_PREFIX: &str = "$.";

/// A supervised, timeout-bounded orchestration wrapping one submission.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub name: String,
    pub definition: String,
    pub queue: String,
    /// Parameter template; values starting with `$.` resolve against the
    /// input document at SUBMIT time, anything else is a literal.
    pub parameters: BTreeMap<String, String>,
    /// Bounds the whole sequence, independent of (and typically longer
    /// than) the job's own timeout.
    pub timeout: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowStep {
    Submit,
    AwaitTerminal,
    Succeeded,
    Failed,
    TimedOut,
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStep::Submit => write!(f, "SUBMIT"),
            WorkflowStep::AwaitTerminal => write!(f, "AWAIT_TERMINAL"),
            WorkflowStep::Succeeded => write!(f, "SUCCEEDED"),
            WorkflowStep::Failed => write!(f, "FAILED"),
            WorkflowStep::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    pub step: WorkflowStep,
    pub entered_at: DateTime<Utc>,
}

/// Outcome of one workflow invocation, including the step trace for
/// operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub status: WorkflowStep,
    pub instance_id: Option<Uuid>,
    pub trace: Vec<StepTrace>,
    pub error: Option<String>,
}

/// Resolve the parameter template against an input document.
///
/// Dynamic `$.a.b` references walk the document by dot-separated segments;
/// a missing or null field fails with [`BatchError::ParameterResolution`]
/// before any instance exists. Resolution happens at SUBMIT time, not at
/// authoring time.
pub fn resolve_input(
    template: &BTreeMap<String, String>,
    input: &Value,
) -> Result<BTreeMap<String, String>> {
    template
        .iter()
        .map(|(name, value)| {
            let resolved = match value.strip_prefix(DYNAMIC_PREFIX) {
                Some(path) => lookup(input, path)
                    .ok_or_else(|| BatchError::ParameterResolution(value.clone()))?,
                None => value.clone(),
            };
            Ok((name.clone(), resolved))
        })
        .collect()
}

fn lookup(input: &Value, path: &str) -> Option<String> {
    let mut current = input;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => serde_json::to_string(other).ok(),
    }
}

/// Bounded, jittered poll interval; jitter decorrelates many workflows
/// awaiting the same queue.
fn jittered_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64))
}

/// Execute one workflow invocation to its terminal step.
///
/// `SUBMIT` resolves dynamic references and submits; `AWAIT_TERMINAL`
/// polls the instance with jittered intervals until it is terminal or the
/// workflow's own timeout elapses, in which case the workflow ends
/// `TIMED_OUT` and best-effort requests cancellation of the instance.
pub async fn run(spec: &WorkflowSpec, plane: &PlaneHandle, input: &Value) -> WorkflowReport {
    let started = Utc::now();
    let deadline = tokio::time::Instant::now() + spec.timeout;
    let mut trace = vec![StepTrace {
        step: WorkflowStep::Submit,
        entered_at: started,
    }];

    let bindings = match resolve_input(&spec.parameters, input) {
        Ok(bindings) => bindings,
        Err(e) => {
            tracing::warn!(workflow = %spec.name, error = %e, "workflow failed at submit");
            trace.push(StepTrace {
                step: WorkflowStep::Failed,
                entered_at: Utc::now(),
            });
            return WorkflowReport {
                workflow: spec.name.clone(),
                status: WorkflowStep::Failed,
                instance_id: None,
                trace,
                error: Some(e.to_string()),
            };
        }
    };

    let request = JobRequest {
        definition: spec.definition.clone(),
        queue: spec.queue.clone(),
        parameters: bindings,
        name: Some(format!("{}-{}", spec.name, started.timestamp_millis())),
    };

    let instance_id = match plane.submit(request).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(workflow = %spec.name, error = %e, "workflow failed at submit");
            trace.push(StepTrace {
                step: WorkflowStep::Failed,
                entered_at: Utc::now(),
            });
            return WorkflowReport {
                workflow: spec.name.clone(),
                status: WorkflowStep::Failed,
                instance_id: None,
                trace,
                error: Some(e.to_string()),
            };
        }
    };

    tracing::info!(
        workflow = %spec.name,
        instance_id = %instance_id,
        "workflow submitted job"
    );
    trace.push(StepTrace {
        step: WorkflowStep::AwaitTerminal,
        entered_at: Utc::now(),
    });

    loop {
        if let Some(instance) = plane.instance(instance_id).await {
            if instance.is_terminal() {
                let status = if instance.state == InstanceState::Succeeded {
                    WorkflowStep::Succeeded
                } else {
                    WorkflowStep::Failed
                };
                trace.push(StepTrace {
                    step: status,
                    entered_at: Utc::now(),
                });
                let error = instance
                    .failure_cause
                    .map(|cause| format!("job failed: {}", cause));
                tracing::info!(workflow = %spec.name, status = %status, "workflow finished");
                return WorkflowReport {
                    workflow: spec.name.clone(),
                    status,
                    instance_id: Some(instance_id),
                    trace,
                    error,
                };
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            tracing::warn!(
                workflow = %spec.name,
                instance_id = %instance_id,
                "workflow timeout elapsed, requesting cancellation"
            );
            let _ = plane.cancel(instance_id).await;
            trace.push(StepTrace {
                step: WorkflowStep::TimedOut,
                entered_at: Utc::now(),
            });
            return WorkflowReport {
                workflow: spec.name.clone(),
                status: WorkflowStep::TimedOut,
                instance_id: Some(instance_id),
                trace,
                error: Some("workflow timeout elapsed".to_string()),
            };
        }

        let wait = jittered_interval(spec.poll_min, spec.poll_max).min(deadline - now);
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("symbol".to_string(), "$.symbol".to_string()),
            ("start".to_string(), "$.range.start".to_string()),
            ("timeframe".to_string(), "1Day".to_string()),
        ])
    }

    #[test]
    fn resolve_input_mixes_dynamic_and_literal() {
        let input = json!({"symbol": "AAPL", "range": {"start": "2026-01-01"}});
        let resolved = resolve_input(&template(), &input).unwrap();

        assert_eq!(resolved.get("symbol"), Some(&"AAPL".to_string()));
        assert_eq!(resolved.get("start"), Some(&"2026-01-01".to_string()));
        assert_eq!(resolved.get("timeframe"), Some(&"1Day".to_string()));
    }

    #[test]
    fn resolve_input_missing_field_fails() {
        let input = json!({"range": {"start": "2026-01-01"}});
        let err = resolve_input(&template(), &input).unwrap_err();
        assert!(matches!(err, BatchError::ParameterResolution(path) if path == "$.symbol"));
    }

    #[test]
    fn resolve_input_null_field_fails() {
        let input = json!({"symbol": null, "range": {"start": "x"}});
        let err = resolve_input(&template(), &input).unwrap_err();
        assert!(matches!(err, BatchError::ParameterResolution(_)));
    }

    #[test]
    fn resolve_input_stringifies_scalars() {
        let tpl = BTreeMap::from([
            ("count".to_string(), "$.count".to_string()),
            ("dry_run".to_string(), "$.dry_run".to_string()),
        ]);
        let input = json!({"count": 42, "dry_run": true});
        let resolved = resolve_input(&tpl, &input).unwrap();

        assert_eq!(resolved.get("count"), Some(&"42".to_string()));
        assert_eq!(resolved.get("dry_run"), Some(&"true".to_string()));
    }

    #[test]
    fn jittered_interval_stays_in_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(200);
        for _ in 0..50 {
            let interval = jittered_interval(min, max);
            assert!(interval >= min && interval <= max);
        }
    }

    #[test]
    fn jittered_interval_degenerate_range() {
        let d = Duration::from_millis(100);
        assert_eq!(jittered_interval(d, d), d);
    }
}
