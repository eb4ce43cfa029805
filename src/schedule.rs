use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{BatchError, Result};
use crate::queue::JobRequest;

/// Parameter name under which each firing's trigger timestamp is bound, so
/// definitions can reference `Ref::trigger_time`.
pub const TRIGGER_TIME_PARAMETER: &str = "trigger_time";

/// A recurring trigger: a calendar expression plus a fixed
/// (definition, queue, parameter template) target.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub name: String,
    /// Standard 5-field cron expression (`min hour dom month dow`).
    pub expression: String,
    pub definition: String,
    pub queue: String,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug)]
struct ScheduleEntry {
    spec: ScheduleSpec,
    schedule: CronSchedule,
    last_fired: Option<DateTime<Utc>>,
}

/// Evaluates calendar expressions against wall-clock time and produces job
/// requests on each match.
///
/// Fire-and-forget: the scheduler does not track resulting instances and is
/// unaffected by their failure. Missed firings are never backfilled — the
/// due check starts from the later of creation time and the last firing, so
/// a controller outage spanning a tick produces zero requests for it.
#[derive(Debug)]
pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    baseline: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(specs: Vec<ScheduleSpec>) -> Result<Self> {
        Self::with_baseline(specs, Utc::now())
    }

    /// `baseline` caps how far back the due check may look; nothing before
    /// it ever fires.
    pub fn with_baseline(specs: Vec<ScheduleSpec>, baseline: DateTime<Utc>) -> Result<Self> {
        let entries = specs
            .into_iter()
            .map(|spec| {
                let normalized = normalize_expression(&spec.expression);
                let schedule =
                    CronSchedule::from_str(&normalized).map_err(|source| BatchError::Calendar {
                        expression: spec.expression.clone(),
                        source,
                    })?;
                Ok(ScheduleEntry {
                    spec,
                    schedule,
                    last_fired: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries, baseline })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect one request per schedule whose expression matched a tick
    /// since it last fired. At most one request per schedule per call, no
    /// matter how many ticks were missed.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<JobRequest> {
        let baseline = self.baseline;
        let mut requests = Vec::new();

        for entry in &mut self.entries {
            let check_from = entry.last_fired.unwrap_or(baseline);
            let tick = entry.schedule.after(&check_from).next();
            let due = matches!(tick, Some(t) if t <= now);
            if !due {
                continue;
            }

            entry.last_fired = Some(now);
            let mut parameters = entry.spec.parameters.clone();
            parameters
                .entry(TRIGGER_TIME_PARAMETER.to_string())
                .or_insert_with(|| now.to_rfc3339());

            tracing::info!(
                schedule = %entry.spec.name,
                queue = %entry.spec.queue,
                definition = %entry.spec.definition,
                "schedule fired"
            );
            requests.push(JobRequest {
                definition: entry.spec.definition.clone(),
                queue: entry.spec.queue.clone(),
                parameters,
                name: Some(format!("{}-{}", entry.spec.name, now.timestamp_millis())),
            });
        }

        requests
    }
}

/// The `cron` crate wants 6 fields (seconds first); operator config uses
/// standard 5-field expressions. Prepend a zero seconds field when needed.
pub(crate) fn normalize_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily_at_10_16() -> ScheduleSpec {
        ScheduleSpec {
            name: "batch-export".to_string(),
            expression: "16 10 * * *".to_string(),
            definition: "stock-batch".to_string(),
            queue: "stock-queue".to_string(),
            parameters: BTreeMap::from([("symbol".to_string(), "AAPL".to_string())]),
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn normalize_prepends_seconds_field() {
        assert_eq!(normalize_expression("16 10 * * *"), "0 16 10 * * *");
        assert_eq!(normalize_expression("0 16 10 * * *"), "0 16 10 * * *");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let mut spec = daily_at_10_16();
        spec.expression = "not a cron".to_string();
        let err = Scheduler::with_baseline(vec![spec], Utc::now()).unwrap_err();
        assert!(matches!(err, BatchError::Calendar { .. }));
    }

    #[test]
    fn fires_once_per_matching_day() {
        let baseline = ts("2026-03-01T00:00:00Z");
        let mut scheduler =
            Scheduler::with_baseline(vec![daily_at_10_16()], baseline).unwrap();

        // Before the tick: nothing.
        assert!(scheduler.due(ts("2026-03-01T10:15:59Z")).is_empty());

        // At the tick: exactly one request.
        let fired = scheduler.due(ts("2026-03-01T10:16:00Z"));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].queue, "stock-queue");
        assert_eq!(
            fired[0].parameters.get("symbol"),
            Some(&"AAPL".to_string())
        );
        assert!(fired[0].parameters.contains_key(TRIGGER_TIME_PARAMETER));

        // Later the same day: already fired.
        assert!(scheduler.due(ts("2026-03-01T18:00:00Z")).is_empty());

        // Next day's tick fires again.
        assert_eq!(scheduler.due(ts("2026-03-02T10:16:30Z")).len(), 1);
    }

    #[test]
    fn outage_spanning_ticks_is_not_backfilled() {
        let baseline = ts("2026-03-01T00:00:00Z");
        let mut scheduler =
            Scheduler::with_baseline(vec![daily_at_10_16()], baseline).unwrap();

        scheduler.due(ts("2026-03-01T10:16:00Z"));

        // Three days of downtime spanning two ticks: a single firing for
        // the window, not three.
        let fired = scheduler.due(ts("2026-03-04T09:00:00Z"));
        assert_eq!(fired.len(), 1);
        assert!(scheduler.due(ts("2026-03-04T09:00:01Z")).is_empty());
    }

    #[test]
    fn restart_does_not_backfill_past_ticks() {
        // A controller restarted after the tick has a fresh baseline; the
        // missed tick never fires.
        let baseline = ts("2026-03-01T11:00:00Z");
        let mut scheduler =
            Scheduler::with_baseline(vec![daily_at_10_16()], baseline).unwrap();

        assert!(scheduler.due(ts("2026-03-01T12:00:00Z")).is_empty());
        assert_eq!(scheduler.due(ts("2026-03-02T10:16:05Z")).len(), 1);
    }

    #[test]
    fn generated_names_carry_trigger_millis() {
        let baseline = ts("2026-03-01T00:00:00Z");
        let mut scheduler =
            Scheduler::with_baseline(vec![daily_at_10_16()], baseline).unwrap();

        let at = ts("2026-03-01T10:16:00Z");
        let fired = scheduler.due(at);
        assert_eq!(
            fired[0].name.as_deref(),
            Some(format!("batch-export-{}", at.timestamp_millis()).as_str())
        );
    }

    #[test]
    fn explicit_template_binding_wins_over_trigger_time() {
        let baseline = ts("2026-03-01T00:00:00Z");
        let mut spec = daily_at_10_16();
        spec.parameters.insert(
            TRIGGER_TIME_PARAMETER.to_string(),
            "pinned".to_string(),
        );
        let mut scheduler = Scheduler::with_baseline(vec![spec], baseline).unwrap();

        let fired = scheduler.due(ts("2026-03-01T10:16:00Z"));
        assert_eq!(
            fired[0].parameters.get(TRIGGER_TIME_PARAMETER),
            Some(&"pinned".to_string())
        );
    }
}
