use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::datetime::try_parse_api_datetime;
use crate::model::CalendarEvent;

/// Logged hours keyed by task id.
pub type TaskHours = BTreeMap<String, f64>;

/// Sums timesheet-flagged event durations per task. Events without the flag,
/// without a task, or with unusable endpoints are skipped individually.
#[instrument(skip_all, fields(events = events.len()))]
pub fn aggregate_spent_hours(events: &[CalendarEvent]) -> TaskHours {
    let mut totals = TaskHours::new();
    let mut skipped = 0usize;

    for event in events {
        let Some(task) = event.task.as_ref() else {
            skipped += 1;
            continue;
        };
        match event_hours(event) {
            Some(hours) => *totals.entry(task.id.clone()).or_insert(0.0) += hours,
            None => skipped += 1,
        }
    }

    debug!(tasks = totals.len(), skipped, "aggregated spent hours");
    totals
}

/// Hours an event contributes, or `None` when it must not be counted.
pub fn event_hours(event: &CalendarEvent) -> Option<f64> {
    if !event.timesheet {
        return None;
    }

    let start = endpoint(event, event.start_at.as_deref(), "startAt")?;
    let end = endpoint(event, event.end_at.as_deref(), "endAt")?;
    if end < start {
        debug!(event = %event.id, "event ends before it starts; skipping");
        return None;
    }

    Some((end - start).num_seconds() as f64 / 3600.0)
}

fn endpoint(
    event: &CalendarEvent,
    raw: Option<&str>,
    field: &'static str,
) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = raw?;
    match try_parse_api_datetime(raw) {
        Ok(dt) => Some(dt),
        Err(err) => {
            debug!(event = %event.id, field, error = %err, "unparseable event endpoint");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{aggregate_spent_hours, event_hours};
    use crate::model::{CalendarEvent, EntityRef};

    fn event(id: &str, task: Option<&str>, start: &str, end: &str, timesheet: bool) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            title: None,
            start_at: Some(start.to_string()),
            end_at: Some(end.to_string()),
            task: task.map(EntityRef::new),
            timesheet,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn sums_flagged_events_per_task() {
        let events = vec![
            event("e1", Some("t1"), "2024-03-01T09:00:00Z", "2024-03-01T11:00:00Z", true),
            event("e2", Some("t1"), "2024-03-02T09:00:00Z", "2024-03-02T09:30:00Z", true),
            event("e3", Some("t2"), "2024-03-02T09:00:00Z", "2024-03-02T12:00:00Z", true),
            event("e4", Some("t1"), "2024-03-03T09:00:00Z", "2024-03-03T17:00:00Z", false),
        ];

        let totals = aggregate_spent_hours(&events);
        assert_eq!(totals.get("t1"), Some(&2.5));
        assert_eq!(totals.get("t2"), Some(&3.0));
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn skips_events_with_bad_endpoints() {
        let mut missing_end = event("e2", Some("t1"), "2024-03-01T09:00:00Z", "", true);
        missing_end.end_at = None;
        let events = vec![
            event("e1", Some("t1"), "garbage", "2024-03-01T11:00:00Z", true),
            missing_end,
            event("e3", Some("t1"), "2024-03-01T11:00:00Z", "2024-03-01T09:00:00Z", true),
            event("e4", None, "2024-03-01T09:00:00Z", "2024-03-01T10:00:00Z", true),
            event("e5", Some("t1"), "2024-03-01T09:00:00Z", "2024-03-01T10:00:00Z", true),
        ];

        let totals = aggregate_spent_hours(&events);
        assert_eq!(totals.get("t1"), Some(&1.0));
        assert_eq!(totals.len(), 1);
    }

    #[test]
    fn unflagged_event_contributes_nothing() {
        let e = event("e1", Some("t1"), "2024-03-01T09:00:00Z", "2024-03-01T10:00:00Z", false);
        assert_eq!(event_hours(&e), None);
    }
}
