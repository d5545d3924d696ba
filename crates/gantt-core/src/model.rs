use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `{ id, name }` reference the backend embeds in records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityRef {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub start_date: Option<String>,

    #[serde(default)]
    pub end_date: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub position: Option<i64>,

    #[serde(default)]
    pub start_date: Option<String>,

    #[serde(default)]
    pub end_date: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ActivityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: None,
            position: None,
            start_date: None,
            end_date: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub activity: Option<EntityRef>,

    #[serde(default)]
    pub start_date: Option<String>,

    #[serde(default)]
    pub end_date: Option<String>,

    #[serde(default, deserialize_with = "deserialize_hours")]
    pub planned_hours: Option<f64>,

    #[serde(default, deserialize_with = "deserialize_hours")]
    pub spent_hours: Option<f64>,

    #[serde(default)]
    pub position: Option<i64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, activity_id: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            activity: Some(EntityRef::new(activity_id)),
            start_date: None,
            end_date: None,
            planned_hours: None,
            spent_hours: None,
            position: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRecord {
    pub id: String,

    pub name: String,

    #[serde(default, alias = "dueDate")]
    pub delivery_date: Option<String>,

    #[serde(default)]
    pub task: Option<EntityRef>,

    #[serde(default)]
    pub activity: Option<EntityRef>,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub completed: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub start_at: Option<String>,

    #[serde(default)]
    pub end_at: Option<String>,

    #[serde(default)]
    pub task: Option<EntityRef>,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub timesheet: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Everything fetched for one project load.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub project: Option<Project>,
    pub activities: Vec<ActivityRecord>,
    pub tasks: Vec<TaskRecord>,
    pub milestones: Vec<MilestoneRecord>,
    pub events: Vec<CalendarEvent>,
}

/// Hour fields arrive as strings (`"10"`, `"7,5"`), numbers or null.
fn deserialize_hours<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(parse_hours_value))
}

/// Flags arrive as booleans, `0`/`1`, `"true"`/`"false"` or null (false).
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().is_some_and(parse_flag_value))
}

pub fn parse_flag_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

pub fn parse_hours_value(value: &Value) -> Option<f64> {
    let hours = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.replace(',', ".").parse::<f64>().ok()
            }
        }
        _ => None,
    };
    hours.filter(|h| h.is_finite())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CalendarEvent, MilestoneRecord, TaskRecord, parse_flag_value, parse_hours_value};

    #[test]
    fn task_record_reads_backend_shape() {
        let task: TaskRecord = serde_json::from_value(json!({
            "id": "t1",
            "name": "Design",
            "activity": { "id": "a1", "name": "WP1" },
            "startDate": "01/03/2024",
            "endDate": "08/03/2024",
            "plannedHours": "10",
            "spentHours": null,
            "importance": 2
        }))
        .expect("task json");

        assert_eq!(task.planned_hours, Some(10.0));
        assert_eq!(task.spent_hours, None);
        assert_eq!(task.activity.as_ref().map(|a| a.id.as_str()), Some("a1"));
        assert!(task.extra.contains_key("importance"));
    }

    #[test]
    fn hours_accept_numbers_and_decimal_commas() {
        assert_eq!(parse_hours_value(&json!(4)), Some(4.0));
        assert_eq!(parse_hours_value(&json!("7,5")), Some(7.5));
        assert_eq!(parse_hours_value(&json!("")), None);
        assert_eq!(parse_hours_value(&json!("lots")), None);
        assert_eq!(parse_hours_value(&json!(true)), None);
    }

    #[test]
    fn milestone_accepts_due_date_alias() {
        let milestone: MilestoneRecord = serde_json::from_value(json!({
            "id": "m1",
            "name": "Kickoff",
            "dueDate": "05/03/2024",
            "task": { "id": "t1" }
        }))
        .expect("milestone json");
        assert_eq!(milestone.delivery_date.as_deref(), Some("05/03/2024"));
        assert!(!milestone.completed);
    }

    #[test]
    fn event_defaults_to_not_timesheet() {
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "e1",
            "startAt": "2024-03-01T09:00:00Z",
            "endAt": "2024-03-01T10:00:00Z"
        }))
        .expect("event json");
        assert!(!event.timesheet);
        assert!(event.task.is_none());
    }

    #[test]
    fn null_or_loose_flags_do_not_reject_the_event() {
        let events: Vec<CalendarEvent> = serde_json::from_value(json!([
            { "id": "e1", "timesheet": true },
            { "id": "e2", "timesheet": null },
            { "id": "e3", "timesheet": "true" },
            { "id": "e4", "timesheet": 0 }
        ]))
        .expect("events json");
        let flags: Vec<bool> = events.iter().map(|e| e.timesheet).collect();
        assert_eq!(flags, vec![true, false, true, false]);

        assert!(parse_flag_value(&json!(1)));
        assert!(!parse_flag_value(&json!({})));
    }
}
