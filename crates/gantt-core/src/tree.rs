//! Builds the week-indexed activity/task forest drawn by the chart.
//!
//! Activities nest through `parentId`; tasks hang off the activity they
//! reference and milestones off the task or activity they reference. All
//! positions are whole weeks counted from the project origin, the earliest
//! date found across activities, tasks and attached milestones.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::datetime::{
    add_days, api_date_serde, duration_weeks, parse_api_date, to_project_date, week_index,
};
use crate::hours::{TaskHours, aggregate_spent_hours};
use crate::model::{ActivityRecord, MilestoneRecord, ProjectSnapshot, TaskRecord};

/// Id of the synthetic activity collecting tasks that reference none.
pub const UNASSIGNED_ACTIVITY_ID: &str = "unassigned";
const UNASSIGNED_ACTIVITY_NAME: &str = "Unassigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneStatus {
    Upcoming,
    Overdue,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneNode {
    pub id: String,
    pub name: String,
    #[serde(with = "api_date_serde")]
    pub due_date: NaiveDate,
    pub week: i64,
    pub status: MilestoneStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: String,
    pub name: String,
    pub position: Option<i64>,
    #[serde(with = "api_date_serde")]
    pub start_date: NaiveDate,
    #[serde(with = "api_date_serde")]
    pub end_date: NaiveDate,
    pub start_week: i64,
    pub duration_weeks: i64,
    pub planned_hours: f64,
    pub spent_hours: f64,
    /// `spent/planned h` label shown next to the bar.
    pub hours: String,
    pub progress: u8,
    pub time_exceeded: bool,
    pub milestones: Vec<MilestoneNode>,
}

impl TaskNode {
    pub fn end_week(&self) -> i64 {
        self.start_week + self.duration_weeks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityNode {
    pub id: String,
    pub name: String,
    /// Placeholder created for tasks whose activity is missing.
    pub synthetic: bool,
    pub position: Option<i64>,
    pub start_week: i64,
    pub duration_weeks: i64,
    pub task_count: usize,
    pub children: Vec<ActivityNode>,
    pub tasks: Vec<TaskNode>,
    pub milestones: Vec<MilestoneNode>,
}

impl ActivityNode {
    pub fn end_week(&self) -> i64 {
        self.start_week + self.duration_weeks
    }

    pub fn find_activity_mut(&mut self, id: &str) -> Option<&mut ActivityNode> {
        if self.id == id {
            return Some(self);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_activity_mut(id) {
                return Some(found);
            }
        }
        None
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        if let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) {
            return Some(task);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_task_mut(id) {
                return Some(found);
            }
        }
        None
    }

    /// Tasks of this activity and all nested activities, depth first.
    pub fn collect_tasks<'a>(&'a self, out: &mut Vec<&'a TaskNode>) {
        out.extend(self.tasks.iter());
        for child in &self.children {
            child.collect_tasks(out);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GanttModel {
    pub project: Option<ProjectSummary>,
    #[serde(with = "api_date_serde")]
    pub origin: NaiveDate,
    pub activities: Vec<ActivityNode>,
}

impl GanttModel {
    pub fn empty(origin: NaiveDate) -> Self {
        Self {
            project: None,
            origin,
            activities: vec![],
        }
    }

    pub fn tasks(&self) -> Vec<&TaskNode> {
        let mut out = Vec::new();
        for activity in &self.activities {
            activity.collect_tasks(&mut out);
        }
        out
    }

    pub fn task_count(&self) -> usize {
        self.activities.iter().map(|a| a.task_count).sum()
    }

    pub fn find_activity_mut(&mut self, id: &str) -> Option<&mut ActivityNode> {
        self.activities
            .iter_mut()
            .find_map(|activity| activity.find_activity_mut(id))
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.activities
            .iter_mut()
            .find_map(|activity| activity.find_task_mut(id))
    }

    /// Date at which week `week` begins.
    pub fn week_start(&self, week: i64) -> NaiveDate {
        add_days(self.origin, week * 7)
    }
}

/// Aggregates logged hours from the snapshot's events and builds the forest.
#[instrument(skip_all, fields(
    activities = snapshot.activities.len(),
    tasks = snapshot.tasks.len(),
    milestones = snapshot.milestones.len(),
    events = snapshot.events.len()
))]
pub fn build_model(snapshot: &ProjectSnapshot, now: DateTime<Utc>) -> GanttModel {
    let spent = aggregate_spent_hours(&snapshot.events);
    build_forest(snapshot, &spent, now)
}

#[instrument(skip_all)]
pub fn build_forest(snapshot: &ProjectSnapshot, spent: &TaskHours, now: DateTime<Utc>) -> GanttModel {
    let today = to_project_date(now);

    let mut arena = Arena::from_records(&snapshot.activities, now);
    arena.link_parents();

    let tasks: Vec<ResolvedTask<'_>> = snapshot
        .tasks
        .iter()
        .map(|record| ResolvedTask::resolve(record, now))
        .collect();
    for (task_idx, task) in tasks.iter().enumerate() {
        let slot = arena.owner_slot(task.record);
        arena.slots[slot].tasks.push(task_idx);
    }

    let task_ids: HashSet<&str> = tasks.iter().map(|t| t.record.id.as_str()).collect();
    let milestones: Vec<(&MilestoneRecord, Target, NaiveDate)> = snapshot
        .milestones
        .iter()
        .filter_map(|milestone| {
            let Some(target) = milestone_target(milestone, &task_ids, &arena) else {
                debug!(milestone = %milestone.id, "milestone target not found; omitting");
                return None;
            };
            let due = parse_api_date(milestone.delivery_date.as_deref(), now);
            Some((milestone, target, due))
        })
        .collect();

    let origin = arena
        .slots
        .iter()
        .flat_map(|slot| [slot.start, slot.end])
        .flatten()
        .chain(tasks.iter().flat_map(|t| [t.start, t.end]))
        .chain(milestones.iter().map(|(_, _, due)| *due))
        .min()
        .unwrap_or(today);

    let mut activities: Vec<ActivityNode> = arena
        .roots()
        .into_iter()
        .map(|idx| arena.build_node(idx, &tasks, spent, origin))
        .collect();
    activities.sort_by(|a, b| sibling_order(a.position, &a.name, b.position, &b.name));

    let mut model = GanttModel {
        project: snapshot.project.as_ref().map(|p| ProjectSummary {
            id: p.id.clone(),
            name: p.name.clone(),
            code: p.code.clone(),
        }),
        origin,
        activities,
    };

    let attached = milestones.len();
    for (milestone, target, due) in milestones {
        let node = MilestoneNode {
            id: milestone.id.clone(),
            name: milestone.name.clone(),
            due_date: due,
            week: week_index(due, origin),
            status: milestone_status(milestone, due, today),
        };
        match target {
            Target::Task(id) => {
                if let Some(task) = model.find_task_mut(&id) {
                    task.milestones.push(node);
                }
            }
            Target::Activity(id) => {
                if let Some(activity) = model.find_activity_mut(&id) {
                    activity.milestones.push(node);
                }
            }
        }
    }

    info!(
        origin = %origin,
        roots = model.activities.len(),
        tasks = model.task_count(),
        milestones = attached,
        omitted_milestones = snapshot.milestones.len() - attached,
        "built gantt forest"
    );

    model
}

/// Explicit positions first (ascending), then case-insensitive name order.
pub fn sibling_order(a_pos: Option<i64>, a_name: &str, b_pos: Option<i64>, b_name: &str) -> Ordering {
    match (a_pos, b_pos) {
        (Some(a), Some(b)) => a.cmp(&b).then_with(|| compare_names(a_name, b_name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => compare_names(a_name, b_name),
    }
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

#[derive(Debug, Clone)]
enum Target {
    Task(String),
    Activity(String),
}

fn milestone_target(milestone: &MilestoneRecord, task_ids: &HashSet<&str>, arena: &Arena) -> Option<Target> {
    if let Some(task) = milestone.task.as_ref()
        && task_ids.contains(task.id.as_str())
    {
        return Some(Target::Task(task.id.clone()));
    }
    if let Some(activity) = milestone.activity.as_ref()
        && arena.index.contains_key(&activity.id)
    {
        return Some(Target::Activity(activity.id.clone()));
    }
    None
}

fn milestone_status(milestone: &MilestoneRecord, due: NaiveDate, today: NaiveDate) -> MilestoneStatus {
    if milestone.completed {
        MilestoneStatus::Completed
    } else if due < today {
        MilestoneStatus::Overdue
    } else {
        MilestoneStatus::Upcoming
    }
}

struct ResolvedTask<'a> {
    record: &'a TaskRecord,
    start: NaiveDate,
    end: NaiveDate,
}

impl<'a> ResolvedTask<'a> {
    fn resolve(record: &'a TaskRecord, now: DateTime<Utc>) -> Self {
        let start = parse_api_date(record.start_date.as_deref(), now);
        let end = match non_empty(record.end_date.as_deref()) {
            Some(raw) => parse_api_date(Some(raw), now),
            None => add_days(start, 7),
        };
        Self { record, start, end }
    }

    fn node(&self, logged: &TaskHours, origin: NaiveDate) -> TaskNode {
        let record = self.record;
        let planned = record.planned_hours.unwrap_or(0.0);
        let spent = record
            .spent_hours
            .or_else(|| logged.get(&record.id).copied())
            .unwrap_or(0.0);

        let progress = if planned > 0.0 {
            (spent / planned * 100.0).round().clamp(0.0, 100.0) as u8
        } else {
            0
        };

        TaskNode {
            id: record.id.clone(),
            name: record.name.clone(),
            position: record.position,
            start_date: self.start,
            end_date: self.end,
            start_week: week_index(self.start, origin),
            duration_weeks: duration_weeks(self.start, self.end),
            planned_hours: planned,
            spent_hours: spent,
            hours: format!("{}/{}h", format_hours(spent), format_hours(planned)),
            progress,
            time_exceeded: planned > 0.0 && spent > planned,
            milestones: vec![],
        }
    }
}

fn format_hours(hours: f64) -> String {
    if hours.fract().abs() < f64::EPSILON {
        format!("{}", hours as i64)
    } else {
        format!("{hours:.1}")
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.filter(|s| !s.trim().is_empty())
}

#[derive(Debug)]
struct Slot {
    id: String,
    name: String,
    synthetic: bool,
    position: Option<i64>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    parent_ref: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
    tasks: Vec<usize>,
}

impl Slot {
    fn synthetic(id: &str, name: String) -> Self {
        Self {
            id: id.to_string(),
            name,
            synthetic: true,
            position: None,
            start: None,
            end: None,
            parent_ref: None,
            parent: None,
            children: vec![],
            tasks: vec![],
        }
    }
}

/// Index-addressed activities; parent/child links are slot indices.
struct Arena {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
}

impl Arena {
    fn from_records(records: &[ActivityRecord], now: DateTime<Utc>) -> Self {
        let mut arena = Self {
            slots: Vec::with_capacity(records.len()),
            index: HashMap::with_capacity(records.len()),
        };

        for record in records {
            if arena.index.contains_key(&record.id) {
                warn!(activity = %record.id, "duplicate activity id; keeping the first");
                continue;
            }
            let start = non_empty(record.start_date.as_deref()).map(|raw| parse_api_date(Some(raw), now));
            let end = non_empty(record.end_date.as_deref()).map(|raw| parse_api_date(Some(raw), now));
            arena.index.insert(record.id.clone(), arena.slots.len());
            arena.slots.push(Slot {
                id: record.id.clone(),
                name: record.name.clone(),
                synthetic: false,
                position: record.position,
                start,
                end,
                parent_ref: non_empty(record.parent_id.as_deref()).map(str::to_string),
                parent: None,
                children: vec![],
                tasks: vec![],
            });
        }

        arena
    }

    fn link_parents(&mut self) {
        for idx in 0..self.slots.len() {
            let Some(parent_ref) = self.slots[idx].parent_ref.clone() else {
                continue;
            };
            match self.index.get(&parent_ref) {
                Some(&parent) if parent != idx => self.slots[idx].parent = Some(parent),
                Some(_) => {
                    warn!(activity = %self.slots[idx].id, "activity lists itself as parent; treating as top-level");
                }
                None => {
                    debug!(
                        activity = %self.slots[idx].id,
                        parent = %parent_ref,
                        "unknown parent activity; treating as top-level"
                    );
                }
            }
        }

        for idx in 0..self.slots.len() {
            if self.parent_chain_returns_to(idx) {
                warn!(activity = %self.slots[idx].id, "parent cycle detected; treating as top-level");
                self.slots[idx].parent = None;
            }
        }

        for idx in 0..self.slots.len() {
            if let Some(parent) = self.slots[idx].parent {
                self.slots[parent].children.push(idx);
            }
        }
    }

    fn parent_chain_returns_to(&self, start: usize) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.slots[start].parent;
        while let Some(idx) = current {
            if idx == start {
                return true;
            }
            if !seen.insert(idx) {
                return false;
            }
            current = self.slots[idx].parent;
        }
        false
    }

    /// Slot owning `task`, creating a placeholder activity when needed.
    fn owner_slot(&mut self, task: &TaskRecord) -> usize {
        let (id, name) = match task.activity.as_ref() {
            Some(activity) => (
                activity.id.as_str(),
                activity
                    .name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| format!("Activity {}", activity.id)),
            ),
            None => (UNASSIGNED_ACTIVITY_ID, UNASSIGNED_ACTIVITY_NAME.to_string()),
        };

        if let Some(&idx) = self.index.get(id) {
            return idx;
        }

        warn!(task = %task.id, activity = %id, "task references a missing activity; adding placeholder");
        let idx = self.slots.len();
        self.index.insert(id.to_string(), idx);
        self.slots.push(Slot::synthetic(id, name));
        idx
    }

    fn roots(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&idx| self.slots[idx].parent.is_none())
            .collect()
    }

    fn build_node(&self, idx: usize, tasks: &[ResolvedTask<'_>], spent: &TaskHours, origin: NaiveDate) -> ActivityNode {
        let slot = &self.slots[idx];

        let mut children: Vec<ActivityNode> = slot
            .children
            .iter()
            .map(|&child| self.build_node(child, tasks, spent, origin))
            .collect();
        children.sort_by(|a, b| sibling_order(a.position, &a.name, b.position, &b.name));

        let mut task_nodes: Vec<TaskNode> = slot
            .tasks
            .iter()
            .map(|&task| tasks[task].node(spent, origin))
            .collect();
        task_nodes.sort_by(|a, b| sibling_order(a.position, &a.name, b.position, &b.name));

        let (start_week, duration) = activity_span(slot, &children, &task_nodes, origin);
        let task_count = task_nodes.len() + children.iter().map(|c| c.task_count).sum::<usize>();

        ActivityNode {
            id: slot.id.clone(),
            name: slot.name.clone(),
            synthetic: slot.synthetic,
            position: slot.position,
            start_week,
            duration_weeks: duration,
            task_count,
            children,
            tasks: task_nodes,
            milestones: vec![],
        }
    }
}

/// Own dates win; otherwise the span of the children; otherwise one week at
/// the origin.
fn activity_span(slot: &Slot, children: &[ActivityNode], tasks: &[TaskNode], origin: NaiveDate) -> (i64, i64) {
    if let Some(start) = slot.start {
        let end = slot.end.unwrap_or_else(|| add_days(start, 7));
        return (week_index(start, origin), duration_weeks(start, end));
    }

    let span = children
        .iter()
        .map(|c| (c.start_week, c.end_week()))
        .chain(tasks.iter().map(|t| (t.start_week, t.end_week())))
        .reduce(|(lo, hi), (start, end)| (lo.min(start), hi.max(end)));

    match span {
        Some((lo, hi)) => (lo, (hi - lo).max(1)),
        None => (0, 1),
    }
}
