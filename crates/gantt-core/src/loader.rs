use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::model::{ActivityRecord, CalendarEvent, MilestoneRecord, Project, ProjectSnapshot, TaskRecord};
use crate::tree::{GanttModel, build_model};

/// Read side of the backend, one call per collection.
pub trait RecordSource {
    fn projects(&self) -> anyhow::Result<Vec<Project>>;
    fn activities(&self, project_id: &str) -> anyhow::Result<Vec<ActivityRecord>>;
    fn tasks(&self, project_id: &str) -> anyhow::Result<Vec<TaskRecord>>;
    fn milestones(&self, project_id: &str) -> anyhow::Result<Vec<MilestoneRecord>>;
    fn events(&self, project_id: &str) -> anyhow::Result<Vec<CalendarEvent>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Loading,
    Loaded(GanttModel),
    /// Load failed; the chart shows no tasks.
    Empty { error: String },
}

impl LoadState {
    pub fn model(&self) -> Option<&GanttModel> {
        match self {
            LoadState::Loaded(model) => Some(model),
            LoadState::Loading | LoadState::Empty { .. } => None,
        }
    }
}

/// Fetches every collection for `project_id`. Secondary collections degrade
/// to empty lists; only a failed task fetch fails the load.
#[instrument(skip(source))]
pub fn fetch_snapshot(source: &dyn RecordSource, project_id: &str) -> anyhow::Result<ProjectSnapshot> {
    let project = match source.projects() {
        Ok(projects) => projects.into_iter().find(|p| p.id == project_id),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to load projects; continuing without project details");
            None
        }
    };
    if project.is_none() {
        debug!(project = project_id, "project not listed in projects collection");
    }

    let activities = or_empty("activities", source.activities(project_id));
    let tasks = source.tasks(project_id)?;
    let milestones = or_empty("milestones", source.milestones(project_id));
    let events = or_empty("events", source.events(project_id));

    info!(
        activities = activities.len(),
        tasks = tasks.len(),
        milestones = milestones.len(),
        events = events.len(),
        "fetched project snapshot"
    );

    Ok(ProjectSnapshot {
        project,
        activities,
        tasks,
        milestones,
        events,
    })
}

fn or_empty<T>(stage: &'static str, result: anyhow::Result<Vec<T>>) -> Vec<T> {
    result.unwrap_or_else(|err| {
        warn!(stage, error = %format!("{err:#}"), "stage failed; using empty list");
        vec![]
    })
}

/// Runs the whole fetch-and-transform pipeline. Never fails: errors end in
/// [`LoadState::Empty`].
#[instrument(skip(source, now))]
pub fn load_project(source: &dyn RecordSource, project_id: &str, now: DateTime<Utc>) -> LoadState {
    match fetch_snapshot(source, project_id) {
        Ok(snapshot) => LoadState::Loaded(build_model(&snapshot, now)),
        Err(err) => {
            error!(project = project_id, error = %format!("{err:#}"), "project load failed");
            LoadState::Empty {
                error: format!("{err:#}"),
            }
        }
    }
}

/// Handle for one in-flight load; only the latest one may be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
    pub project_id: String,
}

/// Current project selection and its load state. Selecting a project bumps
/// the generation so results of earlier selections are discarded.
#[derive(Debug)]
pub struct ProjectView {
    generation: u64,
    project_id: Option<String>,
    state: LoadState,
}

impl Default for ProjectView {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectView {
    pub fn new() -> Self {
        Self {
            generation: 0,
            project_id: None,
            state: LoadState::Empty { error: String::new() },
        }
    }

    pub fn select(&mut self, project_id: &str) -> LoadTicket {
        self.generation = self.generation.wrapping_add(1);
        self.project_id = Some(project_id.to_string());
        self.state = LoadState::Loading;
        debug!(project = project_id, generation = self.generation, "project selected");
        LoadTicket {
            generation: self.generation,
            project_id: project_id.to_string(),
        }
    }

    /// Stores `state` if `ticket` is still current. Returns whether it was
    /// applied.
    pub fn complete(&mut self, ticket: &LoadTicket, state: LoadState) -> bool {
        if ticket.generation != self.generation {
            debug!(
                project = %ticket.project_id,
                ticket = ticket.generation,
                current = self.generation,
                "discarding stale load result"
            );
            return false;
        }
        self.state = state;
        true
    }

    /// Select and load in one step.
    pub fn load(&mut self, source: &dyn RecordSource, project_id: &str, now: DateTime<Utc>) -> &LoadState {
        let ticket = self.select(project_id);
        let state = load_project(source, project_id, now);
        self.complete(&ticket, state);
        &self.state
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use chrono::{TimeZone, Utc};

    use super::{LoadState, ProjectView, RecordSource, load_project};
    use crate::model::{ActivityRecord, CalendarEvent, MilestoneRecord, Project, TaskRecord};

    #[derive(Default)]
    struct FakeSource {
        fail_tasks: bool,
        fail_activities: bool,
    }

    impl RecordSource for FakeSource {
        fn projects(&self) -> anyhow::Result<Vec<Project>> {
            Err(anyhow!("projects offline"))
        }

        fn activities(&self, _project_id: &str) -> anyhow::Result<Vec<ActivityRecord>> {
            if self.fail_activities {
                return Err(anyhow!("activities offline"));
            }
            Ok(vec![ActivityRecord::new("a1", "WP1")])
        }

        fn tasks(&self, project_id: &str) -> anyhow::Result<Vec<TaskRecord>> {
            if self.fail_tasks {
                return Err(anyhow!("tasks offline"));
            }
            let mut task = TaskRecord::new(format!("{project_id}-t1"), "Build", "a1");
            task.start_date = Some("01/03/2024".to_string());
            Ok(vec![task])
        }

        fn milestones(&self, _project_id: &str) -> anyhow::Result<Vec<MilestoneRecord>> {
            Err(anyhow!("milestones offline"))
        }

        fn events(&self, _project_id: &str) -> anyhow::Result<Vec<CalendarEvent>> {
            Ok(vec![])
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0)
            .single()
            .expect("valid now")
    }

    #[test]
    fn secondary_failures_degrade_to_empty_lists() {
        let source = FakeSource::default();
        let state = load_project(&source, "p1", now());
        let model = state.model().expect("loaded");
        assert!(model.project.is_none());
        assert_eq!(model.task_count(), 1);
        assert_eq!(model.activities[0].name, "WP1");
    }

    #[test]
    fn missing_activities_still_render_tasks() {
        let source = FakeSource {
            fail_activities: true,
            ..FakeSource::default()
        };
        let state = load_project(&source, "p1", now());
        let model = state.model().expect("loaded");
        assert_eq!(model.task_count(), 1);
        assert!(model.activities[0].synthetic);
    }

    #[test]
    fn task_failure_ends_empty() {
        let source = FakeSource {
            fail_tasks: true,
            ..FakeSource::default()
        };
        match load_project(&source, "p1", now()) {
            LoadState::Empty { error } => assert!(error.contains("tasks offline")),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn stale_results_are_discarded() {
        let source = FakeSource::default();
        let mut view = ProjectView::new();

        let first = view.select("p1");
        let second = view.select("p2");
        assert_eq!(view.state(), &LoadState::Loading);

        assert!(view.complete(&second, load_project(&source, "p2", now())));
        assert!(!view.complete(&first, load_project(&source, "p1", now())));

        let model = view.state().model().expect("loaded");
        assert_eq!(model.tasks()[0].id, "p2-t1");
        assert_eq!(view.project_id(), Some("p2"));
    }

    #[test]
    fn load_selects_and_commits() {
        let source = FakeSource::default();
        let mut view = ProjectView::default();
        assert!(view.load(&source, "p9", now()).model().is_some());
    }
}
