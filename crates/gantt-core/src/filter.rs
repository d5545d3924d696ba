use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDate;
use tracing::debug;

use crate::datetime::add_days;
use crate::periods::start_of_week;
use crate::tree::{
  ActivityNode,
  GanttModel,
  MilestoneStatus,
  TaskNode
};

/// Quick filters over the chart. A
/// task is shown when it matches any
/// active filter.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum GanttFilter {
  /// Ended before today and not fully
  /// logged, or carrying an overdue
  /// milestone.
  Overdue,
  /// Overlaps the Monday-to-Sunday week
  /// containing today.
  ThisWeek,
  Milestones,
  Completed,
  /// Logged hours above the plan.
  Exceeded
}

impl GanttFilter {
  pub fn as_str(self) -> &'static str {
    match self {
      | GanttFilter::Overdue => "overdue",
      | GanttFilter::ThisWeek => {
        "this-week"
      }
      | GanttFilter::Milestones => {
        "milestones"
      }
      | GanttFilter::Completed => {
        "completed"
      }
      | GanttFilter::Exceeded => {
        "exceeded"
      }
    }
  }
}

impl fmt::Display for GanttFilter {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for GanttFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "overdue" | "late" => {
        Ok(GanttFilter::Overdue)
      }
      | "this-week" | "thisweek"
      | "week" => {
        Ok(GanttFilter::ThisWeek)
      }
      | "milestones" | "milestone" => {
        Ok(GanttFilter::Milestones)
      }
      | "completed" | "done" => {
        Ok(GanttFilter::Completed)
      }
      | "exceeded" | "flagged" => {
        Ok(GanttFilter::Exceeded)
      }
      | other => {
        Err(anyhow!(
          "unknown filter: {other} \
           (expected overdue, \
           this-week, milestones, \
           completed or exceeded)"
        ))
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct FilterSet {
  filters:    Vec<GanttFilter>,
  today:      NaiveDate,
  week_start: NaiveDate,
  week_end:   NaiveDate
}

impl FilterSet {
  pub fn new(
    filters: &[GanttFilter],
    today: NaiveDate
  ) -> Self {
    let mut unique = Vec::new();
    for filter in filters {
      if !unique.contains(filter) {
        unique.push(*filter);
      }
    }
    let week_start = start_of_week(today);
    Self {
      filters: unique,
      today,
      week_start,
      week_end: add_days(week_start, 6)
    }
  }

  pub fn is_empty(&self) -> bool {
    self.filters.is_empty()
  }

  pub fn matches_task(
    &self,
    task: &TaskNode
  ) -> bool {
    self
      .filters
      .iter()
      .any(|filter| {
        self.task_matches(*filter, task)
      })
  }

  fn task_matches(
    &self,
    filter: GanttFilter,
    task: &TaskNode
  ) -> bool {
    match filter {
      | GanttFilter::Overdue => {
        (task.end_date < self.today
          && task.progress < 100)
          || task.milestones.iter().any(
            |m| {
              m.status
                == MilestoneStatus::Overdue
            }
          )
      }
      | GanttFilter::ThisWeek => {
        task.start_date <= self.week_end
          && task.end_date
            >= self.week_start
      }
      | GanttFilter::Milestones => {
        !task.milestones.is_empty()
      }
      | GanttFilter::Completed => {
        task.progress >= 100
          && !task.time_exceeded
      }
      | GanttFilter::Exceeded => {
        task.time_exceeded
      }
    }
  }

  /// Drops unmatched tasks and every
  /// activity left without content.
  /// Positions and spans are kept as
  /// built.
  #[tracing::instrument(skip_all, fields(filters = ?self.filters))]
  pub fn apply(
    &self,
    model: GanttModel
  ) -> GanttModel {
    if self.is_empty() {
      return model;
    }

    let before = model.task_count();
    let activities = model
      .activities
      .into_iter()
      .filter_map(|activity| {
        self.prune(activity)
      })
      .collect();
    let filtered = GanttModel {
      activities,
      ..model
    };
    debug!(
      before,
      after = filtered.task_count(),
      "applied gantt filters"
    );
    filtered
  }

  fn prune(
    &self,
    mut activity: ActivityNode
  ) -> Option<ActivityNode> {
    activity.children = activity
      .children
      .into_iter()
      .filter_map(|child| {
        self.prune(child)
      })
      .collect();
    activity
      .tasks
      .retain(|task| self.matches_task(task));
    activity.task_count = activity
      .tasks
      .len()
      + activity
        .children
        .iter()
        .map(|c| c.task_count)
        .sum::<usize>();

    let keeps_milestones = self
      .filters
      .contains(&GanttFilter::Milestones)
      && !activity.milestones.is_empty();

    if activity.tasks.is_empty()
      && activity.children.is_empty()
      && !keeps_milestones
    {
      return None;
    }
    Some(activity)
  }
}

/// Parses a comma separated filter
/// list such as `overdue,this-week`.
pub fn parse_filters(
  raw: &str
) -> anyhow::Result<Vec<GanttFilter>> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|term| !term.is_empty())
    .map(str::parse)
    .collect()
}
