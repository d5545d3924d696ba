use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::NaiveDate;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::datetime::format_api_date;
use crate::model::Project;
use crate::periods::{Resolution, TimePeriod, group_headers};
use crate::tree::{ActivityNode, GanttModel, MilestoneNode, MilestoneStatus};

const ACTIVITY_CELL: char = '=';
const TASK_CELL: char = '#';
const MILESTONE_CELL: char = '*';
const TODAY_CELL: char = '|';
const EMPTY_CELL: char = '.';

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self {
            color: color && io::stdout().is_terminal(),
        })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip_all)]
    pub fn print_chart(&self, model: &GanttModel, periods: &[TimePeriod], resolution: Resolution) -> anyhow::Result<()> {
        self.write_chart(io::stdout().lock(), model, periods, resolution)
    }

    #[tracing::instrument(skip_all)]
    pub fn print_tree(&self, model: &GanttModel) -> anyhow::Result<()> {
        self.write_tree(io::stdout().lock(), model)
    }

    #[tracing::instrument(skip_all)]
    pub fn print_hours(&self, model: &GanttModel) -> anyhow::Result<()> {
        self.write_hours(io::stdout().lock(), model)
    }

    #[tracing::instrument(skip_all)]
    pub fn print_periods(&self, periods: &[TimePeriod]) -> anyhow::Result<()> {
        self.write_periods(io::stdout().lock(), periods)
    }

    #[tracing::instrument(skip_all)]
    pub fn print_projects(&self, projects: &[Project]) -> anyhow::Result<()> {
        let headers = vec!["ID".to_string(), "Code".to_string(), "Name".to_string()];
        let rows = projects
            .iter()
            .map(|p| vec![self.paint(&p.id, "33"), p.code.clone().unwrap_or_default(), p.name.clone()])
            .collect();
        write_table(io::stdout().lock(), headers, rows)
    }

    pub fn write_chart<W: Write>(
        &self,
        mut out: W,
        model: &GanttModel,
        periods: &[TimePeriod],
        resolution: Resolution,
    ) -> anyhow::Result<()> {
        if let Some(project) = &model.project {
            writeln!(out, "{} ({})", project.name, project.id)?;
        }
        writeln!(out, "origin {}", format_api_date(model.origin))?;

        let rows = flatten_rows(model);
        if rows.is_empty() {
            writeln!(out, "no tasks")?;
            return Ok(());
        }

        let headers = vec![
            "Name".to_string(),
            "Start".to_string(),
            "Weeks".to_string(),
            "Hours".to_string(),
            "%".to_string(),
            group_header_line(periods, resolution),
        ];

        let body = rows
            .iter()
            .map(|row| {
                let name = format!("{}{}", "  ".repeat(row.depth), row.name);
                let name = match row.kind {
                    RowKind::Activity { synthetic: true } => self.paint(&name, "33"),
                    RowKind::Activity { .. } => self.paint(&name, "1"),
                    RowKind::Task { time_exceeded: true } => self.paint(&name, "31"),
                    RowKind::Task { .. } => name,
                };
                vec![
                    name,
                    row.start_week.max(0).to_string(),
                    row.duration_weeks.to_string(),
                    row.hours.clone(),
                    row.progress.map(|p| p.to_string()).unwrap_or_default(),
                    bar_cells(model, row, periods),
                ]
            })
            .collect();

        write_table(out, headers, body)
    }

    pub fn write_tree<W: Write>(&self, mut out: W, model: &GanttModel) -> anyhow::Result<()> {
        for activity in &model.activities {
            self.write_activity(&mut out, activity, 0)?;
        }
        Ok(())
    }

    fn write_activity<W: Write>(&self, out: &mut W, activity: &ActivityNode, depth: usize) -> anyhow::Result<()> {
        let indent = "  ".repeat(depth);
        let marker = if activity.synthetic { " (placeholder)" } else { "" };
        writeln!(
            out,
            "{indent}{}{marker}  [w{} +{}]  {} tasks",
            self.paint(&activity.name, "1"),
            activity.start_week,
            activity.duration_weeks,
            activity.task_count
        )?;
        for milestone in &activity.milestones {
            self.write_milestone(out, milestone, depth + 1)?;
        }
        for child in &activity.children {
            self.write_activity(out, child, depth + 1)?;
        }
        for task in &activity.tasks {
            writeln!(
                out,
                "{indent}  {}  [w{} +{}]  {}  {}%",
                task.name, task.start_week, task.duration_weeks, task.hours, task.progress
            )?;
            for milestone in &task.milestones {
                self.write_milestone(out, milestone, depth + 2)?;
            }
        }
        Ok(())
    }

    fn write_milestone<W: Write>(&self, out: &mut W, milestone: &MilestoneNode, depth: usize) -> anyhow::Result<()> {
        let status = match milestone.status {
            MilestoneStatus::Upcoming => "upcoming".to_string(),
            MilestoneStatus::Overdue => self.paint("overdue", "31"),
            MilestoneStatus::Completed => self.paint("completed", "32"),
        };
        writeln!(
            out,
            "{}{MILESTONE_CELL} {}  {}  w{}  {status}",
            "  ".repeat(depth),
            milestone.name,
            format_api_date(milestone.due_date),
            milestone.week
        )?;
        Ok(())
    }

    pub fn write_hours<W: Write>(&self, out: W, model: &GanttModel) -> anyhow::Result<()> {
        let headers = vec![
            "Task".to_string(),
            "Planned".to_string(),
            "Spent".to_string(),
            "Progress".to_string(),
        ];
        let rows = model
            .tasks()
            .into_iter()
            .map(|task| {
                let spent = format!("{:.1}", task.spent_hours);
                let spent = if task.time_exceeded { self.paint(&spent, "31") } else { spent };
                vec![
                    task.name.clone(),
                    format!("{:.1}", task.planned_hours),
                    spent,
                    format!("{}%", task.progress),
                ]
            })
            .collect();
        write_table(out, headers, rows)
    }

    pub fn write_periods<W: Write>(&self, out: W, periods: &[TimePeriod]) -> anyhow::Result<()> {
        let headers = vec![
            "Label".to_string(),
            "Start".to_string(),
            "End".to_string(),
            "Week".to_string(),
            "Month".to_string(),
            "Year".to_string(),
            "Today".to_string(),
        ];
        let rows = periods
            .iter()
            .map(|period| {
                let label = if period.group_start {
                    self.paint(&period.label, "1")
                } else {
                    period.label.clone()
                };
                vec![
                    label,
                    format_api_date(period.start),
                    format_api_date(period.end),
                    period.week_number.to_string(),
                    period.month.clone(),
                    period.year.to_string(),
                    if period.is_today { "*".to_string() } else { String::new() },
                ]
            })
            .collect();
        write_table(out, headers, rows)
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Activity { synthetic: bool },
    Task { time_exceeded: bool },
}

/// One chart line: an activity or a task, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRow {
    pub depth: usize,
    pub name: String,
    pub kind: RowKind,
    pub start_week: i64,
    pub duration_weeks: i64,
    pub hours: String,
    pub progress: Option<u8>,
    pub milestones: Vec<NaiveDate>,
}

pub fn flatten_rows(model: &GanttModel) -> Vec<ChartRow> {
    let mut rows = Vec::new();
    for activity in &model.activities {
        flatten_activity(activity, 0, &mut rows);
    }
    rows
}

fn flatten_activity(activity: &ActivityNode, depth: usize, rows: &mut Vec<ChartRow>) {
    rows.push(ChartRow {
        depth,
        name: activity.name.clone(),
        kind: RowKind::Activity {
            synthetic: activity.synthetic,
        },
        start_week: activity.start_week,
        duration_weeks: activity.duration_weeks,
        hours: String::new(),
        progress: None,
        milestones: activity.milestones.iter().map(|m| m.due_date).collect(),
    });
    for child in &activity.children {
        flatten_activity(child, depth + 1, rows);
    }
    for task in &activity.tasks {
        rows.push(ChartRow {
            depth: depth + 1,
            name: task.name.clone(),
            kind: RowKind::Task {
                time_exceeded: task.time_exceeded,
            },
            start_week: task.start_week,
            duration_weeks: task.duration_weeks,
            hours: task.hours.clone(),
            progress: Some(task.progress),
            milestones: task.milestones.iter().map(|m| m.due_date).collect(),
        });
    }
}

/// One character per period: bar, milestone, today marker or filler.
pub fn bar_cells(model: &GanttModel, row: &ChartRow, periods: &[TimePeriod]) -> String {
    let start = model.week_start(row.start_week);
    let end = model.week_start(row.start_week + row.duration_weeks);
    let fill = match row.kind {
        RowKind::Activity { .. } => ACTIVITY_CELL,
        RowKind::Task { .. } => TASK_CELL,
    };

    periods
        .iter()
        .map(|period| {
            if row.milestones.iter().any(|due| period.contains(*due)) {
                MILESTONE_CELL
            } else if period.overlaps(start, end) {
                fill
            } else if period.is_today {
                TODAY_CELL
            } else {
                EMPTY_CELL
            }
        })
        .collect()
}

/// Group titles laid over the period columns. Every title but the last is
/// cut to its group's span.
fn group_header_line(periods: &[TimePeriod], resolution: Resolution) -> String {
    let groups = group_headers(periods, resolution);
    let last = groups.len().saturating_sub(1);
    let mut line = String::new();
    for (idx, (title, span)) in groups.into_iter().enumerate() {
        if idx == last {
            line.push_str(&title);
            break;
        }
        let mut cell: String = title.chars().take(span).collect();
        let width = UnicodeWidthStr::width(cell.as_str());
        cell.push_str(&" ".repeat(span.saturating_sub(width)));
        line.push_str(&cell);
    }
    line.trim_end().to_string()
}

fn write_table<W: Write>(mut writer: W, headers: Vec<String>, rows: Vec<Vec<String>>) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for width in &widths {
        write!(writer, "{:-<width$} ", "", width = width)?;
    }
    writeln!(writer)?;

    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(column_count) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{Renderer, RowKind, bar_cells, flatten_rows, strip_ansi};
    use crate::model::{ActivityRecord, ProjectSnapshot, TaskRecord};
    use crate::periods::{Resolution, generate_periods};
    use crate::tree::{GanttModel, build_model};

    fn model() -> GanttModel {
        let mut parent = ActivityRecord::new("wp1", "WP1");
        parent.position = Some(1);
        let mut child = ActivityRecord::new("wp1.1", "Design");
        child.parent_id = Some("wp1".to_string());
        let mut task = TaskRecord::new("t1", "Sketch", "wp1.1");
        task.start_date = Some("04/03/2024".to_string());
        task.end_date = Some("18/03/2024".to_string());
        task.planned_hours = Some(10.0);

        let snapshot = ProjectSnapshot {
            activities: vec![parent, child],
            tasks: vec![task],
            ..ProjectSnapshot::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).single().expect("now");
        build_model(&snapshot, now)
    }

    #[test]
    fn rows_follow_tree_order_with_depth() {
        let rows = flatten_rows(&model());
        let shape: Vec<(usize, &str)> = rows.iter().map(|r| (r.depth, r.name.as_str())).collect();
        assert_eq!(shape, vec![(0, "WP1"), (1, "Design"), (2, "Sketch")]);
        assert_eq!(rows[2].kind, RowKind::Task { time_exceeded: false });
        assert_eq!(rows[2].progress, Some(0));
    }

    #[test]
    fn bars_cover_task_weeks() {
        let model = model();
        let today = NaiveDate::from_ymd_opt(2024, 3, 27).expect("date");
        let periods = generate_periods(model.origin, -1, Resolution::Week, today, 6).expect("periods");
        let rows = flatten_rows(&model);
        assert_eq!(bar_cells(&model, &rows[2], &periods), ".##.|.");
        assert_eq!(bar_cells(&model, &rows[0], &periods), ".==.|.");
    }

    #[test]
    fn one_week_task_from_a_friday_fills_one_column() {
        let mut task = TaskRecord::new("t1", "Survey", "wp1");
        task.start_date = Some("01/03/2024".to_string());
        task.end_date = Some("08/03/2024".to_string());
        let snapshot = ProjectSnapshot {
            activities: vec![ActivityRecord::new("wp1", "WP1")],
            tasks: vec![task],
            ..ProjectSnapshot::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 4, 10, 12, 0, 0).single().expect("now");
        let model = build_model(&snapshot, now);
        assert_eq!(model.origin, NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"));

        let today = NaiveDate::from_ymd_opt(2024, 4, 10).expect("date");
        let periods = generate_periods(model.origin, 0, Resolution::Week, today, 4).expect("periods");
        let rows = flatten_rows(&model);
        let task_row = &rows[1];
        assert_eq!(task_row.duration_weeks, 1);

        let cells = bar_cells(&model, task_row, &periods);
        assert_eq!(cells, "#...");
        assert_eq!(cells.matches('#').count() as i64, task_row.duration_weeks);
        assert_eq!(bar_cells(&model, &rows[0], &periods), "=...");
    }

    #[test]
    fn chart_output_is_plain_without_color() {
        let model = model();
        let periods = generate_periods(
            model.origin,
            0,
            Resolution::Week,
            NaiveDate::from_ymd_opt(2024, 3, 6).expect("date"),
            4,
        )
        .expect("periods");
        let mut buf = Vec::new();
        Renderer::plain()
            .write_chart(&mut buf, &model, &periods, Resolution::Week)
            .expect("render");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.starts_with("origin 04/03/2024\n"));
        assert!(text.contains("March 2024"));
        assert!(text.contains("    Sketch"));
        assert!(text.contains("0/10h"));
        assert!(!text.contains('\x1b'));
    }

    #[test]
    fn empty_model_says_so() {
        let mut buf = Vec::new();
        let model = GanttModel::empty(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"));
        Renderer::plain()
            .write_chart(&mut buf, &model, &[], Resolution::Week)
            .expect("render");
        assert!(String::from_utf8(buf).expect("utf8").contains("no tasks"));
    }

    #[test]
    fn tree_lists_milestones_and_tasks() {
        let mut buf = Vec::new();
        Renderer::plain().write_tree(&mut buf, &model()).expect("render");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("WP1  [w0 +2]"));
        assert!(lines[2].starts_with("    Sketch  [w0 +2]  0/10h  0%"));
    }

    #[test]
    fn strip_ansi_removes_escape_sequences() {
        assert_eq!(strip_ansi("\x1b[31mlate\x1b[0m"), "late");
    }
}
