use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cli::Invocation;
use crate::config::Config;
use crate::datastore::{SnapshotStore, save_json_atomic};
use crate::datetime::{project_noon, to_project_date, try_parse_api_date};
use crate::filter::{FilterSet, GanttFilter, parse_filters};
use crate::loader::{LoadState, ProjectView, RecordSource};
use crate::periods::{Resolution, TimePeriod, generate_periods};
use crate::render::Renderer;
use crate::tree::GanttModel;

/// Largest `offset:` or `page:` accepted, in resolution units.
pub const MAX_TIMELINE_SHIFT: i64 = 100_000;

pub fn known_command_names() -> Vec<&'static str> {
    vec!["chart", "tree", "periods", "hours", "export", "projects", "help", "version"]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

/// `key:value` terms accepted after a command. A bare term names the project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandArgs {
    pub project: Option<String>,
    pub resolution: Option<Resolution>,
    pub offset: Option<i64>,
    pub count: Option<usize>,
    pub anchor: Option<NaiveDate>,
    /// Whole navigation steps added to the offset.
    pub page: Option<i64>,
    /// Tasks matching any of these are kept; empty keeps everything.
    pub filters: Vec<GanttFilter>,
    pub out: Option<PathBuf>,
}

pub fn parse_command_args(args: &[String]) -> anyhow::Result<CommandArgs> {
    let mut parsed = CommandArgs::default();

    for arg in args {
        let Some((key, value)) = arg.split_once(':') else {
            if parsed.project.is_some() {
                return Err(anyhow!("unexpected argument: {arg}"));
            }
            parsed.project = Some(arg.clone());
            continue;
        };

        match key {
            "project" | "pro" => parsed.project = Some(value.to_string()),
            "resolution" | "res" => parsed.resolution = Some(value.parse()?),
            "offset" => parsed.offset = Some(parse_shift("offset", value)?),
            "count" => {
                let count: usize = value
                    .parse()
                    .with_context(|| format!("invalid count: {value}"))?;
                if count == 0 {
                    return Err(anyhow!("count must be at least 1"));
                }
                parsed.count = Some(count);
            }
            "anchor" => parsed.anchor = Some(try_parse_api_date(value)?),
            "page" => parsed.page = Some(parse_shift("page", value)?),
            "filter" | "filters" => parsed.filters.extend(parse_filters(value)?),
            "out" => parsed.out = Some(PathBuf::from(value)),
            other => return Err(anyhow!("unknown argument key: {other}")),
        }
    }

    Ok(parsed)
}

fn parse_shift(key: &str, value: &str) -> anyhow::Result<i64> {
    let shift: i64 = value
        .parse()
        .with_context(|| format!("invalid {key}: {value}"))?;
    check_shift(key, shift)
}

fn check_shift(key: &str, shift: i64) -> anyhow::Result<i64> {
    if !(-MAX_TIMELINE_SHIFT..=MAX_TIMELINE_SHIFT).contains(&shift) {
        return Err(anyhow!("{key} out of range: {shift} (limit {MAX_TIMELINE_SHIFT})"));
    }
    Ok(shift)
}

/// Visible window of the timeline. `anchor` falls back to the project origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSettings {
    pub resolution: Resolution,
    pub offset: i64,
    pub count: usize,
    pub anchor: Option<NaiveDate>,
}

impl TimelineSettings {
    pub fn periods(&self, origin: NaiveDate, today: NaiveDate) -> anyhow::Result<Vec<TimePeriod>> {
        generate_periods(self.anchor.unwrap_or(origin), self.offset, self.resolution, today, self.count)
    }
}

pub fn resolve_timeline(cfg: &Config, args: &CommandArgs) -> anyhow::Result<TimelineSettings> {
    let resolution = match args.resolution {
        Some(resolution) => resolution,
        None => cfg.get_parsed::<Resolution>("timeline.resolution")?.unwrap_or(Resolution::Week),
    };
    let base_offset = match args.offset {
        Some(offset) => offset,
        None => check_shift("timeline.offset", cfg.get_parsed::<i64>("timeline.offset")?.unwrap_or(0))?,
    };
    let offset = args
        .page
        .unwrap_or(0)
        .checked_mul(resolution.navigation_step())
        .and_then(|paged| base_offset.checked_add(paged))
        .ok_or_else(|| anyhow!("timeline offset out of range"))?;
    let count = match args.count {
        Some(count) => count,
        None => cfg
            .get_parsed::<usize>("timeline.periods")?
            .filter(|count| *count > 0)
            .unwrap_or_else(|| resolution.default_count()),
    };
    let anchor = match args.anchor {
        Some(anchor) => Some(anchor),
        None => cfg
            .get("timeline.anchor")
            .map(|raw| try_parse_api_date(&raw))
            .transpose()
            .context("invalid timeline.anchor")?,
    };

    Ok(TimelineSettings {
        resolution,
        offset,
        count,
        anchor,
    })
}

/// Current instant, or noon of the configured `today` date.
pub fn resolve_now(cfg: &Config) -> anyhow::Result<DateTime<Utc>> {
    match cfg.get("today") {
        Some(raw) => {
            let date = try_parse_api_date(&raw).context("invalid today setting")?;
            project_noon(date)
        }
        None => Ok(Utc::now()),
    }
}

/// `--project`, then the command's project term, then `default.project`, then
/// the only listed project.
#[instrument(skip(source, cfg))]
pub fn resolve_project(
    source: &dyn RecordSource,
    cfg: &Config,
    cli_project: Option<&str>,
    arg_project: Option<&str>,
) -> anyhow::Result<String> {
    if let Some(id) = cli_project.or(arg_project) {
        return Ok(id.to_string());
    }
    if let Some(id) = cfg.get("default.project") {
        return Ok(id);
    }

    let projects = source.projects()?;
    match projects.as_slice() {
        [only] => {
            debug!(project = %only.id, "using the only listed project");
            Ok(only.id.clone())
        }
        [] => Err(anyhow!("no projects found; pass --project or set default.project")),
        many => {
            let ids: Vec<&str> = many.iter().map(|p| p.id.as_str()).collect();
            Err(anyhow!(
                "several projects available ({}); pass --project or set default.project",
                ids.join(", ")
            ))
        }
    }
}

#[instrument(skip(store, cfg, renderer, inv))]
pub fn dispatch(
    store: &SnapshotStore,
    cfg: &Config,
    renderer: &Renderer,
    inv: Invocation,
    cli_project: Option<&str>,
) -> anyhow::Result<()> {
    let now = resolve_now(cfg)?;
    let command = inv.command.as_str();
    let args = parse_command_args(&inv.command_args)?;

    debug!(command, args = ?inv.command_args, "dispatching command");

    match command {
        "chart" => cmd_chart(store, cfg, renderer, &args, cli_project, now),
        "tree" => {
            let model = load_model(store, cfg, &args, cli_project, now)?;
            renderer.print_tree(&model)
        }
        "hours" => {
            let model = load_model(store, cfg, &args, cli_project, now)?;
            renderer.print_hours(&model)
        }
        "periods" => cmd_periods(cfg, renderer, &args, now),
        "export" => cmd_export(store, cfg, &args, cli_project, now),
        "projects" => renderer.print_projects(&store.projects()?),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

fn load_model(
    source: &dyn RecordSource,
    cfg: &Config,
    args: &CommandArgs,
    cli_project: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<GanttModel> {
    let project_id = resolve_project(source, cfg, cli_project, args.project.as_deref())?;
    let mut view = ProjectView::new();
    let model = match view.load(source, &project_id, now) {
        LoadState::Loaded(model) => model.clone(),
        LoadState::Empty { error } => {
            warn!(project = %project_id, error = %error, "showing empty chart");
            GanttModel::empty(to_project_date(now))
        }
        LoadState::Loading => GanttModel::empty(to_project_date(now)),
    };
    Ok(FilterSet::new(&args.filters, to_project_date(now)).apply(model))
}

#[instrument(skip(source, cfg, renderer, args, now))]
fn cmd_chart(
    source: &dyn RecordSource,
    cfg: &Config,
    renderer: &Renderer,
    args: &CommandArgs,
    cli_project: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command chart");
    let model = load_model(source, cfg, args, cli_project, now)?;
    let timeline = resolve_timeline(cfg, args)?;
    let periods = timeline.periods(model.origin, to_project_date(now))?;
    renderer.print_chart(&model, &periods, timeline.resolution)
}

#[instrument(skip(cfg, renderer, args, now))]
fn cmd_periods(cfg: &Config, renderer: &Renderer, args: &CommandArgs, now: DateTime<Utc>) -> anyhow::Result<()> {
    info!("command periods");
    let today = to_project_date(now);
    let timeline = resolve_timeline(cfg, args)?;
    renderer.print_periods(&timeline.periods(today, today)?)
}

/// Built model plus the visible columns, as written by `export`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartExport<'a> {
    #[serde(flatten)]
    pub model: &'a GanttModel,
    pub resolution: Resolution,
    pub periods: Vec<TimePeriod>,
}

#[instrument(skip(source, cfg, args, now))]
fn cmd_export(
    source: &dyn RecordSource,
    cfg: &Config,
    args: &CommandArgs,
    cli_project: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command export");
    let model = load_model(source, cfg, args, cli_project, now)?;
    let timeline = resolve_timeline(cfg, args)?;
    let export = ChartExport {
        model: &model,
        resolution: timeline.resolution,
        periods: timeline.periods(model.origin, to_project_date(now))?,
    };

    match &args.out {
        Some(path) => {
            save_json_atomic(path, &export)?;
            info!(file = %path.display(), "export written");
        }
        None => {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer(&mut stdout, &export)?;
            writeln!(stdout)?;
        }
    }
    Ok(())
}

fn cmd_help() -> anyhow::Result<()> {
    println!("Commands: chart, tree, periods, hours, export, projects, help, version");
    println!("Arguments: [project] resolution:day|week|month offset:N count:N anchor:DD/MM/YYYY page:N filter:overdue,this-week,milestones,completed,exceeded out:PATH");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use serde_json::Value;
    use tempfile::tempdir;

    use super::{
        CommandArgs, cmd_export, expand_command_abbrev, known_command_names, load_model, parse_command_args,
        resolve_now, resolve_project, resolve_timeline,
    };
    use crate::config::Config;
    use crate::datastore::SnapshotStore;
    use crate::datetime::to_project_date;
    use crate::filter::GanttFilter;
    use crate::periods::Resolution;

    fn args(terms: &[&str]) -> Vec<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn abbreviations_must_be_unambiguous() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("tr", &known), Some("tree"));
        assert_eq!(expand_command_abbrev("p", &known), None);
        assert_eq!(expand_command_abbrev("proj", &known), Some("projects"));
        assert_eq!(expand_command_abbrev("gantt", &known), None);
    }

    #[test]
    fn parses_key_value_terms() {
        let parsed =
            parse_command_args(&args(&["p1", "res:day", "offset:-7", "count:14", "anchor:01/03/2024"])).expect("parse");
        assert_eq!(parsed.project.as_deref(), Some("p1"));
        assert_eq!(parsed.resolution, Some(Resolution::Day));
        assert_eq!(parsed.offset, Some(-7));
        assert_eq!(parsed.count, Some(14));
        assert_eq!(parsed.anchor, NaiveDate::from_ymd_opt(2024, 3, 1));

        assert!(parse_command_args(&args(&["count:0"])).is_err());
        assert!(parse_command_args(&args(&["p1", "p2"])).is_err());
        assert!(parse_command_args(&args(&["colour:red"])).is_err());
    }

    #[test]
    fn filter_terms_accumulate() {
        let parsed = parse_command_args(&args(&["filter:overdue,week", "filters:done"])).expect("parse");
        assert_eq!(
            parsed.filters,
            vec![GanttFilter::Overdue, GanttFilter::ThisWeek, GanttFilter::Completed]
        );
        assert!(parse_command_args(&args(&["filter:mine"])).is_err());
    }

    #[test]
    fn load_applies_filters() {
        let temp = tempdir().expect("tempdir");
        let store = SnapshotStore::open(temp.path()).expect("open");
        fs::create_dir_all(temp.path().join("p1")).expect("project dir");
        fs::write(
            temp.path().join("p1").join("tasks.json"),
            r#"[
                {"id":"t1","name":"Late","activity":{"id":"a1","name":"WP1"},"startDate":"04/03/2024","endDate":"11/03/2024","plannedHours":"8"},
                {"id":"t2","name":"Next","activity":{"id":"a2","name":"WP2"},"startDate":"01/04/2024","endDate":"08/04/2024","plannedHours":"8"}
            ]"#,
        )
        .expect("write tasks");
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![("today".to_string(), "20/03/2024".to_string())]);
        let now = resolve_now(&cfg).expect("now");

        let cmd_args = parse_command_args(&args(&["p1", "filter:overdue"])).expect("parse");
        let model = load_model(&store, &cfg, &cmd_args, None, now).expect("model");
        assert_eq!(model.activities.len(), 1);
        assert_eq!(model.tasks()[0].id, "t1");

        let unfiltered = load_model(&store, &cfg, &parse_command_args(&args(&["p1"])).expect("parse"), None, now)
            .expect("model");
        assert_eq!(unfiltered.task_count(), 2);
    }

    #[test]
    fn huge_shifts_are_rejected() {
        for term in ["offset:20000000000", "page:-100001", "offset:-9223372036854775808"] {
            let err = parse_command_args(&args(&[term])).expect_err("out of range");
            assert!(err.to_string().contains("out of range"), "{term}: {err}");
        }
        assert_eq!(
            parse_command_args(&args(&["page:-100000"])).expect("parse").page,
            Some(-100_000)
        );

        let mut cfg = Config::default();
        cfg.apply_overrides(vec![("timeline.offset".to_string(), "20000000000".to_string())]);
        assert!(resolve_timeline(&cfg, &CommandArgs::default()).is_err());

        let paged = CommandArgs {
            offset: Some(100_000),
            page: Some(100_000),
            ..CommandArgs::default()
        };
        let timeline = resolve_timeline(&Config::default(), &paged).expect("timeline");
        assert!(timeline.periods(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"), NaiveDate::MIN).is_ok());
    }

    #[test]
    fn timeline_prefers_args_over_config() {
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![
            ("timeline.resolution".to_string(), "month".to_string()),
            ("timeline.offset".to_string(), "3".to_string()),
        ]);

        let timeline = resolve_timeline(&cfg, &CommandArgs::default()).expect("timeline");
        assert_eq!(timeline.resolution, Resolution::Month);
        assert_eq!(timeline.offset, 3);
        assert_eq!(timeline.count, 12);
        assert_eq!(timeline.anchor, None);

        let overridden = CommandArgs {
            resolution: Some(Resolution::Day),
            offset: Some(-1),
            ..CommandArgs::default()
        };
        let timeline = resolve_timeline(&cfg, &overridden).expect("timeline");
        assert_eq!(timeline.resolution, Resolution::Day);
        assert_eq!(timeline.offset, -1);
        assert_eq!(timeline.count, 42);

        let paged = CommandArgs {
            page: Some(-2),
            ..CommandArgs::default()
        };
        let timeline = resolve_timeline(&cfg, &paged).expect("timeline");
        assert_eq!(timeline.offset, 3 - 4);
    }

    #[test]
    fn today_setting_pins_the_clock() {
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![("today".to_string(), "15/03/2024".to_string())]);
        let now = resolve_now(&cfg).expect("now");
        assert_eq!(to_project_date(now), NaiveDate::from_ymd_opt(2024, 3, 15).expect("date"));
    }

    #[test]
    fn project_selection_falls_back_to_single_listing() {
        let temp = tempdir().expect("tempdir");
        let store = SnapshotStore::open(temp.path()).expect("open");
        let cfg = Config::default();

        assert!(resolve_project(&store, &cfg, None, None).is_err());

        fs::write(&store.projects_path, r#"[{"id":"p1","name":"Alpha"}]"#).expect("write");
        assert_eq!(resolve_project(&store, &cfg, None, None).expect("single"), "p1");
        assert_eq!(resolve_project(&store, &cfg, Some("p9"), Some("p2")).expect("cli"), "p9");

        fs::write(
            &store.projects_path,
            r#"[{"id":"p1","name":"Alpha"},{"id":"p2","name":"Beta"}]"#,
        )
        .expect("write");
        let err = resolve_project(&store, &cfg, None, None).expect_err("ambiguous");
        assert!(err.to_string().contains("p1, p2"));
    }

    #[test]
    fn export_writes_model_and_periods() {
        let temp = tempdir().expect("tempdir");
        let store = SnapshotStore::open(temp.path()).expect("open");
        fs::create_dir_all(temp.path().join("p1")).expect("project dir");
        fs::write(
            temp.path().join("p1").join("tasks.json"),
            r#"[{"id":"t1","name":"Build","activity":{"id":"a1","name":"WP1"},"startDate":"04/03/2024","endDate":"11/03/2024","plannedHours":"8"}]"#,
        )
        .expect("write tasks");

        let out = temp.path().join("chart.json");
        let cmd_args = CommandArgs {
            project: Some("p1".to_string()),
            count: Some(3),
            out: Some(out.clone()),
            ..CommandArgs::default()
        };
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![("today".to_string(), "06/03/2024".to_string())]);
        let now = resolve_now(&cfg).expect("now");

        cmd_export(&store, &cfg, &cmd_args, None, now).expect("export");

        let json: Value = serde_json::from_str(&fs::read_to_string(&out).expect("read")).expect("json");
        assert_eq!(json["origin"], "04/03/2024");
        assert_eq!(json["resolution"], "week");
        assert_eq!(json["periods"].as_array().map(Vec::len), Some(3));
        assert_eq!(json["periods"][0]["isToday"], true);
        assert_eq!(json["activities"][0]["name"], "WP1");
        assert_eq!(json["activities"][0]["synthetic"], true);
        assert_eq!(json["activities"][0]["tasks"][0]["hours"], "0/8h");
    }
}
