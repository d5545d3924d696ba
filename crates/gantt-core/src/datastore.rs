use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::loader::RecordSource;
use crate::model::{ActivityRecord, CalendarEvent, MilestoneRecord, Project, TaskRecord};

/// One file per backend collection, stored under `<data>/<project-id>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Activities,
    Tasks,
    Milestones,
    Events,
}

impl RecordKind {
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Activities => "activities.json",
            RecordKind::Tasks => "tasks.json",
            RecordKind::Milestones => "milestones.json",
            RecordKind::Events => "events.json",
        }
    }

    /// Collections whose bad records are dropped one by one instead of
    /// failing the file.
    pub fn skips_malformed(self) -> bool {
        matches!(self, RecordKind::Milestones | RecordKind::Events)
    }
}

/// Reads project snapshots laid out as
/// `projects.json` plus one directory per project.
#[derive(Debug)]
pub struct SnapshotStore {
    pub data_dir: PathBuf,
    pub projects_path: PathBuf,
}

impl SnapshotStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        if !data_dir.is_dir() {
            return Err(anyhow!("data directory does not exist: {}", data_dir.display()));
        }

        let data_dir = data_dir.to_path_buf();
        let projects_path = data_dir.join("projects.json");

        info!(
            data_dir = %data_dir.display(),
            projects = %projects_path.display(),
            "opened snapshot store"
        );

        Ok(Self {
            data_dir,
            projects_path,
        })
    }

    pub fn record_path(&self, project_id: &str, kind: RecordKind) -> PathBuf {
        self.data_dir.join(project_id).join(kind.file_name())
    }

    fn load_kind<T: DeserializeOwned>(&self, project_id: &str, kind: RecordKind) -> anyhow::Result<Vec<T>> {
        if project_id.is_empty() || project_id.contains(['/', '\\']) || project_id == ".." {
            return Err(anyhow!("invalid project id: {project_id:?}"));
        }
        let path = self.record_path(project_id, kind);
        let records = if kind.skips_malformed() {
            load_records_skipping(&path)
        } else {
            load_records(&path)
        };
        records.with_context(|| format!("failed to load {}", kind.file_name()))
    }
}

impl RecordSource for SnapshotStore {
    #[tracing::instrument(skip(self))]
    fn projects(&self) -> anyhow::Result<Vec<Project>> {
        load_records(&self.projects_path).context("failed to load projects.json")
    }

    #[tracing::instrument(skip(self))]
    fn activities(&self, project_id: &str) -> anyhow::Result<Vec<ActivityRecord>> {
        self.load_kind(project_id, RecordKind::Activities)
    }

    #[tracing::instrument(skip(self))]
    fn tasks(&self, project_id: &str) -> anyhow::Result<Vec<TaskRecord>> {
        self.load_kind(project_id, RecordKind::Tasks)
    }

    #[tracing::instrument(skip(self))]
    fn milestones(&self, project_id: &str) -> anyhow::Result<Vec<MilestoneRecord>> {
        self.load_kind(project_id, RecordKind::Milestones)
    }

    #[tracing::instrument(skip(self))]
    fn events(&self, project_id: &str) -> anyhow::Result<Vec<CalendarEvent>> {
        self.load_kind(project_id, RecordKind::Events)
    }
}

/// Loads a JSON array or JSON Lines file. A missing file is an empty
/// collection.
#[tracing::instrument(skip(path))]
pub fn load_records<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    debug!(file = %path.display(), "loading records");
    if !path.exists() {
        debug!(file = %path.display(), "record file missing; treating as empty");
        return Ok(vec![]);
    }

    let raw = fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let trimmed = raw.trim_start();

    if trimmed.starts_with('[') {
        let records: Vec<T> =
            serde_json::from_str(trimmed).with_context(|| format!("failed parsing {}", path.display()))?;
        debug!(count = records.len(), "loaded json array");
        return Ok(records);
    }

    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: T = serde_json::from_str(trimmed)
            .with_context(|| format!("failed parsing {} line {}", path.display(), idx + 1))?;
        out.push(record);
    }

    debug!(count = out.len(), "loaded json lines");
    Ok(out)
}

/// Like [`load_records`], but a well-formed JSON record that does not fit `T`
/// is logged and skipped.
pub fn load_records_skipping<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let values: Vec<Value> = load_records(path)?;
    let total = values.len();
    let mut out = Vec::with_capacity(total);

    for (idx, value) in values.into_iter().enumerate() {
        match serde_json::from_value(value) {
            Ok(record) => out.push(record),
            Err(err) => {
                warn!(file = %path.display(), record = idx + 1, error = %err, "skipping malformed record");
            }
        }
    }

    debug!(kept = out.len(), total, "loaded records");
    Ok(out)
}

/// Writes pretty JSON through a temp file in the target directory.
#[tracing::instrument(skip(path, value))]
pub fn save_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    debug!(file = %path.display(), "saving json atomically");

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    writeln!(temp)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
