use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::str::FromStr;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace
};

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    let mut map = HashMap::new();
    for (key, value) in [
      ("data.location", "~/.gantt"),
      ("default.command", "chart"),
      ("color", "on"),
      ("timeline.resolution", "week"),
      ("timeline.offset", "0")
    ] {
      map.insert(
        key.to_string(),
        value.to_string()
      );
    }
    Self {
      map,
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    ganttrc_override
  ))]
  pub fn load(
    ganttrc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    let ganttrc = resolve_ganttrc_path(
      ganttrc_override
    )?;
    if let Some(path) = ganttrc {
      info!(ganttrc = %path.display(), "loading ganttrc");
      cfg.load_file(&path, &mut vec![])?;
    } else {
      debug!(
        "no ganttrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self
      .map
      .get(key)
      .filter(|v| !v.trim().is_empty())
      .cloned()
  }

  /// Typed lookup; a present but
  /// malformed value is an error.
  pub fn get_parsed<T>(
    &self,
    key: &str
  ) -> anyhow::Result<Option<T>>
  where
    T: FromStr,
    T::Err: std::fmt::Display
  {
    let Some(raw) = self.get(key) else {
      return Ok(None);
    };
    raw
      .trim()
      .parse::<T>()
      .map(Some)
      .map_err(|err| {
        anyhow!(
          "invalid value for {key}: \
           {raw} ({err})"
        )
      })
  }

  /// `stack` holds the files currently
  /// being included, outermost first.
  #[tracing::instrument(skip(
    self, stack
  ))]
  fn load_file(
    &mut self,
    path: &Path,
    stack: &mut Vec<PathBuf>
  ) -> anyhow::Result<()> {
    let path = canonical(&expand_tilde(path));
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    if !self.loaded_files.contains(&path)
    {
      self
        .loaded_files
        .push(path.clone());
    }
    stack.push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let mut line = raw_line.trim();
      if let Some((before, _)) =
        line.split_once('#')
      {
        line = before.trim();
      }

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        let include_path =
          canonical(&include_path);
        if stack.contains(&include_path) {
          return Err(anyhow!(
            "include cycle at {}:{}",
            path.display(),
            line_num + 1
          ));
        }

        if include_path.exists() {
          self.load_file(
            &include_path,
            stack
          )?;
        } else {
          tracing::warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    stack.pop();
    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  debug!(dir = %dir.display(), "resolved data directory");
  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_ganttrc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(ganttrc_env) =
    std::env::var("GANTTRC")
  {
    if ganttrc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      ganttrc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    return Ok(None);
  };
  let candidate = home.join(".ganttrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".gantt"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn canonical(path: &Path) -> PathBuf {
  fs::canonicalize(path)
    .unwrap_or_else(|_| {
      path.to_path_buf()
    })
}
