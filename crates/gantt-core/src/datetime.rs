use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  TimeZone,
  Utc
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "gantt-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "GANTT_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "GANTT_TIME_CONFIG";
const DEFAULT_PROJECT_TIMEZONE: &str =
  "Europe/Madrid";

/// Wire format used by the backend for
/// plain dates.
pub const API_DATE_FORMAT: &str =
  "%d/%m/%Y";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

pub fn project_timezone() -> &'static Tz
{
  static PROJECT_TZ: OnceLock<Tz> =
    OnceLock::new();
  PROJECT_TZ.get_or_init(
    resolve_project_timezone
  )
}

#[must_use]
pub fn to_project_date(
  dt: DateTime<Utc>
) -> NaiveDate {
  dt.with_timezone(project_timezone())
    .date_naive()
}

#[must_use]
pub fn format_api_date(
  date: NaiveDate
) -> String {
  date.format(API_DATE_FORMAT).to_string()
}

/// Midday of `date` in the project
/// timezone, so that the date survives
/// conversion back through
/// `to_project_date`.
pub fn project_noon(
  date: NaiveDate
) -> anyhow::Result<DateTime<Utc>> {
  let noon = date
    .and_hms_opt(12, 0, 0)
    .ok_or_else(|| {
      anyhow!(
        "failed to construct noon \
         for {date}"
      )
    })?;
  to_utc_from_project_local(
    noon, "noon"
  )
}

fn resolve_project_timezone() -> Tz {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
  {
    if let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    ) {
      return tz;
    }
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  parse_timezone(
    DEFAULT_PROJECT_TIMEZONE,
    "DEFAULT_PROJECT_TIMEZONE"
  )
  .unwrap_or_else(|| {
    tracing::error!(
      "failed to parse fallback \
       timezone; using UTC"
    );
    chrono_tz::UTC
  })
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "configured project timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

fn to_utc_from_project_local(
  local_naive: NaiveDateTime,
  context: &str
) -> anyhow::Result<DateTime<Utc>> {
  match project_timezone()
    .from_local_datetime(&local_naive)
  {
    | LocalResult::Single(local_dt) => {
      Ok(local_dt.with_timezone(&Utc))
    }
    | LocalResult::Ambiguous(
      first,
      second
    ) => {
      tracing::warn!(
        context,
        first = %first,
        second = %second,
        "ambiguous local datetime; using earliest"
      );
      let chosen = if first <= second {
        first
      } else {
        second
      };
      Ok(chosen.with_timezone(&Utc))
    }
    | LocalResult::None => {
      Err(anyhow!(
        "local datetime does not \
         exist in configured \
         timezone: {context}"
      ))
    }
  }
}

fn slash_date_regex()
-> Option<&'static Regex> {
  static SLASH_DATE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  SLASH_DATE
    .get_or_init(|| {
      Regex::new(
        r"^(?P<day>\d{1,2})/(?P<month>\d{1,2})/(?P<year>\d{4})(?:[ T](?P<hour>\d{1,2}):(?P<minute>\d{2}))?$"
      )
      .map_err(|err| {
        tracing::error!(
          error = %err,
          "internal regex compile failure"
        );
      })
      .ok()
    })
    .as_ref()
}

/// Splits `DD/MM/YYYY[ HH:MM]` into a
/// date and an optional clock time.
fn parse_slash_date(
  token: &str
) -> Option<anyhow::Result<(NaiveDate, Option<(u32, u32)>)>>
{
  let caps =
    slash_date_regex()?.captures(token)?;

  let field = |name: &str| -> u32 {
    caps
      .name(name)
      .and_then(|m| {
        m.as_str().parse::<u32>().ok()
      })
      .unwrap_or(0)
  };

  let day = field("day");
  let month = field("month");
  let year = field("year") as i32;

  let Some(date) =
    NaiveDate::from_ymd_opt(
      year, month, day
    )
  else {
    return Some(Err(anyhow!(
      "invalid calendar date: {token}"
    )));
  };

  let clock = caps.name("hour").map(
    |_| (field("hour"), field("minute"))
  );
  Some(Ok((date, clock)))
}

/// Strict date parser: `DD/MM/YYYY`
/// first, then the ISO forms.
#[tracing::instrument(level = "trace", skip_all, fields(input = input))]
pub fn try_parse_api_date(
  input: &str
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  if token.is_empty() {
    return Err(anyhow!(
      "empty date value"
    ));
  }

  if let Some(parsed) =
    parse_slash_date(token)
  {
    return parsed
      .map(|(date, _)| date);
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(to_project_date(
      dt.with_timezone(&Utc)
    ));
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    return Ok(date);
  }

  for fmt in NAIVE_DATETIME_FORMATS {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return Ok(ndt.date());
    }
  }

  Err(anyhow!(
    "unrecognized date: {input}"
  ))
  .context(
    "supported formats: DD/MM/YYYY, \
     YYYY-MM-DD, RFC3339, \
     YYYY-MM-DDTHH:MM[:SS]"
  )
}

const NAIVE_DATETIME_FORMATS: [&str;
  4] = [
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%dT%H:%M",
  "%Y-%m-%d %H:%M:%S",
  "%Y-%m-%d %H:%M"
];

/// Lenient date parser. Missing or
/// unparseable values resolve to the
/// current project date and are logged;
/// call sites always receive a date.
pub fn parse_api_date(
  input: Option<&str>,
  now: DateTime<Utc>
) -> NaiveDate {
  let raw = input.unwrap_or_default();
  match try_parse_api_date(raw) {
    | Ok(date) => date,
    | Err(err) => {
      tracing::warn!(
        input = raw,
        error = %err,
        "falling back to current date"
      );
      to_project_date(now)
    }
  }
}

/// Strict timestamp parser used for
/// calendar events. Naive values are
/// read in the project timezone.
#[tracing::instrument(level = "trace", skip_all, fields(input = input))]
pub fn try_parse_api_datetime(
  input: &str
) -> anyhow::Result<DateTime<Utc>> {
  let token = input.trim();
  if token.is_empty() {
    return Err(anyhow!(
      "empty timestamp value"
    ));
  }

  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Ok(dt.with_timezone(&Utc));
  }

  for fmt in NAIVE_DATETIME_FORMATS {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return to_utc_from_project_local(
        ndt, fmt
      );
    }
  }

  if let Some(parsed) =
    parse_slash_date(token)
  {
    let (date, clock) = parsed?;
    let (hour, minute) =
      clock.unwrap_or((0, 0));
    let local = date
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "invalid clock time in \
           {token}"
        )
      })?;
    return to_utc_from_project_local(
      local,
      "slash-datetime"
    );
  }

  if let Ok(date) =
    NaiveDate::parse_from_str(
      token, "%Y-%m-%d"
    )
  {
    let midnight = date
      .and_hms_opt(0, 0, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct \
           midnight for date"
        )
      })?;
    return to_utc_from_project_local(
      midnight, "date"
    );
  }

  Err(anyhow!(
    "unrecognized timestamp: {input}"
  ))
}

/// Whole 7-day periods from `origin` to
/// `date`, rounded towards negative
/// infinity.
#[must_use]
pub fn week_index(
  date: NaiveDate,
  origin: NaiveDate
) -> i64 {
  (date - origin)
    .num_days()
    .div_euclid(7)
}

/// Number of weeks a `[start, end]` span
/// occupies on the timeline; never less
/// than one.
#[must_use]
pub fn duration_weeks(
  start: NaiveDate,
  end: NaiveDate
) -> i64 {
  let days = (end - start).num_days();
  if days <= 0 {
    return 1;
  }
  ((days + 6) / 7).max(1)
}

/// `date + days`, or `None` outside
/// chrono's date range.
pub fn checked_add_days(
  date: NaiveDate,
  days: i64
) -> Option<NaiveDate> {
  date.checked_add_signed(
    Duration::try_days(days)?
  )
}

/// Like [`checked_add_days`] but keeps
/// `date` when the result is out of
/// range.
pub fn add_days(
  date: NaiveDate,
  days: i64
) -> NaiveDate {
  checked_add_days(date, days)
    .unwrap_or(date)
}


pub mod api_date_serde {
  use chrono::NaiveDate;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  use super::API_DATE_FORMAT;

  pub fn serialize<S>(
    date: &NaiveDate,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer.serialize_str(
      &date
        .format(API_DATE_FORMAT)
        .to_string()
    )
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<NaiveDate, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    super::try_parse_api_date(&raw)
      .map_err(serde::de::Error::custom)
  }

  pub mod option {
    use chrono::NaiveDate;
    use serde::{
      Deserialize,
      Deserializer,
      Serializer
    };

    pub fn serialize<S>(
      date: &Option<NaiveDate>,
      serializer: S
    ) -> Result<S::Ok, S::Error>
    where
      S: Serializer
    {
      match date {
        | Some(value) => {
          super::serialize(
            value, serializer
          )
        }
        | None => {
          serializer.serialize_none()
        }
      }
    }

    pub fn deserialize<'de, D>(
      deserializer: D
    ) -> Result<
      Option<NaiveDate>,
      D::Error
    >
    where
      D: Deserializer<'de>
    {
      let opt =
        Option::<String>::deserialize(
          deserializer
        )?;
      match opt {
        | Some(raw) => {
          super::super::try_parse_api_date(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
        }
        | None => Ok(None)
      }
    }
  }
}
