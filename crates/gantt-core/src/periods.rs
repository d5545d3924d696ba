use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{
  Datelike,
  NaiveDate,
  Weekday
};
use serde::Serialize;

use crate::datetime::{
  add_days,
  api_date_serde,
  checked_add_days
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
  Day,
  Week,
  Month
}

impl Resolution {
  /// Columns shown when no explicit
  /// count is configured.
  pub fn default_count(self) -> usize {
    match self {
      | Resolution::Day => 42,
      | Resolution::Week => 24,
      | Resolution::Month => 12
    }
  }

  /// Periods skipped by one
  /// backward/forward navigation.
  pub fn navigation_step(self) -> i64 {
    match self {
      | Resolution::Day => 7,
      | Resolution::Week => 4,
      | Resolution::Month => 2
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      | Resolution::Day => "day",
      | Resolution::Week => "week",
      | Resolution::Month => "month"
    }
  }
}

impl fmt::Display for Resolution {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Resolution {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "d" | "day" | "days" => {
        Ok(Resolution::Day)
      }
      | "w" | "week" | "weeks" => {
        Ok(Resolution::Week)
      }
      | "m" | "month" | "months" => {
        Ok(Resolution::Month)
      }
      | other => {
        Err(anyhow!(
          "unknown resolution: {other} \
           (expected day, week or \
           month)"
        ))
      }
    }
  }
}

/// One visible timeline column.
#[derive(
  Debug, Clone, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct TimePeriod {
  pub label:       String,
  #[serde(with = "api_date_serde")]
  pub start:       NaiveDate,
  #[serde(with = "api_date_serde")]
  pub end:         NaiveDate,
  pub is_today:    bool,
  pub week_number: u32,
  pub month:       String,
  pub year:        i32,
  /// First column of a header group:
  /// a Monday in day view, the first
  /// week of a month in week view,
  /// January in month view.
  pub group_start: bool
}

impl TimePeriod {
  pub fn contains(
    &self,
    date: NaiveDate
  ) -> bool {
    date >= self.start && date <= self.end
  }

  /// Whether `[start, end)` overlaps
  /// this column.
  pub fn overlaps(
    &self,
    start: NaiveDate,
    end: NaiveDate
  ) -> bool {
    start <= self.end && end > self.start
  }
}

/// Produces exactly `count` contiguous
/// columns starting `offset`
/// resolution units after `anchor`.
/// Fails when a column falls outside
/// the representable date range.
#[tracing::instrument(level = "debug")]
pub fn generate_periods(
  anchor: NaiveDate,
  offset: i64,
  resolution: Resolution,
  today: NaiveDate,
  count: usize
) -> anyhow::Result<Vec<TimePeriod>> {
  let count = i64::try_from(count)
    .map_err(|_| {
      anyhow!("too many periods: {count}")
    })?;
  (0..count)
    .map(|idx| {
      let start = offset
        .checked_add(idx)
        .and_then(|index| {
          period_start(
            anchor, resolution, index
          )
        })
        .ok_or_else(|| {
          out_of_range(
            anchor, offset, resolution
          )
        })?;
      let end =
        period_end(start, resolution)
          .ok_or_else(|| {
            out_of_range(
              anchor, offset,
              resolution
            )
          })?;
      Ok(describe(
        start, end, resolution, today
      ))
    })
    .collect()
}

fn out_of_range(
  anchor: NaiveDate,
  offset: i64,
  resolution: Resolution
) -> anyhow::Error {
  anyhow!(
    "offset {offset} {resolution} from \
     {anchor} is out of range"
  )
}

/// Header groups as `(title, span)`
/// pairs in column order.
pub fn group_headers(
  periods: &[TimePeriod],
  resolution: Resolution
) -> Vec<(String, usize)> {
  let mut groups: Vec<(String, usize)> =
    Vec::new();
  for period in periods {
    let title = match resolution {
      | Resolution::Day => {
        format!(
          "W {} {}",
          period.week_number,
          period.month
        )
      }
      | Resolution::Week => {
        format!(
          "{} {}",
          period.month, period.year
        )
      }
      | Resolution::Month => {
        period.year.to_string()
      }
    };
    if let Some((last, span)) =
      groups.last_mut()
      && *last == title
      && !period.group_start
    {
      *span += 1;
      continue;
    }
    groups.push((title, 1));
  }
  groups
}

/// Week columns step in whole weeks
/// from the anchor itself, so they line
/// up with week indexes counted from a
/// project origin on any weekday.
fn period_start(
  anchor: NaiveDate,
  resolution: Resolution,
  index: i64
) -> Option<NaiveDate> {
  match resolution {
    | Resolution::Day => {
      checked_add_days(anchor, index)
    }
    | Resolution::Week => {
      checked_add_days(
        anchor,
        index.checked_mul(7)?
      )
    }
    | Resolution::Month => {
      shift_months(
        first_day_of_month(
          anchor.year(),
          anchor.month()
        )?,
        index
      )
    }
  }
}

fn period_end(
  start: NaiveDate,
  resolution: Resolution
) -> Option<NaiveDate> {
  match resolution {
    | Resolution::Day => Some(start),
    | Resolution::Week => {
      checked_add_days(start, 6)
    }
    | Resolution::Month => {
      last_day_of_month(
        start.year(),
        start.month()
      )
    }
  }
}

fn describe(
  start: NaiveDate,
  end: NaiveDate,
  resolution: Resolution,
  today: NaiveDate
) -> TimePeriod {
  let week_number =
    start.iso_week().week();
  let (label, group_start) =
    match resolution {
      | Resolution::Day => {
        (
          format!(
            "{} {}",
            weekday_abbrev(
              start.weekday()
            ),
            start.day()
          ),
          start.weekday() == Weekday::Mon
        )
      }
      | Resolution::Week => {
        (
          format!("W {week_number}"),
          start.day() <= 7
        )
      }
      | Resolution::Month => {
        (
          start.format("%b").to_string(),
          start.month() == 1
        )
      }
    };

  let month = match resolution {
    | Resolution::Week => {
      start.format("%B").to_string()
    }
    | Resolution::Day
    | Resolution::Month => {
      start.format("%b").to_string()
    }
  };

  TimePeriod {
    label,
    start,
    end,
    is_today: today >= start
      && today <= end,
    week_number,
    month,
    year: start.year(),
    group_start
  }
}

fn weekday_abbrev(
  day: Weekday
) -> &'static str {
  match day {
    | Weekday::Mon => "Mo",
    | Weekday::Tue => "Tu",
    | Weekday::Wed => "We",
    | Weekday::Thu => "Th",
    | Weekday::Fri => "Fr",
    | Weekday::Sat => "Sa",
    | Weekday::Sun => "Su"
  }
}

pub fn start_of_week(
  day: NaiveDate
) -> NaiveDate {
  let diff = day
    .weekday()
    .num_days_from_monday()
    as i64;
  add_days(day, -diff)
}

fn shift_months(
  date: NaiveDate,
  months: i64
) -> Option<NaiveDate> {
  let total = i64::from(date.year())
    .checked_mul(12)?
    .checked_add(i64::from(date.month0()))?
    .checked_add(months)?;
  let year =
    i32::try_from(total.div_euclid(12))
      .ok()?;
  let month =
    total.rem_euclid(12) as u32 + 1;
  let day = date
    .day()
    .min(days_in_month(year, month)?);
  NaiveDate::from_ymd_opt(
    year, month, day
  )
}

fn first_day_of_month(
  year: i32,
  month: u32
) -> Option<NaiveDate> {
  NaiveDate::from_ymd_opt(
    year, month, 1
  )
}

fn last_day_of_month(
  year: i32,
  month: u32
) -> Option<NaiveDate> {
  let (next_year, next_month) =
    if month >= 12 {
      (year.checked_add(1)?, 1_u32)
    } else {
      (year, month + 1)
    };
  checked_add_days(
    first_day_of_month(
      next_year, next_month
    )?,
    -1
  )
}

fn days_in_month(
  year: i32,
  month: u32
) -> Option<u32> {
  last_day_of_month(year, month)
    .map(|last| last.day())
}

#[cfg(test)]
mod tests {
  use chrono::{
    Datelike,
    NaiveDate
  };

  use super::{
    Resolution,
    generate_periods,
    group_headers
  };
  use crate::datetime::{
    add_days,
    week_index
  };

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn returns_requested_count_contiguously()
  {
    let anchor = date(2024, 1, 15);
    let today = date(2024, 1, 22);
    for resolution in [
      Resolution::Day,
      Resolution::Week,
      Resolution::Month
    ] {
      for offset in [-30, -4, 0, 7, 25] {
        for count in [0, 1, 5, 42] {
          let periods = generate_periods(
            anchor, offset, resolution,
            today, count
          )
          .expect("periods");
          assert_eq!(periods.len(), count);
          for pair in periods.windows(2) {
            assert!(
              pair[0].start < pair[1].start
            );
            assert_eq!(
              add_days(pair[0].end, 1),
              pair[1].start,
              "{resolution} offset {offset}"
            );
          }
        }
      }
    }
  }

  #[test]
  fn day_view_labels_and_today() {
    let periods = generate_periods(
      date(2024, 1, 15),
      0,
      Resolution::Day,
      date(2024, 1, 22),
      Resolution::Day.default_count()
    )
    .expect("periods");
    assert_eq!(periods.len(), 42);
    assert_eq!(periods[0].label, "Mo 15");
    assert!(periods[0].group_start);
    assert!(!periods[1].group_start);
    let today: Vec<usize> = periods
      .iter()
      .enumerate()
      .filter(|(_, p)| p.is_today)
      .map(|(idx, _)| idx)
      .collect();
    assert_eq!(today, vec![7]);
  }

  #[test]
  fn week_view_steps_from_the_anchor() {
    let periods = generate_periods(
      date(2024, 1, 17),
      -1,
      Resolution::Week,
      date(2024, 1, 22),
      3
    )
    .expect("periods");
    assert_eq!(
      periods[0].start,
      date(2024, 1, 10)
    );
    assert_eq!(
      periods[0].end,
      date(2024, 1, 16)
    );
    assert_eq!(periods[0].label, "W 2");
    assert_eq!(periods[0].month, "January");
    assert!(periods[1].is_today);
    assert!(!periods[2].is_today);
  }

  #[test]
  fn week_columns_match_week_indexes_from_a_friday() {
    let origin = date(2024, 3, 1);
    let periods = generate_periods(
      origin,
      0,
      Resolution::Week,
      origin,
      4
    )
    .expect("periods");
    for (idx, period) in
      periods.iter().enumerate()
    {
      assert_eq!(
        week_index(period.start, origin),
        idx as i64
      );
      assert_eq!(
        week_index(period.end, origin),
        idx as i64
      );
    }
  }

  #[test]
  fn out_of_range_offsets_are_errors() {
    let anchor = date(2024, 1, 1);
    for resolution in [
      Resolution::Day,
      Resolution::Week,
      Resolution::Month
    ] {
      let err = generate_periods(
        anchor,
        20_000_000_000,
        resolution,
        anchor,
        2
      )
      .expect_err("out of range");
      assert!(
        err.to_string()
          .contains("out of range")
      );
    }
    assert!(
      generate_periods(
        anchor,
        i64::MAX,
        Resolution::Day,
        anchor,
        2
      )
      .is_err()
    );
  }

  #[test]
  fn month_view_spans_calendar_months() {
    let periods = generate_periods(
      date(2023, 11, 30),
      0,
      Resolution::Month,
      date(2024, 2, 29),
      4
    )
    .expect("periods");
    let starts: Vec<(i32, u32)> = periods
      .iter()
      .map(|p| (p.start.year(), p.start.month()))
      .collect();
    assert_eq!(
      starts,
      vec![
        (2023, 11),
        (2023, 12),
        (2024, 1),
        (2024, 2)
      ]
    );
    assert_eq!(
      periods[3].end,
      date(2024, 2, 29)
    );
    assert!(periods[3].is_today);
    assert!(periods[2].group_start);
    assert_eq!(periods[2].label, "Jan");
  }

  #[test]
  fn negative_month_offsets_cross_years()
  {
    let periods = generate_periods(
      date(2024, 2, 10),
      -3,
      Resolution::Month,
      date(2024, 2, 10),
      1
    )
    .expect("periods");
    assert_eq!(
      periods[0].start,
      date(2023, 11, 1)
    );
  }

  #[test]
  fn groups_weeks_by_month() {
    let periods = generate_periods(
      date(2024, 1, 1),
      0,
      Resolution::Week,
      date(2024, 1, 1),
      6
    )
    .expect("periods");
    let groups = group_headers(
      &periods,
      Resolution::Week
    );
    assert_eq!(
      groups,
      vec![
        ("January 2024".to_string(), 5),
        ("February 2024".to_string(), 1)
      ]
    );
  }
}
