//! Granularities and calendar bucket arithmetic.
//!
//! Granularities form a closed, totally ordered hierarchy from the raw
//! [`Granularity::Realtime`] level up to [`Granularity::Yearly`]. Every
//! coarser bucket is partitioned exactly by the buckets of its child level,
//! which is what lets the reader rebuild a coarse answer from finer records.
//!
//! Bucket boundaries are calendar-correct (months and years are not fixed
//! width) and are computed in the local calendar of the hierarchy's UTC
//! offset.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeDelta, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result};
use crate::record::TimeRange;

/// A named time-bucketing level, ordered finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Raw samples; one-millisecond buckets.
    Realtime,
    /// Calendar hours.
    Hourly,
    /// Calendar days.
    Daily,
    /// Calendar months.
    Monthly,
    /// Calendar years.
    Yearly,
}

impl Granularity {
    /// All granularities, finest first.
    pub const ALL: [Granularity; 5] = [
        Self::Realtime,
        Self::Hourly,
        Self::Daily,
        Self::Monthly,
        Self::Yearly,
    ];

    /// The finest granularity.
    pub const FINEST: Granularity = Self::Realtime;

    /// Returns the next finer granularity, or `None` for the finest.
    pub fn child(self) -> Option<Granularity> {
        match self {
            Self::Realtime => None,
            Self::Hourly => Some(Self::Realtime),
            Self::Daily => Some(Self::Hourly),
            Self::Monthly => Some(Self::Daily),
            Self::Yearly => Some(Self::Monthly),
        }
    }

    /// Returns the next coarser granularity, or `None` for the coarsest.
    pub fn parent(self) -> Option<Granularity> {
        match self {
            Self::Realtime => Some(Self::Hourly),
            Self::Hourly => Some(Self::Daily),
            Self::Daily => Some(Self::Monthly),
            Self::Monthly => Some(Self::Yearly),
            Self::Yearly => None,
        }
    }

    /// Lowercase name used in configuration, storage and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown granularity '{s}', expected one of realtime, hourly, daily, monthly, yearly")
            })
    }
}

/// Bucket arithmetic for the granularity hierarchy in one calendar.
///
/// The calendar is a fixed offset from UTC. A deployment that reports in a
/// single business time zone sets it once; per-entity time zones are not
/// modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodHierarchy {
    offset: FixedOffset,
}

impl Default for PeriodHierarchy {
    fn default() -> Self {
        Self::utc()
    }
}

impl PeriodHierarchy {
    /// Creates a hierarchy whose buckets follow the UTC calendar.
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Creates a hierarchy for a calendar `seconds` east of UTC.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidUtcOffset`] if the offset is a
    /// day or more in either direction.
    pub fn with_offset_seconds(seconds: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(seconds)
            .ok_or(ConfigurationError::InvalidUtcOffset { seconds })?;
        Ok(Self { offset })
    }

    /// Returns the calendar offset.
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Returns the half-open bucket of `granularity` containing `instant`.
    ///
    /// Near the ends of the representable time line a bucket is clamped to
    /// `DateTime::<Utc>::MIN_UTC` or `DateTime::<Utc>::MAX_UTC`. An instant
    /// whose local time is not representable falls back to the UTC calendar.
    pub fn bucket(&self, granularity: Granularity, instant: DateTime<Utc>) -> TimeRange {
        let Some(local) = instant.naive_utc().checked_add_signed(self.offset_delta()) else {
            return Self::utc().bucket(granularity, instant);
        };
        let date = local.date();

        let (start, end) = match granularity {
            Granularity::Realtime => {
                let sub_milli = i64::from(local.nanosecond() % 1_000_000);
                let start = local - TimeDelta::nanoseconds(sub_milli);
                (start, start.checked_add_signed(TimeDelta::milliseconds(1)))
            }
            Granularity::Hourly => {
                let start = midnight(date) + TimeDelta::hours(i64::from(local.hour()));
                (start, start.checked_add_signed(TimeDelta::hours(1)))
            }
            Granularity::Daily => (
                midnight(date),
                date.checked_add_days(Days::new(1)).map(midnight),
            ),
            Granularity::Monthly => {
                let first = date - Days::new(u64::from(date.day0()));
                (
                    midnight(first),
                    first.checked_add_months(Months::new(1)).map(midnight),
                )
            }
            Granularity::Yearly => {
                let first = date - Days::new(u64::from(date.ordinal0()));
                (
                    midnight(first),
                    first.checked_add_months(Months::new(12)).map(midnight),
                )
            }
        };

        TimeRange {
            start: self.to_utc(start).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: end
                .and_then(|end| self.to_utc(end))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Returns `true` if `range` is exactly one bucket of `granularity`.
    pub fn is_bucket(&self, granularity: Granularity, range: &TimeRange) -> bool {
        self.bucket(granularity, range.start) == *range
    }

    /// Iterates the buckets of `granularity` that intersect `range`.
    ///
    /// Each yielded range is clipped to `range`, so the first and last may be
    /// partial buckets.
    pub fn buckets(&self, granularity: Granularity, range: TimeRange) -> Buckets {
        Buckets {
            hierarchy: *self,
            granularity,
            range,
            cursor: range.start,
        }
    }

    fn offset_delta(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.offset.local_minus_utc()))
    }

    fn to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        local
            .checked_sub_signed(self.offset_delta())
            .map(|utc| DateTime::from_naive_utc_and_offset(utc, Utc))
    }
}

/// Iterator over clipped buckets, see [`PeriodHierarchy::buckets`].
#[derive(Debug, Clone)]
pub struct Buckets {
    hierarchy: PeriodHierarchy,
    granularity: Granularity,
    range: TimeRange,
    cursor: DateTime<Utc>,
}

impl Iterator for Buckets {
    type Item = TimeRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.range.end {
            return None;
        }
        let bucket = self.hierarchy.bucket(self.granularity, self.cursor);
        let clipped = TimeRange {
            start: self.cursor,
            end: bucket.end.min(self.range.end),
        };
        self.cursor = clipped.end;
        Some(clipped)
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}
