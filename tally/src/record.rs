//! Records, field maps and half-open time ranges.
//!
//! A [`Record`] is the persisted field snapshot of one entity for one bucket
//! at one granularity. Field values are [`BigDecimal`]s so that summing many
//! counters, or counters near the largest machine integer, never wraps or
//! rounds.

use std::collections::BTreeMap;
use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RangeError, Result};
use crate::period::Granularity;

/// Metric name to value mapping carried by a record or returned by a read.
pub type Fields = BTreeMap<String, BigDecimal>;

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a range, rejecting empty or inverted intervals.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Empty`] if `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(RangeError::Empty { start, end }.into());
        }
        Ok(Self { start, end })
    }

    /// Returns `true` if the range is still receiving writes at `now`.
    ///
    /// An open range must never be cached as a single record.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }

    /// Returns `true` if `instant` lies inside the range.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns `true` if `other` lies wholly inside this range.
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns the overlap of two ranges, if any.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    /// Returns the sub-ranges of `self` not covered by `covered`.
    ///
    /// `covered` must be sorted by start; overlapping entries are tolerated.
    pub fn gaps(&self, covered: &[TimeRange]) -> Vec<TimeRange> {
        let mut gaps = Vec::new();
        let mut cursor = self.start;

        for range in covered {
            if range.end <= cursor {
                continue;
            }
            if range.start >= self.end {
                break;
            }
            if range.start > cursor {
                gaps.push(TimeRange {
                    start: cursor,
                    end: range.start,
                });
            }
            cursor = cursor.max(range.end);
        }

        if cursor < self.end {
            gaps.push(TimeRange {
                start: cursor,
                end: self.end,
            });
        }
        gaps
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Persisted field snapshot for one entity, one granularity and one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Entity the values belong to.
    pub entity_id: String,
    /// Granularity of the bucket.
    pub granularity: Granularity,
    /// Start of the bucket (for raw records, the sample instant).
    pub bucket_start: DateTime<Utc>,
    /// Metric values.
    pub fields: Fields,
}

impl Record {
    /// Creates a record.
    pub fn new(
        entity_id: impl Into<String>,
        granularity: Granularity,
        bucket_start: DateTime<Utc>,
        fields: Fields,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            granularity,
            bucket_start,
            fields,
        }
    }

    /// Adds a field value, replacing any previous value for the name.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<BigDecimal>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Adds every field of `source` into `totals`.
///
/// A field missing from `source` is left untouched in `totals`, so absence
/// never turns into zero.
pub fn accumulate(totals: &mut Fields, source: &Fields) {
    for (name, value) in source {
        match totals.get_mut(name) {
            Some(sum) => *sum += value.clone(),
            None => {
                totals.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Sums the fields of a set of records.
pub fn sum_fields<'a, I>(records: I) -> Fields
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut totals = Fields::new();
    for record in records {
        accumulate(&mut totals, &record.fields);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 6, 1, hour, 0, 0).unwrap()
    }

    fn range(start: u32, end: u32) -> TimeRange {
        TimeRange::new(at(start), at(end)).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_range() {
        assert!(TimeRange::new(at(3), at(3)).is_err());
        assert!(TimeRange::new(at(4), at(3)).is_err());
        assert!(TimeRange::new(at(3), at(4)).is_ok());
    }

    #[test]
    fn test_open_and_closed() {
        let r = range(1, 2);
        assert!(r.is_open(at(1)));
        assert!(!r.is_open(at(2))); // end == now is closed
        assert!(!r.is_open(at(5)));
    }

    #[test]
    fn test_contains_is_half_open() {
        let r = range(1, 2);
        assert!(r.contains(at(1)));
        assert!(!r.contains(at(2)));
    }

    #[test]
    fn test_intersect() {
        assert_eq!(range(1, 5).intersect(&range(3, 8)), Some(range(3, 5)));
        assert_eq!(range(1, 3).intersect(&range(3, 8)), None);
    }

    #[test]
    fn test_gaps() {
        let whole = range(0, 10);
        assert_eq!(whole.gaps(&[]), vec![whole]);
        assert_eq!(
            whole.gaps(&[range(2, 4), range(4, 5), range(8, 12)]),
            vec![range(0, 2), range(5, 8)]
        );
        assert!(whole.gaps(&[range(0, 10)]).is_empty());
    }

    #[test]
    fn test_sum_fields_keeps_absent_fields_absent() {
        let a = Record::new("e", Granularity::Daily, at(0), Fields::new())
            .with_field("views", 1)
            .with_field("hits", 123);
        let b = Record::new("e", Granularity::Daily, at(1), Fields::new()).with_field("hits", 123);

        let totals = sum_fields([&a, &b]);
        assert_eq!(totals.get("views"), Some(&BigDecimal::from(1)));
        assert_eq!(totals.get("hits"), Some(&BigDecimal::from(246)));
        assert_eq!(totals.get("bytes"), None);
    }

    #[test]
    fn test_sum_fields_does_not_overflow() {
        let max = BigDecimal::from(i64::MAX);
        let a = Record::new("e", Granularity::Realtime, at(0), Fields::new())
            .with_field("views", max.clone());
        let b = Record::new("e", Granularity::Realtime, at(1), Fields::new())
            .with_field("views", max);

        let totals = sum_fields([&a, &b]);
        assert_eq!(
            totals["views"],
            BigDecimal::from_str("18446744073709551614").unwrap()
        );
    }
}
