//! The persistence contract the rollup reader depends on.
//!
//! A backend implements [`MetricStore`] and maps its native failures onto
//! [`StoreError`](crate::error::StoreError):
//!
//! - `Unavailable` for outages and timeouts (trips the fast-fail guard)
//! - `Corrupt` for stored data that cannot be decoded
//! - `BadRequest` for requests the backend refuses
//!
//! Backends are peer implementations of this one trait:
//! [`MemoryStore`](crate::memory::MemoryStore) for tests and embedding, and
//! [`FileStore`](crate::file::FileStore) for a directory of JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::period::Granularity;
use crate::record::{Record, TimeRange};

/// Persistence operations needed by the rollup reader.
///
/// Implementations take `&self` and synchronize internally so one store can
/// be shared by concurrent readers.
pub trait MetricStore: Send + Sync {
    /// Returns records at exactly `granularity` whose bucket start lies in
    /// `range`, ordered by bucket start.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`](crate::error::StoreError) if the backend fails.
    fn find(
        &self,
        entity_id: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Record>>;

    /// Upserts `record` keyed by `(entity_id, granularity, bucket_start)`.
    ///
    /// Persisting the same record twice is a no-op; a later write for the same
    /// key replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if `record.entity_id` differs from `entity_id`,
    /// or another [`StoreError`](crate::error::StoreError) if the backend fails.
    fn persist(&self, entity_id: &str, record: &Record) -> StoreResult<()>;

    /// Returns summary information about the records held for an entity.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`](crate::error::StoreError) if the backend fails.
    fn meta(&self, entity_id: &str) -> StoreResult<EntityMeta>;
}

/// What a store knows about one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Entity the summary describes.
    pub entity_id: String,
    /// Number of stored records across all granularities.
    pub record_count: usize,
    /// Earliest bucket start seen.
    pub earliest: Option<DateTime<Utc>>,
    /// Latest bucket start seen.
    pub latest: Option<DateTime<Utc>>,
}

impl EntityMeta {
    /// Builds the summary for `records`.
    pub fn from_records<'a, I>(entity_id: &str, records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut meta = Self {
            entity_id: entity_id.to_string(),
            ..Self::default()
        };
        for record in records {
            meta.record_count += 1;
            let at = record.bucket_start;
            meta.earliest = Some(meta.earliest.map_or(at, |e| e.min(at)));
            meta.latest = Some(meta.latest.map_or(at, |l| l.max(at)));
        }
        meta
    }

    /// Returns `true` if any record exists for the entity.
    pub fn has_data(&self) -> bool {
        self.record_count > 0
    }
}

/// Checks the entity id carried by a record against the persist argument.
pub(crate) fn check_entity(entity_id: &str, record: &Record) -> StoreResult<()> {
    if record.entity_id != entity_id {
        return Err(crate::error::StoreError::BadRequest {
            reason: format!(
                "record for entity '{}' persisted under '{}'",
                record.entity_id, entity_id
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use chrono::TimeZone;

    #[test]
    fn test_entity_meta_from_records() {
        let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap();
        let records = [
            Record::new("e", Granularity::Daily, late, Fields::new()),
            Record::new("e", Granularity::Realtime, early, Fields::new()),
        ];

        let meta = EntityMeta::from_records("e", &records);
        assert!(meta.has_data());
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.earliest, Some(early));
        assert_eq!(meta.latest, Some(late));

        let empty = EntityMeta::from_records("e", &[]);
        assert!(!empty.has_data());
        assert_eq!(empty.earliest, None);
    }

    #[test]
    fn test_check_entity() {
        let at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let record = Record::new("a", Granularity::Daily, at, Fields::new());
        assert!(check_entity("a", &record).is_ok());
        assert!(check_entity("b", &record).is_err());
    }
}
