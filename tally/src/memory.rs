//! In-memory [`MetricStore`] backend.
//!
//! Records live in a per-entity ordered map keyed by
//! `(granularity, bucket_start)`, which makes `find` a single range scan and
//! `persist` a plain upsert. Used as the test double for the reader and for
//! embedding where durability is not needed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::period::Granularity;
use crate::record::{Record, TimeRange};
use crate::store::{EntityMeta, MetricStore, check_entity};

type EntityRecords = BTreeMap<(Granularity, DateTime<Utc>), Record>;

/// A thread-safe, process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, EntityRecords>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every record held for `entity_id`, ordered by granularity
    /// then bucket start.
    pub fn records(&self, entity_id: &str) -> Vec<Record> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities
            .get(entity_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns how many records are held for `entity_id` at `granularity`.
    pub fn count_at(&self, entity_id: &str, granularity: Granularity) -> usize {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities.get(entity_id).map_or(0, |records| {
            records.keys().filter(|(g, _)| *g == granularity).count()
        })
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricStore for MemoryStore {
    fn find(
        &self,
        entity_id: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Record>> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        let Some(records) = entities.get(entity_id) else {
            return Ok(Vec::new());
        };

        Ok(records
            .range((granularity, range.start)..(granularity, range.end))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn persist(&self, entity_id: &str, record: &Record) -> StoreResult<()> {
        check_entity(entity_id, record)?;

        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        entities
            .entry(entity_id.to_string())
            .or_default()
            .insert((record.granularity, record.bucket_start), record.clone());
        Ok(())
    }

    fn meta(&self, entity_id: &str) -> StoreResult<EntityMeta> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match entities.get(entity_id) {
            Some(records) => EntityMeta::from_records(entity_id, records.values()),
            None => EntityMeta::from_records(entity_id, []),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use chrono::{TimeDelta, TimeZone};

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap()
    }

    fn record(granularity: Granularity, at: DateTime<Utc>, views: i64) -> Record {
        Record::new("bugs", granularity, at, Fields::new()).with_field("views", views)
    }

    #[test]
    fn test_find_filters_granularity_and_range() {
        let store = MemoryStore::new();
        store.persist("bugs", &record(Granularity::Daily, day(1), 1)).unwrap();
        store.persist("bugs", &record(Granularity::Daily, day(2), 2)).unwrap();
        store.persist("bugs", &record(Granularity::Realtime, day(1), 3)).unwrap();

        let range = TimeRange::new(day(1), day(2)).unwrap();
        let found = store.find("bugs", Granularity::Daily, range).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bucket_start, day(1));

        let wider = TimeRange::new(day(1), day(3)).unwrap();
        assert_eq!(store.find("bugs", Granularity::Daily, wider).unwrap().len(), 2);
        assert!(store.find("other", Granularity::Daily, wider).unwrap().is_empty());
    }

    #[test]
    fn test_persist_is_an_upsert() {
        let store = MemoryStore::new();
        store.persist("bugs", &record(Granularity::Daily, day(1), 1)).unwrap();
        store.persist("bugs", &record(Granularity::Daily, day(1), 1)).unwrap();
        assert_eq!(store.count_at("bugs", Granularity::Daily), 1);

        store.persist("bugs", &record(Granularity::Daily, day(1), 7)).unwrap();
        let records = store.records("bugs");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["views"], bigdecimal::BigDecimal::from(7));
    }

    #[test]
    fn test_persist_rejects_entity_mismatch() {
        let store = MemoryStore::new();
        let err = store
            .persist("other", &record(Granularity::Daily, day(1), 1))
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(store.records("other").is_empty());
    }

    #[test]
    fn test_meta() {
        let store = MemoryStore::new();
        assert!(!store.meta("bugs").unwrap().has_data());

        store
            .persist(
                "bugs",
                &record(Granularity::Realtime, day(3) + TimeDelta::hours(5), 1),
            )
            .unwrap();
        store.persist("bugs", &record(Granularity::Daily, day(1), 1)).unwrap();

        let meta = store.meta("bugs").unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.earliest, Some(day(1)));

        store.clear();
        assert!(!store.meta("bugs").unwrap().has_data());
    }
}
