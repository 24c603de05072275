//! Hierarchical rollup reads with lazy materialization.
//!
//! The reader answers "what is the sum of each field for this entity over
//! this window at this granularity", using whatever the store already holds:
//!
//! 1. Records stored at the requested granularity are authoritative for the
//!    buckets they occupy and are summed as-is.
//! 2. Parts of the window with no such record are rebuilt from the next finer
//!    granularity, recursively, down to the raw level.
//! 3. A bucket rebuilt this way is written back as a record at its own
//!    granularity once it is closed and lies wholly inside the window, so the
//!    next read of it is a direct lookup. Open buckets (still receiving
//!    writes) are recomputed on every read.
//!
//! With `recursive = false` only buckets at the requested granularity are
//! written back; with `recursive = true` every closed intermediate bucket the
//! descent passes through is written back too.
//!
//! ```text
//! read(MONTHLY, May)            May open: nothing cached at MONTHLY
//!   └─ DAILY   May 1 .. May 31  closed days cached when recursive
//!        └─ HOURLY ...          closed hours cached when recursive
//!             └─ REALTIME       raw records summed
//! ```
//!
//! Every store call runs through the shared [`FastFailGuard`]. A failure
//! anywhere in the descent aborts the whole read; no partial sum is returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::Result;
use crate::guard::FastFailGuard;
use crate::period::{Granularity, PeriodHierarchy};
use crate::record::{Fields, Record, TimeRange, accumulate, sum_fields};
use crate::store::{EntityMeta, MetricStore};

/// One bucket of a [`RollupReader::series`] result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// The bucket, clipped to the requested window.
    pub range: TimeRange,
    /// Field totals for the bucket.
    pub fields: Fields,
}

/// Per-read state threaded through the descent.
struct Descent<'a> {
    entity_id: &'a str,
    requested: Granularity,
    recursive: bool,
    /// Evaluated once so every level agrees on which buckets are open.
    now: DateTime<Utc>,
    store: &'a dyn MetricStore,
}

/// Reads field totals from a [`MetricStore`], rolling finer records up into
/// coarser buckets on demand.
///
/// The reader holds no mutable state and can be shared across threads.
#[derive(Debug, Clone)]
pub struct RollupReader {
    hierarchy: PeriodHierarchy,
    guard: Arc<FastFailGuard>,
    clock: Arc<dyn Clock>,
}

impl RollupReader {
    /// Creates a reader.
    ///
    /// `clock` decides which buckets are still open; pass the same clock the
    /// guard uses.
    pub fn new(
        hierarchy: PeriodHierarchy,
        guard: Arc<FastFailGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hierarchy,
            guard,
            clock,
        }
    }

    /// Returns the bucket arithmetic in use.
    pub fn hierarchy(&self) -> &PeriodHierarchy {
        &self.hierarchy
    }

    /// Returns the shared fast-fail guard.
    pub fn guard(&self) -> &Arc<FastFailGuard> {
        &self.guard
    }

    /// Returns the total of one field over `range`, or `None` if no
    /// contributing record carries the field.
    ///
    /// # Errors
    ///
    /// See [`RollupReader::read_all`].
    pub fn read_field(
        &self,
        entity_id: &str,
        field: &str,
        granularity: Granularity,
        range: TimeRange,
        store: &dyn MetricStore,
        recursive: bool,
    ) -> Result<Option<BigDecimal>> {
        let mut totals = self.read_all(entity_id, granularity, range, store, recursive)?;
        Ok(totals.remove(field))
    }

    /// Returns the totals of every field over `range` at `granularity`.
    ///
    /// An empty map means nothing was recorded; it is not an error.
    ///
    /// # Errors
    ///
    /// - [`TallyError::BackendUnavailable`](crate::error::TallyError::BackendUnavailable)
    ///   if the guard is fast-failing
    /// - [`TallyError::Store`](crate::error::TallyError::Store) if any store
    ///   call fails; no partial result is returned
    pub fn read_all(
        &self,
        entity_id: &str,
        granularity: Granularity,
        range: TimeRange,
        store: &dyn MetricStore,
        recursive: bool,
    ) -> Result<Fields> {
        let descent = Descent {
            entity_id,
            requested: granularity,
            recursive,
            now: self.clock.now(),
            store,
        };

        let records = self.collect(&descent, granularity, range)?;
        Ok(sum_fields(&records))
    }

    /// Returns the totals for the bucket of `granularity` containing
    /// `instant`.
    ///
    /// # Errors
    ///
    /// See [`RollupReader::read_all`].
    pub fn read_period(
        &self,
        entity_id: &str,
        granularity: Granularity,
        instant: DateTime<Utc>,
        store: &dyn MetricStore,
    ) -> Result<Fields> {
        let bucket = self.hierarchy.bucket(granularity, instant);
        self.read_all(entity_id, granularity, bucket, store, false)
    }

    /// Returns the totals over an arbitrary range that may cross calendar
    /// boundaries.
    ///
    /// The range is walked with the coarsest whole buckets that fit, each read
    /// at its own granularity (so closed whole buckets get cached), and the
    /// unaligned edges are read from raw records.
    ///
    /// # Errors
    ///
    /// See [`RollupReader::read_all`].
    pub fn summarize_range(
        &self,
        entity_id: &str,
        range: TimeRange,
        store: &dyn MetricStore,
    ) -> Result<Fields> {
        let mut totals = Fields::new();
        for (granularity, piece) in self.decompose(range) {
            let fields = self.read_all(entity_id, granularity, piece, store, false)?;
            accumulate(&mut totals, &fields);
        }
        Ok(totals)
    }

    /// Returns one point per non-empty bucket of `granularity` in `range`.
    ///
    /// At the finest granularity the raw records are returned as stored.
    ///
    /// # Errors
    ///
    /// See [`RollupReader::read_all`].
    pub fn series(
        &self,
        entity_id: &str,
        granularity: Granularity,
        range: TimeRange,
        store: &dyn MetricStore,
    ) -> Result<Vec<SeriesPoint>> {
        if granularity == Granularity::FINEST {
            let records = self.guard.call(|| store.find(entity_id, granularity, range))?;
            return Ok(records
                .into_iter()
                .map(|record| SeriesPoint {
                    range: self.hierarchy.bucket(granularity, record.bucket_start),
                    fields: record.fields,
                })
                .collect());
        }

        let mut points = Vec::new();
        for bucket in self.hierarchy.buckets(granularity, range) {
            let fields = self.read_all(entity_id, granularity, bucket, store, false)?;
            if !fields.is_empty() {
                points.push(SeriesPoint {
                    range: bucket,
                    fields,
                });
            }
        }
        Ok(points)
    }

    /// Returns what the store knows about `entity_id`.
    ///
    /// # Errors
    ///
    /// See [`RollupReader::read_all`].
    pub fn meta(&self, entity_id: &str, store: &dyn MetricStore) -> Result<EntityMeta> {
        self.guard.call(|| store.meta(entity_id))
    }

    /// Gathers records at `level` or finer that together account for every
    /// bucket of `level` in `range`.
    fn collect(
        &self,
        descent: &Descent<'_>,
        level: Granularity,
        range: TimeRange,
    ) -> Result<Vec<Record>> {
        let mut records = self
            .guard
            .call(|| descent.store.find(descent.entity_id, level, range))?;

        let Some(child) = level.child() else {
            return Ok(records);
        };

        let mut covered: Vec<TimeRange> = records
            .iter()
            .map(|r| self.hierarchy.bucket(level, r.bucket_start))
            .collect();
        covered.sort_by_key(|b| b.start);
        covered.dedup();

        let materialize = level == descent.requested || descent.recursive;

        for gap in range.gaps(&covered) {
            let finer = self.collect(descent, child, gap)?;
            if finer.is_empty() {
                continue;
            }

            if materialize {
                records.extend(self.materialize(descent, level, gap, finer)?);
            } else {
                records.extend(finer);
            }
        }

        Ok(records)
    }

    /// Rolls `finer` records up into buckets of `level`, persisting each
    /// closed bucket that lies wholly inside `gap`.
    ///
    /// Returns the rollups in place of the records they replace; records in
    /// open or partial buckets are returned unchanged.
    fn materialize(
        &self,
        descent: &Descent<'_>,
        level: Granularity,
        gap: TimeRange,
        finer: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let mut groups: BTreeMap<DateTime<Utc>, (TimeRange, Vec<Record>)> = BTreeMap::new();
        for record in finer {
            let bucket = self.hierarchy.bucket(level, record.bucket_start);
            groups
                .entry(bucket.start)
                .or_insert_with(|| (bucket, Vec::new()))
                .1
                .push(record);
        }

        let mut out = Vec::with_capacity(groups.len());
        for (bucket, members) in groups.into_values() {
            if !gap.covers(&bucket) || bucket.is_open(descent.now) {
                out.extend(members);
                continue;
            }

            let rollup = Record::new(descent.entity_id, level, bucket.start, sum_fields(&members));
            self.guard
                .call(|| descent.store.persist(descent.entity_id, &rollup))?;
            tracing::debug!(
                entity_id = descent.entity_id,
                granularity = %level,
                bucket = %bucket,
                merged = members.len(),
                "materialized rollup"
            );
            out.push(rollup);
        }
        Ok(out)
    }

    /// Splits `range` greedily into the coarsest whole buckets that fit,
    /// falling back to raw pieces up to the next boundary of the level above
    /// raw.
    fn decompose(&self, range: TimeRange) -> Vec<(Granularity, TimeRange)> {
        let mut pieces = Vec::new();
        let mut cursor = range.start;

        while cursor < range.end {
            let whole = Granularity::ALL
                .into_iter()
                .rev()
                .filter(|g| *g != Granularity::FINEST)
                .map(|g| (g, self.hierarchy.bucket(g, cursor)))
                .find(|(_, bucket)| bucket.start == cursor && bucket.end <= range.end);

            let piece = whole.unwrap_or_else(|| {
                let end = Granularity::FINEST
                    .parent()
                    .map_or(range.end, |p| self.hierarchy.bucket(p, cursor).end.min(range.end));
                (Granularity::FINEST, TimeRange { start: cursor, end })
            });

            cursor = piece.1.end;
            pieces.push(piece);
        }

        pieces
    }
}
