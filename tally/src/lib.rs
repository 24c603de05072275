//! # tally
//!
//! Hierarchical time-series rollup reader with a fast-fail store guard.
//!
//! tally answers "what is the total of each metric for this entity over this
//! window" at a chosen granularity (realtime, hourly, daily, monthly, yearly).
//! Totals are read from the coarsest records the store already holds and
//! rebuilt from finer records where coarse ones are missing. Closed buckets
//! rebuilt this way are written back, so repeated reads of history become
//! direct lookups. Buckets that are still open are never cached.
//!
//! All store access goes through a shared [`FastFailGuard`]: after a store
//! outage, callers fail immediately for an exponentially growing cool-down
//! instead of piling up behind a dead backend.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use tally::{
//!     BreakerConfig, FastFailGuard, Fields, Granularity, MemoryStore, MetricStore,
//!     PeriodHierarchy, Record, RollupReader, TimeRange,
//! };
//! use tally::clock::{Clock, SystemClock};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let guard = Arc::new(FastFailGuard::new(BreakerConfig::default(), clock.clone())?);
//! let reader = RollupReader::new(PeriodHierarchy::utc(), guard, clock);
//!
//! // Raw samples for one entity
//! let store = MemoryStore::new();
//! let at = Utc.with_ymd_and_hms(2020, 3, 1, 9, 30, 0).unwrap();
//! store.persist("bugs", &Record::new("bugs", Granularity::Realtime, at, Fields::new())
//!     .with_field("views", 2))?;
//!
//! // Daily total, rolled up from the raw samples and cached as a DAILY record
//! let day = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
//! let range = TimeRange::new(day, day + chrono::Days::new(1))?;
//! let views = reader.read_field("bugs", "views", Granularity::Daily, range, &store, false)?;
//! assert_eq!(views, Some(2.into()));
//! assert_eq!(store.count_at("bugs", Granularity::Daily), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`RollupReader`]: Recursive read with lazy materialization of closed buckets
//! - [`FastFailGuard`]: Shared fast-fail state in front of every store call
//! - [`MetricStore`]: Persistence contract; [`MemoryStore`] and [`FileStore`] implement it
//! - [`PeriodHierarchy`]: Calendar bucket arithmetic for each [`Granularity`]
//! - [`Settings`]: Layered configuration and component construction
//!
//! ## Modules
//!
//! - [`reader`]: Rollup reads, range summaries and series
//! - [`guard`]: Fast-fail guard and its delay policy
//! - [`store`]: Store trait and entity metadata
//! - [`memory`]: In-memory store
//! - [`file`]: Directory-backed JSON store
//! - [`period`]: Granularities and bucket boundaries
//! - [`record`]: Records, field maps and time ranges
//! - [`clock`]: Time sources
//! - [`config`]: Settings and store factory
//! - [`error`]: Error types

pub mod clock;
pub mod config;
pub mod error;
pub mod file;
pub mod guard;
pub mod memory;
pub mod period;
pub mod reader;
pub mod record;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use self::config::{Settings, StoreConfig, open_store};
pub use error::{ConfigurationError, RangeError, Result, StoreError, TallyError};
pub use file::FileStore;
pub use guard::{BreakerConfig, FastFailGuard};
pub use memory::MemoryStore;
pub use period::{Granularity, PeriodHierarchy};
pub use reader::{RollupReader, SeriesPoint};
pub use record::{Fields, Record, TimeRange};
pub use store::{EntityMeta, MetricStore};
