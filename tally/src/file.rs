//! Directory-backed [`MetricStore`] backend.
//!
//! Each entity is one pretty-printed JSON document holding all of its
//! records. Writes are read-modify-write of that document under a process
//! lock and are made durable by writing a temporary file and renaming it
//! over the previous version.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── meta.json                   <- Store format version
//! ├── entity_<hex id>.json        <- All records of one entity
//! └── ...
//! ```
//!
//! Entity ids are hex-encoded in file names so any id is a valid file name.
//! I/O failures surface as `Unavailable`; documents that fail to parse, or a
//! format version mismatch, surface as `Corrupt`.

use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result, StoreError, StoreResult};
use crate::period::Granularity;
use crate::record::{Record, TimeRange};
use crate::store::{EntityMeta, MetricStore, check_entity};

/// Store format version.
const FORMAT_VERSION: u32 = 1;

/// Name of the metadata file in the store directory.
const METADATA_FILE: &str = "meta.json";

/// Metadata stored in the store's meta.json file.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    /// Format version.
    version: u32,
}

/// One entity's document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EntityDocument {
    records: Vec<Record>,
}

/// A store keeping one JSON document per entity in a directory.
#[derive(Debug)]
pub struct FileStore {
    /// Path to the store directory.
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Creates a new store directory or opens an existing one.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::StoreDirectory`] if the directory or its
    ///   metadata file cannot be created
    /// - [`StoreError::Corrupt`] if an existing metadata file is invalid or
    ///   has an unsupported version
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata_path = path.join(METADATA_FILE);

        if metadata_path.exists() {
            let content = fs::read_to_string(&metadata_path)
                .map_err(|e| io_unavailable(&metadata_path, e))?;
            let metadata: StoreMetadata =
                serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                    reason: format!("{}: {e}", metadata_path.display()),
                })?;
            if metadata.version != FORMAT_VERSION {
                return Err(StoreError::Corrupt {
                    reason: format!(
                        "unsupported store format version: expected {}, found {}",
                        FORMAT_VERSION, metadata.version
                    ),
                }
                .into());
            }
        } else {
            fs::create_dir_all(&path).map_err(|e| ConfigurationError::StoreDirectory {
                path: path.display().to_string(),
                source: e,
            })?;

            let metadata = StoreMetadata {
                version: FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&metadata).map_err(|e| {
                StoreError::Corrupt {
                    reason: format!("failed to serialize metadata: {e}"),
                }
            })?;
            fs::write(&metadata_path, content).map_err(|e| {
                ConfigurationError::StoreDirectory {
                    path: metadata_path.display().to_string(),
                    source: e,
                }
            })?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entity_path(&self, entity_id: &str) -> PathBuf {
        let mut name = String::with_capacity(entity_id.len() * 2 + 12);
        name.push_str("entity_");
        for byte in entity_id.bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".json");
        self.path.join(name)
    }

    fn load(&self, entity_id: &str) -> StoreResult<EntityDocument> {
        let path = self.entity_path(entity_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(EntityDocument::default()),
            Err(e) => return Err(io_unavailable(&path, e)),
        };

        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            reason: format!("{}: {e}", path.display()),
        })
    }

    fn save(&self, entity_id: &str, document: &EntityDocument) -> StoreResult<()> {
        let path = self.entity_path(entity_id);
        let content = serde_json::to_string_pretty(document).map_err(|e| StoreError::Corrupt {
            reason: format!("failed to serialize records for '{entity_id}': {e}"),
        })?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|e| io_unavailable(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| io_unavailable(&path, e))
    }
}

impl MetricStore for FileStore {
    fn find(
        &self,
        entity_id: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Record>> {
        let document = self.load(entity_id)?;
        let mut found: Vec<Record> = document
            .records
            .into_iter()
            .filter(|r| r.granularity == granularity && range.contains(r.bucket_start))
            .collect();
        found.sort_by_key(|r| r.bucket_start);
        Ok(found)
    }

    fn persist(&self, entity_id: &str, record: &Record) -> StoreResult<()> {
        check_entity(entity_id, record)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load(entity_id)?;

        match document.records.iter_mut().find(|r| {
            r.granularity == record.granularity && r.bucket_start == record.bucket_start
        }) {
            Some(existing) => *existing = record.clone(),
            None => document.records.push(record.clone()),
        }

        self.save(entity_id, &document)
    }

    fn meta(&self, entity_id: &str) -> StoreResult<EntityMeta> {
        let document = self.load(entity_id)?;
        Ok(EntityMeta::from_records(entity_id, &document.records))
    }
}

fn io_unavailable(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Unavailable {
        reason: format!("I/O failure on '{}'", path.display()),
        source: Some(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Fields;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record(entity: &str, d: u32, views: i64) -> Record {
        let at = Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap();
        Record::new(entity, Granularity::Daily, at, Fields::new()).with_field("views", views)
    }

    #[test]
    fn test_open_creates_metadata() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("store");

        let store = FileStore::open(&store_path).unwrap();
        assert!(store.path().join(METADATA_FILE).exists());

        // Reopening an existing store succeeds.
        FileStore::open(&store_path).unwrap();
    }

    #[test]
    fn test_open_rejects_unknown_version() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join(METADATA_FILE), r#"{"version": 99}"#).unwrap();

        let err = FileStore::open(temp_dir.path()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::TallyError::Store(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_entity_ids_are_hex_encoded() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        let path = store.entity_path("a/b");
        assert_eq!(path.file_name().unwrap(), "entity_612f62.json");
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();
        fs::write(store.entity_path("bugs"), "not json").unwrap();

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let err = store.find("bugs", Granularity::Daily, range).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_persist_upserts() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).unwrap();

        store.persist("bugs", &record("bugs", 1, 1)).unwrap();
        store.persist("bugs", &record("bugs", 1, 5)).unwrap();
        store.persist("bugs", &record("bugs", 2, 2)).unwrap();

        let meta = store.meta("bugs").unwrap();
        assert_eq!(meta.record_count, 2);

        assert!(store.persist("other", &record("bugs", 3, 1)).is_err());
    }
}
