//! Settings loading and component construction.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `TALLY_*` environment variables, with `__` separating nested keys:
//!
//! ```toml
//! [breaker]
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [calendar]
//! utc_offset_seconds = 0
//!
//! [store]
//! backend = "file"
//! path = "/var/lib/tally"
//! ```
//!
//! `TALLY_BREAKER__MAX_DELAY_MS=60000` overrides the cap from the
//! environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ConfigurationError, Result};
use crate::file::FileStore;
use crate::guard::{BreakerConfig, FastFailGuard};
use crate::memory::MemoryStore;
use crate::period::PeriodHierarchy;
use crate::reader::RollupReader;
use crate::store::MetricStore;

/// Prefix of environment variables read by [`Settings::load`].
pub const ENV_PREFIX: &str = "TALLY";

/// Calendar used for bucket boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Offset of the reporting calendar east of UTC, in seconds.
    pub utc_offset_seconds: i32,
}

/// Available store backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local, lost on exit.
    #[default]
    Memory,
    /// JSON documents in a directory.
    File,
}

/// Store selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Which backend to open.
    pub backend: Backend,
    /// Store directory; required by [`Backend::File`].
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Returns a configuration for a file store rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::File,
            path: Some(path.into()),
        }
    }

    /// Validates the store selection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingStorePath`] for a file backend
    /// without a path.
    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::File && self.path.is_none() {
            return Err(ConfigurationError::MissingStorePath.into());
        }
        Ok(())
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Fast-fail delay policy.
    pub breaker: BreakerConfig,
    /// Bucket calendar.
    pub calendar: CalendarConfig,
    /// Store backend.
    pub store: StoreConfig,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file, and the
    /// environment, then validates them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Load`] if a source cannot be read or
    /// deserialized, or the validation error of the first invalid section.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder
                .add_source(::config::File::from(path).format(::config::FileFormat::Toml));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(::config::Config::try_deserialize)
            .map_err(ConfigurationError::from)?;

        settings.validate()?;
        tracing::debug!(?settings, "loaded settings");
        Ok(settings)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`] found.
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.hierarchy()?;
        self.store.validate()
    }

    /// Returns the bucket arithmetic for the configured calendar.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidUtcOffset`] if the offset is out
    /// of range.
    pub fn hierarchy(&self) -> Result<PeriodHierarchy> {
        PeriodHierarchy::with_offset_seconds(self.calendar.utc_offset_seconds)
    }

    /// Builds a reader with its own fast-fail guard, both driven by `clock`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the breaker policy or calendar is
    /// invalid.
    pub fn reader(&self, clock: Arc<dyn Clock>) -> Result<RollupReader> {
        let guard = Arc::new(FastFailGuard::new(self.breaker, Arc::clone(&clock))?);
        Ok(RollupReader::new(self.hierarchy()?, guard, clock))
    }
}

/// Opens the store selected by `config`.
///
/// # Errors
///
/// - [`ConfigurationError::MissingStorePath`] for a file backend without a
///   path
/// - any error from [`FileStore::open`]
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn MetricStore>> {
    config.validate()?;

    match (config.backend, config.path.as_deref()) {
        (Backend::Memory, _) => Ok(Arc::new(MemoryStore::new())),
        (Backend::File, Some(path)) => {
            tracing::debug!(path = %path.display(), "opening file store");
            Ok(Arc::new(FileStore::open(path)?))
        }
        (Backend::File, None) => Err(ConfigurationError::MissingStorePath.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::TallyError;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.breaker, BreakerConfig::default());
        assert_eq!(settings.calendar.utc_offset_seconds, 0);
        assert_eq!(settings.store.backend, Backend::Memory);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("tally.toml");
        fs::write(
            &path,
            r#"
[breaker]
initial_delay_ms = 250

[calendar]
utc_offset_seconds = 3600

[store]
backend = "file"
path = "/tmp/tally-store"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.breaker.initial_delay_ms, 250);
        assert_eq!(settings.breaker.max_delay_ms, crate::guard::MAX_DELAY_MS);
        assert_eq!(settings.calendar.utc_offset_seconds, 3600);
        assert_eq!(settings.store, StoreConfig::file("/tmp/tally-store"));
    }

    #[test]
    fn test_load_rejects_invalid_policy() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("tally.toml");
        fs::write(&path, "[breaker]\ninitial_delay_ms = 0\n").unwrap();

        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(matches!(
            err,
            TallyError::Configuration(ConfigurationError::InvalidBreakerPolicy { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let temp_dir = tempdir().unwrap();
        let err = Settings::load(Some(&temp_dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(
            err,
            TallyError::Configuration(ConfigurationError::Load(_))
        ));
    }

    #[test]
    fn test_file_backend_requires_path() {
        let config = StoreConfig {
            backend: Backend::File,
            path: None,
        };
        assert!(matches!(
            open_store(&config),
            Err(TallyError::Configuration(ConfigurationError::MissingStorePath))
        ));
    }

    #[test]
    fn test_open_store_selects_backend() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("store");

        open_store(&StoreConfig::default()).unwrap();
        open_store(&StoreConfig::file(&store_path)).unwrap();
        assert!(store_path.join("meta.json").exists());
    }

    #[test]
    fn test_reader_uses_calendar() {
        let settings = Settings {
            calendar: CalendarConfig {
                utc_offset_seconds: -5 * 3600,
            },
            ..Settings::default()
        };
        let reader = settings.reader(Arc::new(SystemClock)).unwrap();
        assert_eq!(reader.hierarchy().offset().local_minus_utc(), -5 * 3600);
    }
}
