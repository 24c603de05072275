//! Fast-fail guard for store access.
//!
//! When the store starts failing, every caller retrying at full latency
//! turns an outage into a pile-up. The guard remembers the last failure and
//! makes callers fail immediately until a cool-down expires, then lets the
//! next call through as a probe. Each failure without an intervening success
//! doubles the next cool-down, up to a cap.
//!
//! # States
//!
//! ```text
//!            mark_failure()
//!  healthy ─────────────────► open (until = now + delay)
//!     ▲                         │
//!     └──── mark_success() ─────┘
//! ```
//!
//! There is no timer: cool-down expiry is evaluated lazily by
//! [`FastFailGuard::proceed`]. The hot path reads two atomics; only state
//! transitions take the mutex.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tally::clock::SystemClock;
//! use tally::guard::{BreakerConfig, FastFailGuard};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = FastFailGuard::new(BreakerConfig::default(), Arc::new(SystemClock))?;
//! assert!(guard.proceed());
//!
//! guard.mark_failure();
//! assert!(!guard.proceed());
//!
//! guard.mark_success();
//! assert!(guard.proceed());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{ConfigurationError, Result, StoreResult, TallyError};

/// Default cool-down after the first failure.
pub const INITIAL_DELAY_MS: u64 = 1_000;

/// Default upper bound on any single cool-down.
pub const MAX_DELAY_MS: u64 = 30_000;

/// Delay policy for [`FastFailGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Cool-down applied after the first failure, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the cool-down, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: INITIAL_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
        }
    }
}

impl BreakerConfig {
    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidBreakerPolicy`] if the initial
    /// delay is zero or exceeds the cap.
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigurationError::InvalidBreakerPolicy {
                reason: "initial_delay_ms cannot be zero".to_string(),
            }
            .into());
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigurationError::InvalidBreakerPolicy {
                reason: format!(
                    "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the cool-down for a failure seen with the given multiplier.
    pub fn delay_for(&self, multiplier: u64) -> Duration {
        let millis = self
            .initial_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Process-wide fast-fail state guarding every store call.
///
/// Construct one, wrap it in an [`Arc`], and hand it to every component that
/// talks to the store.
#[derive(Debug)]
pub struct FastFailGuard {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    /// Set while open.
    failing: AtomicBool,
    /// Epoch millis before which callers fail fast.
    until_ms: AtomicI64,
    /// Next failure's delay multiplier; also serializes transitions.
    multiplier: Mutex<u64>,
}

impl FastFailGuard {
    /// Creates a healthy guard.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidBreakerPolicy`] if `config` is
    /// invalid.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            failing: AtomicBool::new(false),
            until_ms: AtomicI64::new(0),
            multiplier: Mutex::new(1),
        })
    }

    /// Returns `true` if a store call may be attempted now.
    ///
    /// True when healthy, or when open but the cool-down has expired. Never
    /// blocks and changes nothing; the caller still reports the outcome.
    pub fn proceed(&self) -> bool {
        !self.failing.load(Ordering::Acquire)
            || self.clock.now_millis() >= self.until_ms.load(Ordering::Acquire)
    }

    /// Records a store failure and opens the guard.
    ///
    /// Returns the cool-down that was applied. The multiplier doubles after
    /// every call; the applied delay never exceeds the configured cap.
    pub fn mark_failure(&self) -> Duration {
        let mut multiplier = self.multiplier.lock().unwrap_or_else(PoisonError::into_inner);

        let delay = self.config.delay_for(*multiplier);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.until_ms.store(
            self.clock.now_millis().saturating_add(delay_ms),
            Ordering::Release,
        );
        self.failing.store(true, Ordering::Release);
        *multiplier = multiplier.saturating_mul(2);

        tracing::error!(delay_ms, "store failing, entering fast-fail mode");
        delay
    }

    /// Records a store success, closing the guard if it was open.
    pub fn mark_success(&self) {
        if !self.failing.load(Ordering::Acquire) {
            return;
        }

        let mut multiplier = self.multiplier.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.failing.load(Ordering::Acquire) {
            return;
        }
        self.failing.store(false, Ordering::Release);
        self.until_ms.store(0, Ordering::Release);
        *multiplier = 1;

        tracing::warn!("store recovered, leaving fast-fail mode");
    }

    /// Runs one store operation under the guard.
    ///
    /// - guard closed to calls: returns [`TallyError::BackendUnavailable`]
    ///   without running `op`
    /// - `Ok`: marks success
    /// - transient error: marks failure and returns the error
    /// - permanent error: returns the error, guard state untouched
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::BackendUnavailable`] when short-circuited, or
    /// the store error produced by `op`.
    pub fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> StoreResult<T>,
    {
        if !self.proceed() {
            let retry_after = self.retry_after();
            tracing::debug!(?retry_after, "fast-failing store call");
            return Err(TallyError::BackendUnavailable { retry_after });
        }

        match op() {
            Ok(value) => {
                self.mark_success();
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    self.mark_failure();
                }
                Err(err.into())
            }
        }
    }

    /// Returns `true` while the guard is open, even after the cool-down has
    /// expired but before a success has been reported.
    pub fn is_in_failure_mode(&self) -> bool {
        self.failing.load(Ordering::Acquire)
    }

    /// Returns the multiplier the next failure will use.
    pub fn multiplier(&self) -> u64 {
        *self.multiplier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the time left until calls are let through again.
    pub fn retry_after(&self) -> Duration {
        if !self.is_in_failure_mode() {
            return Duration::ZERO;
        }
        let remaining = self
            .until_ms
            .load(Ordering::Acquire)
            .saturating_sub(self.clock.now_millis());
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    /// Returns the active delay policy.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}
