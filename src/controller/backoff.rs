//! # Backoff
//!
//! Two retry schedules:
//!
//! - [`BackoffPolicy`]: bounded attempt schedule used *inside* a single driver call
//!   sequence (create-volume). Delays grow by a constant factor and the number of
//!   attempts is fixed.
//! - [`RequeueBackoff`]: per-resource requeue delay used by the reconcilers'
//!   error policy. Doubles on each consecutive failure up to a cap and resets on
//!   success. [`BackoffRegistry`] keeps one per resource.
//!
//! ## Usage
//!
//! ```rust
//! use csi_sidecar::controller::backoff::{BackoffPolicy, RequeueBackoff};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_secs(5), 1.2, 10);
//! assert_eq!(policy.delays().count(), 9);
//!
//! let mut requeue = RequeueBackoff::new(Duration::from_secs(1), Duration::from_secs(4));
//! assert_eq!(requeue.next_backoff(), Duration::from_secs(1));
//! assert_eq!(requeue.next_backoff(), Duration::from_secs(2));
//! assert_eq!(requeue.next_backoff(), Duration::from_secs(4));
//! assert_eq!(requeue.next_backoff(), Duration::from_secs(4));
//! ```

use crate::constants::{
    CREATE_VOLUME_BACKOFF_FACTOR, CREATE_VOLUME_BACKOFF_INITIAL, CREATE_VOLUME_BACKOFF_STEPS,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential attempt schedule
///
/// `steps` is the total number of attempts. Between two attempts the caller
/// sleeps for the next value of [`BackoffPolicy::delays`], so there are
/// `steps - 1` delays: `initial`, `initial * factor`, `initial * factor^2`, ...
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(initial: Duration, factor: f64, steps: u32) -> Self {
        Self {
            initial,
            factor,
            steps,
        }
    }

    /// Delays to sleep between consecutive attempts
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial;
        let factor = self.factor;
        (0..self.steps.saturating_sub(1)).scan(initial, move |delay, _| {
            let current = *delay;
            *delay = delay.mul_f64(factor);
            Some(current)
        })
    }

    /// Worst-case time spent sleeping across all attempts
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for BackoffPolicy {
    /// Create-volume schedule: 5s initial delay, factor 1.2, 10 attempts
    fn default() -> Self {
        Self::new(
            CREATE_VOLUME_BACKOFF_INITIAL,
            CREATE_VOLUME_BACKOFF_FACTOR,
            CREATE_VOLUME_BACKOFF_STEPS,
        )
    }
}

/// Capped doubling requeue delay
#[derive(Debug, Clone)]
pub struct RequeueBackoff {
    start: Duration,
    max: Duration,
    current: Duration,
}

impl RequeueBackoff {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            current: start.min(max),
        }
    }

    /// Current delay; advances the schedule
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Back to the starting delay
    pub fn reset(&mut self) {
        self.current = self.start.min(self.max);
    }
}

/// [`RequeueBackoff`] per resource key (`namespace/name` or `name`)
#[derive(Debug)]
pub struct BackoffRegistry {
    start: Duration,
    max: Duration,
    states: Mutex<HashMap<String, RequeueBackoff>>,
}

impl BackoffRegistry {
    #[must_use]
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Next requeue delay for `key`
    pub fn next_backoff(&self, key: &str) -> Duration {
        match self.states.lock() {
            Ok(mut states) => states
                .entry(key.to_string())
                .or_insert_with(|| RequeueBackoff::new(self.start, self.max))
                .next_backoff(),
            Err(e) => {
                warn!("Failed to lock backoff states: {}, using maximum backoff", e);
                self.max
            }
        }
    }

    /// Forget the failure history of `key` after a successful reconciliation
    pub fn reset(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}
