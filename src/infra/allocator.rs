//! Document number allocator
//!
//! Advances the counter of one (tenant, document type) sequence and returns
//! the formatted number. The exclusive section is delegated to the
//! [`SequenceStore`], so the same algorithm runs over pessimistic row locks
//! (PostgreSQL) and optimistic compare-and-swap (SQLite).
//!
//! # Guarantees
//!
//! - **Unique**: a formatted number is returned to at most one caller per key
//!   for the lifetime of the definition
//! - **Atomic rollover**: the yearly reset and the increment commit together
//! - **No partial state**: any error leaves the persisted counter untouched,
//!   so a retry is always safe (it may skip a value, never repeat one)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, TimeZone};
use tracing::{debug, instrument, warn};

use crate::domain::{AllocatedNumber, DocumentType, SequenceDefinition, SequenceKey, TenantId};
use crate::metrics::{metric_names, MetricsRegistry};

use super::retry::{Retry, RetryConfig};
use super::{Clock, Result, SequenceStore, SequencerError, SystemClock};

/// Allocator tuning.
///
/// `lock_timeout` bounds a single attempt. [`Allocator::allocate_next_with_retry`]
/// gives every attempt the full budget, so a caller can wait up to
/// [`AllocatorConfig::max_wait`]: `(retry.max_retries + 1) * lock_timeout`
/// plus the backoff between attempts. With the defaults that is about 20s.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Upper bound on waiting for a row lock, per attempt
    pub lock_timeout: Duration,
    /// Backoff used by [`Allocator::allocate_next_with_retry`]
    pub retry: RetryConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            retry: RetryConfig::allocation(),
        }
    }
}

impl AllocatorConfig {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Longest a retried allocation can block, assuming every attempt
    /// times out and every backoff lands at the top of its jitter range.
    pub fn max_wait(&self) -> Duration {
        let retry = &self.retry;
        let attempts = retry.max_retries.saturating_add(1);
        let mut total = self.lock_timeout.saturating_mul(attempts);

        let spread = 1.0 + retry.jitter;
        let cap = retry.max_delay.as_secs_f64();
        for attempt in 0..retry.max_retries {
            let exponent = attempt.min(i32::MAX as u32) as i32;
            let delay = (retry.initial_delay.as_secs_f64() * retry.multiplier.powi(exponent)).min(cap);
            let step = Duration::from_secs_f64((delay * spread).max(0.0));
            if delay >= cap {
                // Every remaining backoff is capped.
                return total.saturating_add(step.saturating_mul(retry.max_retries - attempt));
            }
            total = total.saturating_add(step);
        }
        total
    }
}

/// Allocates sequential document numbers
pub struct Allocator {
    store: Arc<dyn SequenceStore>,
    clock: Arc<dyn Clock>,
    config: AllocatorConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Allocator {
    /// Create an allocator over `store` using the UTC wall clock
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::utc()),
            config: AllocatorConfig::default(),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate the next number, taking "now" from the configured clock
    pub async fn allocate_next(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<AllocatedNumber> {
        let now = self.clock.now();
        self.allocate_next_at(tenant_id, document_type, &now).await
    }

    /// Allocate the next number as of `now`.
    ///
    /// The calendar year used for rollover is `now.year()` in `now`'s own
    /// timezone.
    #[instrument(skip(self, now), fields(tenant_id = %tenant_id, document_type = %document_type))]
    pub async fn allocate_next_at<Tz: TimeZone>(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
        now: &DateTime<Tz>,
    ) -> Result<AllocatedNumber> {
        let key = SequenceKey::new(tenant_id.clone(), document_type.clone());
        let year = now.year();
        let start = Instant::now();

        let rolled_over = AtomicBool::new(false);
        let mutate = |current: &SequenceDefinition| {
            rolled_over.store(
                current.reset_every_year && current.last_generated_year != year,
                Ordering::Relaxed,
            );
            current.next_counter(year).map_err(SequencerError::from)
        };

        let result = self
            .store
            .with_row_lock(&key, self.config.lock_timeout, &mutate)
            .await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(&result, rolled_over.load(Ordering::Relaxed), elapsed_ms)
            .await;

        let committed = result?;
        let allocated = AllocatedNumber::from_committed(&committed);

        debug!(
            formatted_number = %allocated.formatted_number,
            raw_number = allocated.raw_number,
            year = allocated.year,
            "Allocated document number"
        );

        Ok(allocated)
    }

    /// Allocate, retrying `LockTimeout` and `PersistenceFailure` with backoff.
    ///
    /// Non-retryable errors (`NotFound`, validation) are returned immediately.
    /// Each attempt gets the full `lock_timeout`; see [`AllocatorConfig::max_wait`].
    pub async fn allocate_next_with_retry(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<AllocatedNumber> {
        let retry = Retry::new(self.config.retry.clone());
        let outcome = retry
            .run_with_predicate(
                || self.allocate_next(tenant_id, document_type),
                SequencerError::is_retryable,
            )
            .await;

        if outcome.attempts > 1 {
            debug!(
                attempts = outcome.attempts,
                duration_ms = outcome.total_duration.as_millis(),
                "Allocation finished after retries"
            );
        }

        outcome.into_result()
    }

    async fn record(&self, result: &Result<SequenceDefinition>, rolled_over: bool, elapsed_ms: f64) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        metrics
            .observe_histogram(metric_names::ALLOCATION_LATENCY_MS, elapsed_ms)
            .await;

        match result {
            Ok(_) => {
                metrics.inc_counter(metric_names::ALLOCATIONS).await;
                if rolled_over {
                    metrics.inc_counter(metric_names::YEAR_ROLLOVERS).await;
                }
            }
            Err(SequencerError::NotFound(_)) => {
                metrics.inc_counter(metric_names::ALLOCATION_NOT_FOUND).await;
            }
            Err(SequencerError::LockTimeout { key, waited_ms }) => {
                warn!(key = %key, waited_ms, "Sequence lock timed out");
                metrics
                    .inc_counter(metric_names::ALLOCATION_LOCK_TIMEOUTS)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Allocation failed");
                metrics.inc_counter(metric_names::ALLOCATION_FAILURES).await;
            }
        }
    }
}
