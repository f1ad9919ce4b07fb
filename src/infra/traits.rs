//! Trait definitions for the storage seams of the sequencer

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    CounterState, DefinitionFormat, DefinitionId, NewDefinition, SequenceDefinition, SequenceKey,
    TenantId,
};

use super::Result;

/// Computes the next counter state from the definition read under the lock.
///
/// Optimistic backends may call it more than once per allocation, so it must
/// be a pure function of its input.
pub type CounterMutation<'a> =
    &'a (dyn Fn(&SequenceDefinition) -> Result<CounterState> + Send + Sync);

/// Locked read-modify-write over the counter row of one sequence.
///
/// Invariant: for a given key at most one `with_row_lock` call observes and
/// commits a given counter value, across every process sharing the store.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Run `mutate` on the active definition for `key` while holding exclusive
    /// access to its row, then durably commit the returned counter state.
    ///
    /// Returns the definition as committed. Fails with `NotFound` when the
    /// definition is missing or deleted, `LockTimeout` when exclusive access
    /// is not obtained within `timeout`, and `PersistenceFailure` when the
    /// commit fails (in which case nothing is visible to later readers).
    async fn with_row_lock(
        &self,
        key: &SequenceKey,
        timeout: Duration,
        mutate: CounterMutation<'_>,
    ) -> Result<SequenceDefinition>;

    /// Cheap connectivity probe for readiness checks
    async fn ping(&self) -> Result<()>;
}

/// Persistence of sequence definitions for administration.
///
/// Never writes the counter columns of an existing row.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Insert a new definition with `last_number = 0` and the given year.
    ///
    /// An active definition for the same key is a `Conflict`. A soft-deleted
    /// one is revived with the new format and its counter kept.
    async fn insert(&self, definition: NewDefinition, year: i32) -> Result<SequenceDefinition>;

    /// Replace the format of an active definition
    async fn update_format(
        &self,
        id: DefinitionId,
        format: DefinitionFormat,
    ) -> Result<SequenceDefinition>;

    /// Soft-delete an active definition
    async fn soft_delete(&self, id: DefinitionId) -> Result<()>;

    /// Get an active definition by id
    async fn get(&self, id: DefinitionId) -> Result<Option<SequenceDefinition>>;

    /// Get the active definition for a key
    async fn find(&self, key: &SequenceKey) -> Result<Option<SequenceDefinition>>;

    /// Active definitions of a tenant, ordered by document type
    async fn list(&self, tenant_id: &TenantId) -> Result<Vec<SequenceDefinition>>;
}

/// Source of the current instant, injected so the year boundary is testable
/// and the timezone is explicit.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

/// Clock pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl FixedClock {
    pub fn at_utc(instant: DateTime<Utc>) -> Self {
        Self(instant.with_timezone(&Utc.fix()))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    #[test]
    fn test_fixed_clock_year() {
        let clock = FixedClock::at_utc(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(clock.now().year(), 2025);
    }

    #[test]
    fn test_offset_changes_year_at_boundary() {
        let instant = Utc.with_ymd_and_hms(2024, 12, 31, 23, 30, 0).unwrap();
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(instant.year(), 2024);
        assert_eq!(instant.with_timezone(&plus_two).year(), 2025);
    }
}
