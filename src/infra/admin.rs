//! Administration of sequence definitions
//!
//! Creates, reconfigures, deletes and lists definitions. Never allocates and
//! never writes the counter columns.

use std::sync::Arc;

use chrono::Datelike;
use tracing::{info, instrument};

use crate::domain::{
    format_number, AllocatedNumber, DefinitionFormat, DefinitionId, DocumentType, NewDefinition,
    SequenceDefinition, SequenceKey, TenantId,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::{Clock, DefinitionRepository, Result, SequencerError, SystemClock};

/// Definition administration service
pub struct DefinitionAdmin {
    repository: Arc<dyn DefinitionRepository>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl DefinitionAdmin {
    pub fn new(repository: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            repository,
            clock: Arc::new(SystemClock::utc()),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }

    /// Create a definition with an unused counter stamped with the current year
    #[instrument(skip(self, prefix), fields(tenant_id = %tenant_id, document_type = %document_type))]
    pub async fn create(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        prefix: impl Into<String>,
        padding: u32,
        reset_every_year: bool,
    ) -> Result<SequenceDefinition> {
        let new = NewDefinition::new(
            tenant_id,
            document_type,
            DefinitionFormat::new(prefix, padding, reset_every_year),
        );
        new.validate()?;

        let year = self.clock.now().year();
        let created = self.repository.insert(new, year).await?;

        info!(definition_id = %created.id, year, "Created sequence definition");
        self.count(metric_names::DEFINITIONS_CREATED).await;
        Ok(created)
    }

    /// Replace the format of a definition; the counter is left as is
    #[instrument(skip(self, prefix))]
    pub async fn update(
        &self,
        id: DefinitionId,
        prefix: impl Into<String>,
        padding: u32,
        reset_every_year: bool,
    ) -> Result<SequenceDefinition> {
        let format = DefinitionFormat::new(prefix, padding, reset_every_year);
        format.validate()?;

        let updated = self.repository.update_format(id, format).await?;

        info!(definition_id = %id, "Updated sequence definition");
        self.count(metric_names::DEFINITIONS_UPDATED).await;
        Ok(updated)
    }

    /// Soft-delete a definition
    #[instrument(skip(self))]
    pub async fn delete(&self, id: DefinitionId) -> Result<()> {
        self.repository.soft_delete(id).await?;

        info!(definition_id = %id, "Deleted sequence definition");
        self.count(metric_names::DEFINITIONS_DELETED).await;
        Ok(())
    }

    pub async fn list(&self, tenant_id: &TenantId) -> Result<Vec<SequenceDefinition>> {
        self.repository.list(tenant_id).await
    }

    pub async fn get(&self, id: DefinitionId) -> Result<SequenceDefinition> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| SequencerError::NotFound(id.to_string()))
    }

    /// The number the next allocation would return if it ran now.
    ///
    /// Unlocked and read-only; a concurrent allocation may take this number.
    pub async fn preview_next(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<AllocatedNumber> {
        let key = SequenceKey::new(tenant_id.clone(), document_type.clone());
        let definition = self
            .repository
            .find(&key)
            .await?
            .ok_or_else(|| SequencerError::NotFound(key.to_string()))?;

        let next = definition.next_counter(self.clock.now().year())?;
        Ok(AllocatedNumber {
            definition_id: definition.id,
            formatted_number: format_number(&definition.prefix, definition.padding, next.last_number),
            raw_number: next.last_number,
            year: next.last_generated_year,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{FixedClock, MemorySequenceStore, MockDefinitionRepository};
    use chrono::{TimeZone, Utc};
    use mockall::predicate::eq;

    fn clock(year: i32) -> Arc<FixedClock> {
        Arc::new(FixedClock::at_utc(
            Utc.with_ymd_and_hms(year, 3, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_create_stamps_current_year() {
        let store = Arc::new(MemorySequenceStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let admin = DefinitionAdmin::new(store)
            .with_clock(clock(2027))
            .with_metrics(metrics.clone());

        let created = admin
            .create(TenantId::new(), DocumentType::invoice(), "INV-", 4, true)
            .await
            .unwrap();

        assert_eq!(created.last_number, 0);
        assert_eq!(created.last_generated_year, 2027);
        assert_eq!(
            metrics.get_counter(metric_names::DEFINITIONS_CREATED).await,
            1
        );
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input_without_touching_storage() {
        let mut repository = MockDefinitionRepository::new();
        repository.expect_insert().never();

        let admin = DefinitionAdmin::new(Arc::new(repository));
        let tenant = TenantId::new();

        for (doc, prefix, padding) in [
            ("Invoice", "INV-", 0),
            ("Invoice", "INV-", 33),
            ("   ", "INV-", 4),
            ("Invoice", "a-prefix-that-is-way-too-long-to-be-ok", 4),
        ] {
            let err = admin
                .create(tenant.clone(), DocumentType::from(doc), prefix, padding, false)
                .await
                .unwrap_err();
            assert!(matches!(err, SequencerError::Validation(_)), "{doc}/{padding}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let admin = DefinitionAdmin::new(Arc::new(MemorySequenceStore::new()));
        let tenant = TenantId::new();

        admin
            .create(tenant.clone(), DocumentType::receipt(), "RCP-", 4, false)
            .await
            .unwrap();
        let err = admin
            .create(tenant, DocumentType::receipt(), "R-", 2, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_passes_format_only() {
        let id = DefinitionId::new();
        let mut repository = MockDefinitionRepository::new();
        repository
            .expect_update_format()
            .with(eq(id), eq(DefinitionFormat::new("F-", 6, true)))
            .times(1)
            .returning(|_, _| Err(SequencerError::NotFound("gone".to_string())));

        let admin = DefinitionAdmin::new(Arc::new(repository));
        let err = admin.update(id, "F-", 6, true).await.unwrap_err();
        assert!(matches!(err, SequencerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_rejects_zero_padding() {
        let mut repository = MockDefinitionRepository::new();
        repository.expect_update_format().never();

        let admin = DefinitionAdmin::new(Arc::new(repository));
        let err = admin
            .update(DefinitionId::new(), "F-", 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let admin = DefinitionAdmin::new(Arc::new(MemorySequenceStore::new()));
        let created = admin
            .create(TenantId::new(), DocumentType::admission(), "ADM-", 5, false)
            .await
            .unwrap();

        admin.delete(created.id).await.unwrap();
        assert!(matches!(
            admin.get(created.id).await.unwrap_err(),
            SequencerError::NotFound(_)
        ));
        assert!(matches!(
            admin.delete(created.id).await.unwrap_err(),
            SequencerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_preview_does_not_consume() {
        let store = Arc::new(MemorySequenceStore::new());
        let admin = DefinitionAdmin::new(store.clone()).with_clock(clock(2025));
        let tenant = TenantId::new();
        let created = admin
            .create(tenant.clone(), DocumentType::invoice(), "INV-", 4, true)
            .await
            .unwrap();
        store.seed_counter(created.id, 57, 2024).await.unwrap();

        for _ in 0..2 {
            let preview = admin
                .preview_next(&tenant, &DocumentType::invoice())
                .await
                .unwrap();
            assert_eq!(preview.formatted_number, "INV-0001");
            assert_eq!(preview.year, 2025);
        }

        let stored = admin.get(created.id).await.unwrap();
        assert_eq!(stored.last_number, 57);
        assert_eq!(stored.last_generated_year, 2024);
    }

    #[tokio::test]
    async fn test_preview_unknown_is_not_found() {
        let mut repository = MockDefinitionRepository::new();
        repository.expect_find().returning(|_| Ok(None));

        let admin = DefinitionAdmin::new(Arc::new(repository));
        let err = admin
            .preview_next(&TenantId::new(), &DocumentType::invoice())
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::NotFound(_)));
    }
}
