use crate::store::{format_catalog_date, Catalog, CatalogError, MetadataPatch, UpdateOutcome};
use chrono::Utc;
use darkroom_pipeline::{DeliveryError, MetadataEvent, PushSubscriber, TopicMessage};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Applies metadata submissions to cataloged entries.
///
/// Delivered by push from the topic; the subscription filter decides which
/// metadata kinds reach it. The patch always covers caption and photographer
/// plus a server-stamped date, so re-applying a submission converges to the
/// same entry apart from that timestamp.
///
/// Update-only: submissions for keys that were never cataloged (or already
/// removed) are counted and dropped rather than creating a half-empty entry.
pub struct MetadataUpdater {
    catalog: Arc<dyn Catalog>,
}

impl MetadataUpdater {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    #[instrument(skip(self, event), fields(filename = %event.id))]
    pub async fn apply(&self, event: &MetadataEvent) -> Result<UpdateOutcome, CatalogError> {
        let patch = MetadataPatch {
            caption: Some(event.caption.clone()),
            photographer: Some(event.photographer.clone()),
            date: Some(format_catalog_date(Utc::now())),
        };

        let outcome = self.catalog.apply_metadata(&event.id, patch).await?;
        match &outcome {
            UpdateOutcome::Applied(_) => {
                info!("Metadata applied");
                metrics::counter!("catalog.metadata.applied").increment(1);
            }
            UpdateOutcome::EntryMissing => {
                warn!("Metadata for a key that is not cataloged");
                metrics::counter!("catalog.metadata.missing_entry").increment(1);
            }
        }
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl PushSubscriber for MetadataUpdater {
    fn name(&self) -> &str {
        "metadata-updater"
    }

    async fn deliver(&self, message: TopicMessage) -> Result<(), DeliveryError> {
        let kind = message.metadata_type().unwrap_or("unknown").to_string();
        let event: MetadataEvent = message
            .decode_body()
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        info!(metadata_type = %kind, filename = %event.id, "Metadata submission received");
        self.apply(&event)
            .await
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogEntry, MemoryCatalog};

    fn caption_event(id: &str) -> MetadataEvent {
        MetadataEvent {
            id: id.to_string(),
            caption: "Sunrise over the bay".to_string(),
            photographer: "Ana".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_patches_existing_entry() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();
        let updater = MetadataUpdater::new(catalog.clone());

        let outcome = updater.apply(&caption_event("cat.png")).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied(_)));

        let entry = catalog.get("cat.png").await.unwrap().unwrap();
        assert_eq!(entry.caption.as_deref(), Some("Sunrise over the bay"));
        assert_eq!(entry.photographer.as_deref(), Some("Ana"));
        // "YYYY-MM-DD HH:MM:SS"
        assert_eq!(entry.date.unwrap().len(), 19);
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_created() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let updater = MetadataUpdater::new(catalog.clone());

        let outcome = updater.apply(&caption_event("ghost.png")).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::EntryMissing);
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn test_reapplying_converges() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();
        let updater = MetadataUpdater::new(catalog.clone());

        updater.apply(&caption_event("cat.png")).await.unwrap();
        let first = catalog.get("cat.png").await.unwrap().unwrap();
        updater.apply(&caption_event("cat.png")).await.unwrap();
        let second = catalog.get("cat.png").await.unwrap().unwrap();

        assert_eq!(first.caption, second.caption);
        assert_eq!(first.photographer, second.photographer);
    }

    #[tokio::test]
    async fn test_deliver_decodes_and_applies() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();
        let updater = MetadataUpdater::new(catalog.clone());

        let message = caption_event("cat.png").into_message("Caption").unwrap();
        updater.deliver(message).await.unwrap();

        let entry = catalog.get("cat.png").await.unwrap().unwrap();
        assert!(entry.date.is_some());
    }

    #[tokio::test]
    async fn test_deliver_rejects_malformed_body() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let updater = MetadataUpdater::new(catalog);

        let message = TopicMessage::new(serde_json::json!({"caption": "no id"}));
        let result = updater.deliver(message).await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_deliver_tolerates_missing_entry() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let updater = MetadataUpdater::new(catalog);

        let message = caption_event("ghost.png").into_message("Caption").unwrap();
        assert!(updater.deliver(message).await.is_ok());
    }
}
