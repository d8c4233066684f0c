use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::store::{Catalog, CatalogEntry, CatalogError};
use darkroom_pipeline::{ConsumerError, Envelope, ItemHandler, UploadEvent, UploadEventKind, UploadNotice};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Image types the catalog accepts
pub const ALLOWED_IMAGE_TYPES: [&str; 2] = ["jpeg", "png"];

/// Errors that can occur while recording an upload
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unsupported image type for {key}: {extension}")]
    UnsupportedImageType { key: String, extension: String },

    #[error("Could not determine the image type for {key}")]
    UnknownImageType { key: String },

    #[error("Uploaded object missing from store: {key}")]
    ObjectMissing { key: String },

    #[error("Object store failure: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("Catalog failure: {0}")]
    Catalog(#[from] CatalogError),
}

impl From<IngestError> for ConsumerError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::UnsupportedImageType { .. } | IngestError::UnknownImageType { .. } => {
                ConsumerError::ValidationError(error.to_string())
            }
            IngestError::ObjectMissing { .. }
            | IngestError::ObjectStore(_)
            | IngestError::Catalog(_) => ConsumerError::DependencyError(error.to_string()),
        }
    }
}

/// Records upload events in the catalog.
///
/// Creations are validated against the allowed image types and the upload
/// store before anything is cataloged; removals drop the entry no matter what
/// the key looks like, since the object is already gone.
pub struct CatalogRecorder {
    object_store: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
}

impl CatalogRecorder {
    pub fn new(object_store: Arc<dyn ObjectStore>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            object_store,
            catalog,
        }
    }

    /// Apply one upload event to the catalog
    #[instrument(skip(self, event), fields(object_key = %event.object_key, kind = event.kind.as_str()))]
    pub async fn apply(&self, event: &UploadEvent) -> Result<(), IngestError> {
        match event.kind {
            UploadEventKind::Created => self.record_upload(event).await,
            UploadEventKind::Removed => self.remove_upload(event).await,
        }
    }

    async fn record_upload(&self, event: &UploadEvent) -> Result<(), IngestError> {
        if let Err(error) = validate_image_type(&event.object_key) {
            warn!(error = %error, "Rejecting upload");
            metrics::counter!("catalog.uploads.rejected").increment(1);
            return Err(error);
        }

        if !self.object_store.exists(&event.object_key).await? {
            metrics::counter!("catalog.uploads.missing_object").increment(1);
            return Err(IngestError::ObjectMissing {
                key: event.object_key.clone(),
            });
        }

        let inserted = self
            .catalog
            .record(CatalogEntry::new(&event.object_key))
            .await?;

        if inserted {
            info!("Image cataloged");
            metrics::counter!("catalog.entries.recorded").increment(1);
        } else {
            debug!("Image already cataloged");
            metrics::counter!("catalog.entries.duplicate").increment(1);
        }
        Ok(())
    }

    async fn remove_upload(&self, event: &UploadEvent) -> Result<(), IngestError> {
        let removed = self.catalog.remove(&event.object_key).await?;

        if removed {
            info!("Image removed from catalog");
            metrics::counter!("catalog.entries.removed").increment(1);
        } else {
            debug!("Removal for a key that was never cataloged");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ItemHandler for CatalogRecorder {
    async fn handle_item(&self, envelope: &Envelope) -> Result<(), ConsumerError> {
        let notice = UploadNotice::from_message(&envelope.message)
            .map_err(|e| ConsumerError::DecodeError(e.to_string()))?;

        // Records re-applied after a redelivery settle as no-ops, so failing
        // fast here cannot double-catalog the earlier records.
        for event in &notice.records {
            self.apply(event).await?;
        }
        Ok(())
    }
}

/// Check the key's extension against the allowed image types.
///
/// The comparison is exact: keys arrive verbatim from the provider and
/// `.PNG` is not an allowed type.
fn validate_image_type(key: &str) -> Result<(), IngestError> {
    let Some((_, extension)) = key.rsplit_once('.') else {
        return Err(IngestError::UnknownImageType {
            key: key.to_string(),
        });
    };

    if ALLOWED_IMAGE_TYPES.contains(&extension) {
        Ok(())
    } else {
        Err(IngestError::UnsupportedImageType {
            key: key.to_string(),
            extension: extension.to_string(),
        })
    }
}
