use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

/// Errors that can occur against the catalog store
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog store unavailable: {0}")]
    Unavailable(String),
}

/// One cataloged image, keyed by its object key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Object key of the image in the upload store
    pub filename: String,
    /// Free-text caption, once supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Photographer name, once supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photographer: Option<String>,
    /// When metadata was last applied, as "YYYY-MM-DD HH:MM:SS"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl CatalogEntry {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            caption: None,
            photographer: None,
            date: None,
        }
    }
}

/// Fields to overwrite on an existing entry; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub caption: Option<String>,
    pub photographer: Option<String>,
    pub date: Option<String>,
}

/// Result of a metadata update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The entry existed and now carries the patched fields
    Applied(CatalogEntry),
    /// No entry with that key; nothing was written
    EntryMissing,
}

/// What kind of mutation a change record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One committed catalog mutation, carrying both row images
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    /// Key of the changed entry
    pub filename: String,
    /// Entry after the mutation; `None` for removals
    pub new_entry: Option<CatalogEntry>,
    /// Entry before the mutation; `None` for inserts
    pub old_entry: Option<CatalogEntry>,
}

/// Ordered stream of committed catalog changes.
///
/// A feed only sees changes committed after it was subscribed. Within the
/// feed, changes for one key arrive in their commit order.
pub struct ChangeFeed {
    receiver: mpsc::UnboundedReceiver<ChangeRecord>,
}

impl ChangeFeed {
    /// Next committed change, or `None` once the catalog is gone
    pub async fn next(&mut self) -> Option<ChangeRecord> {
        self.receiver.recv().await
    }
}

/// Catalog of uploaded images
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Record an entry if its key is not cataloged yet.
    ///
    /// Returns `true` when the entry was inserted. An already cataloged key
    /// is left untouched, keeping any metadata applied since, and no change
    /// is emitted.
    async fn record(&self, entry: CatalogEntry) -> Result<bool, CatalogError>;

    /// Remove an entry by key.
    ///
    /// Returns `true` when an entry was removed; removing an unknown key is
    /// a no-op and emits no change.
    async fn remove(&self, filename: &str) -> Result<bool, CatalogError>;

    /// Patch an existing entry's metadata fields.
    ///
    /// Unknown keys are never created here; the caller learns about them via
    /// [`UpdateOutcome::EntryMissing`].
    async fn apply_metadata(
        &self,
        filename: &str,
        patch: MetadataPatch,
    ) -> Result<UpdateOutcome, CatalogError>;

    /// Fetch an entry by key
    async fn get(&self, filename: &str) -> Result<Option<CatalogEntry>, CatalogError>;
}

struct MemoryCatalogState {
    entries: HashMap<String, CatalogEntry>,
    feeds: Vec<mpsc::UnboundedSender<ChangeRecord>>,
}

/// In-process catalog store with change feed support
pub struct MemoryCatalog {
    table_name: String,
    state: Mutex<MemoryCatalogState>,
}

impl MemoryCatalog {
    pub fn new(table_name: impl Into<String>) -> Self {
        let table_name = table_name.into();
        info!(table = %table_name, "Creating in-process catalog store");
        Self {
            table_name,
            state: Mutex::new(MemoryCatalogState {
                entries: HashMap::new(),
                feeds: Vec::new(),
            }),
        }
    }

    /// Subscribe to changes committed from this point on
    pub fn subscribe_changes(&self) -> ChangeFeed {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().unwrap().feeds.push(sender);
        ChangeFeed { receiver }
    }

    /// Number of cataloged entries
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish a change while still holding the state lock, so feed order
    /// always equals commit order.
    fn emit(state: &mut MemoryCatalogState, record: ChangeRecord) {
        state.feeds.retain(|feed| feed.send(record.clone()).is_ok());
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    #[instrument(skip(self, entry), fields(table = %self.table_name, filename = %entry.filename))]
    async fn record(&self, entry: CatalogEntry) -> Result<bool, CatalogError> {
        let mut state = self.state.lock().unwrap();

        if state.entries.contains_key(&entry.filename) {
            debug!("Entry already cataloged, leaving it untouched");
            return Ok(false);
        }

        state.entries.insert(entry.filename.clone(), entry.clone());
        Self::emit(
            &mut state,
            ChangeRecord {
                kind: ChangeKind::Insert,
                filename: entry.filename.clone(),
                new_entry: Some(entry),
                old_entry: None,
            },
        );
        Ok(true)
    }

    #[instrument(skip(self), fields(table = %self.table_name, filename = %filename))]
    async fn remove(&self, filename: &str) -> Result<bool, CatalogError> {
        let mut state = self.state.lock().unwrap();

        match state.entries.remove(filename) {
            Some(old_entry) => {
                Self::emit(
                    &mut state,
                    ChangeRecord {
                        kind: ChangeKind::Remove,
                        filename: filename.to_string(),
                        new_entry: None,
                        old_entry: Some(old_entry),
                    },
                );
                Ok(true)
            }
            None => {
                debug!("Nothing cataloged under that key");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, patch), fields(table = %self.table_name, filename = %filename))]
    async fn apply_metadata(
        &self,
        filename: &str,
        patch: MetadataPatch,
    ) -> Result<UpdateOutcome, CatalogError> {
        let mut state = self.state.lock().unwrap();

        let Some(existing) = state.entries.get(filename) else {
            return Ok(UpdateOutcome::EntryMissing);
        };

        let old_entry = existing.clone();
        let mut updated = old_entry.clone();
        if let Some(caption) = patch.caption {
            updated.caption = Some(caption);
        }
        if let Some(photographer) = patch.photographer {
            updated.photographer = Some(photographer);
        }
        if let Some(date) = patch.date {
            updated.date = Some(date);
        }

        state.entries.insert(filename.to_string(), updated.clone());
        Self::emit(
            &mut state,
            ChangeRecord {
                kind: ChangeKind::Modify,
                filename: filename.to_string(),
                new_entry: Some(updated.clone()),
                old_entry: Some(old_entry),
            },
        );
        Ok(UpdateOutcome::Applied(updated))
    }

    async fn get(&self, filename: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.state.lock().unwrap().entries.get(filename).cloned())
    }
}

/// Format a timestamp the way catalog dates are stored
pub fn format_catalog_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let catalog = MemoryCatalog::new("images");
        let mut feed = catalog.subscribe_changes();

        assert!(catalog.record(CatalogEntry::new("cat.png")).await.unwrap());
        assert!(!catalog.record(CatalogEntry::new("cat.png")).await.unwrap());
        assert_eq!(catalog.len(), 1);

        let change = feed.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.filename, "cat.png");
        assert!(change.old_entry.is_none());

        // The duplicate insert must not have produced a second change.
        assert!(feed.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_record_preserves_metadata() {
        let catalog = MemoryCatalog::new("images");
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();
        catalog
            .apply_metadata(
                "cat.png",
                MetadataPatch {
                    caption: Some("A cat".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();

        let entry = catalog.get("cat.png").await.unwrap().unwrap();
        assert_eq!(entry.caption.as_deref(), Some("A cat"));
    }

    #[tokio::test]
    async fn test_remove_unknown_key_is_noop() {
        let catalog = MemoryCatalog::new("images");
        let mut feed = catalog.subscribe_changes();

        assert!(!catalog.remove("ghost.png").await.unwrap());
        assert!(feed.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_apply_metadata_on_missing_entry() {
        let catalog = MemoryCatalog::new("images");
        let mut feed = catalog.subscribe_changes();

        let outcome = catalog
            .apply_metadata("ghost.png", MetadataPatch::default())
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::EntryMissing);
        assert!(catalog.get("ghost.png").await.unwrap().is_none());
        assert!(feed.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_patches_merge_field_by_field() {
        let catalog = MemoryCatalog::new("images");
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();

        catalog
            .apply_metadata(
                "cat.png",
                MetadataPatch {
                    caption: Some("A cat".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        catalog
            .apply_metadata(
                "cat.png",
                MetadataPatch {
                    photographer: Some("Ana".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entry = catalog.get("cat.png").await.unwrap().unwrap();
        assert_eq!(entry.caption.as_deref(), Some("A cat"));
        assert_eq!(entry.photographer.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_change_feed_reflects_commit_order() {
        let catalog = MemoryCatalog::new("images");
        let mut feed = catalog.subscribe_changes();

        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();
        catalog
            .apply_metadata(
                "cat.png",
                MetadataPatch {
                    caption: Some("A cat".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        catalog.remove("cat.png").await.unwrap();

        let kinds: Vec<ChangeKind> = vec![
            feed.next().await.unwrap().kind,
            feed.next().await.unwrap().kind,
            feed.next().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![ChangeKind::Insert, ChangeKind::Modify, ChangeKind::Remove]
        );
    }

    #[tokio::test]
    async fn test_modify_change_carries_both_images() {
        let catalog = MemoryCatalog::new("images");
        catalog.record(CatalogEntry::new("cat.png")).await.unwrap();

        let mut feed = catalog.subscribe_changes();
        catalog
            .apply_metadata(
                "cat.png",
                MetadataPatch {
                    caption: Some("A cat".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let change = feed.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Modify);
        assert_eq!(change.old_entry.unwrap().caption, None);
        assert_eq!(change.new_entry.unwrap().caption.as_deref(), Some("A cat"));
    }

    #[test]
    fn test_catalog_date_format() {
        use chrono::TimeZone;

        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        assert_eq!(format_catalog_date(at), "2024-01-15 10:30:45");
    }
}
