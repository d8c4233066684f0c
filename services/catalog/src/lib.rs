//! Darkroom Catalog Service
//!
//! Event-driven image catalog for the Darkroom photo album platform. Upload
//! notifications from the object store provider are normalized onto a topic
//! that fans out to the ingest queue and the metadata updater. The ingest
//! consumer validates uploads and records them in the catalog; the change
//! feed turns every committed entry into a confirmation mail. Uploads that
//! exhaust their retries land on a dead-letter queue whose consumer mails a
//! failure notice instead.
//!
//! ## Features
//!
//! - **Idempotent cataloging**: record-if-absent writes, so redelivered
//!   notifications never clobber metadata applied in between
//! - **Update-only metadata**: editor submissions patch existing entries and
//!   never create half-empty ones
//! - **At-least-once ingest**: visibility timeouts, a bounded retry budget,
//!   and dead-letter redirect with the failure reason attached
//! - **Change-feed notifications**: confirmation mail driven by committed
//!   catalog mutations, not by the incoming event stream
//!
//! ## Architecture
//!
//! ```text
//! Provider notifications (stdin, one JSON document per line)
//!                 │
//!                 ▼  source adapter
//!         ┌──────────────┐
//!         │  new-image   │
//!         │    topic     │
//!         └──────────────┘
//!    records.kind │ │ metadata_type (push)
//!       ┌─────────┘ └──────────┐
//!       ▼                      ▼
//! ┌──────────────┐      ┌──────────────┐
//! │ image-ingest │      │ Metadata     │
//! │ queue        │      │ Updater      │
//! └──────────────┘      └──────────────┘
//!       │ batches              │ update-only
//!       ▼                      ▼
//! ┌──────────────┐      ┌──────────────┐
//! │ Catalog      │─────▶│ Catalog +    │
//! │ Recorder     │      │ change feed  │
//! └──────────────┘      └──────────────┘
//!       │ retries              │ Insert/Modify
//!       ▼ exhausted            ▼
//! ┌──────────────┐      ┌──────────────┐
//! │ bad-image    │      │ Success      │
//! │ queue        │      │ Notifier     │──▶ mail
//! └──────────────┘      └──────────────┘
//!       │
//!       ▼
//! ┌──────────────┐
//! │ Failure      │──▶ mail
//! │ Notifier     │
//! └──────────────┘
//! ```

pub mod app;
pub mod change_feed;
pub mod config;
pub mod dead_letter;
pub mod ingest;
pub mod mailer;
pub mod metadata;
pub mod object_store;
pub mod store;

pub use app::App;
pub use change_feed::{ChangeFeedConsumer, ChangeHandler};
pub use config::{Config, ObjectStoreBackend};
pub use dead_letter::FailureNotifier;
pub use ingest::{CatalogRecorder, IngestError, ALLOWED_IMAGE_TYPES};
pub use mailer::{
    LogMailer, MailError, MailTransport, MemoryMailer, OutboundMail, SuccessNotifier,
};
pub use metadata::MetadataUpdater;
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError, S3ObjectStore};
pub use store::{
    format_catalog_date, Catalog, CatalogEntry, CatalogError, ChangeFeed, ChangeKind,
    ChangeRecord, MemoryCatalog, MetadataPatch, UpdateOutcome,
};
