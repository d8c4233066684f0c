//! Darkroom Pipeline - event routing for the photo catalog platform
//!
//! This library provides the messaging backbone of the Darkroom platform. It
//! handles:
//!
//! - Normalizing provider upload notifications into canonical events
//! - Topic fan-out with declarative subscription filters
//! - At-least-once queued delivery with visibility timeouts
//! - Batch consumption with retry budgets and dead-letter redirect
//!
//! # Example
//!
//! ```rust,no_run
//! use darkroom_pipeline::{
//!     FilterPolicy, FilterRule, Queue, QueueSettings, Topic, UploadEvent, UploadNotice,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ingest = Arc::new(Queue::new("image-ingest", &QueueSettings::default()));
//!
//!     let topic = Topic::builder("new-image")
//!         .queue_subscription(
//!             "image-ingest",
//!             FilterPolicy::match_all()
//!                 .with_rule(FilterRule::body("records.kind", ["created", "removed"])),
//!             ingest.clone(),
//!         )
//!         .build();
//!
//!     let notice = UploadNotice::new(vec![UploadEvent::created("cat.png", "photos")]);
//!     topic.publish(notice.into_message().unwrap());
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod consumer;
pub mod event;
pub mod filter;
pub mod queue;
pub mod topic;

// Re-export main types
pub use adapter::{normalize_notification, normalize_object_key, AdapterError};
pub use config::{ConfigError, ConsumerSettings, QueueSettings, RetryPolicy};
pub use consumer::{
    async_trait, ConsumerError, ConsumerHarness, ConsumerHarnessBuilder, ItemHandler, ItemOutcome,
    DEAD_LETTER_REASON_ATTRIBUTE, SOURCE_QUEUE_ATTRIBUTE,
};
pub use event::{
    EventError, MetadataEvent, TopicMessage, UploadEvent, UploadEventKind, UploadNotice,
    METADATA_TYPE_ATTRIBUTE,
};
pub use filter::{FilterPolicy, FilterRule, FilterScope};
pub use queue::{Delivery, Envelope, Queue, Receipt};
pub use topic::{DeliveryError, PushSubscriber, RouteDecision, Topic, TopicBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConsumerSettings, QueueSettings, RetryPolicy};
    pub use crate::consumer::{
        async_trait, ConsumerError, ConsumerHarness, ItemHandler, ItemOutcome,
    };
    pub use crate::event::{MetadataEvent, TopicMessage, UploadEvent, UploadEventKind, UploadNotice};
    pub use crate::filter::{FilterPolicy, FilterRule};
    pub use crate::queue::{Envelope, Queue};
    pub use crate::topic::{PushSubscriber, Topic};
}
