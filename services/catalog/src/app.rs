//! Wires the catalog service together.
//!
//! One topic fans uploads out to the ingest queue and metadata submissions to
//! the push updater. The ingest harness records uploads and dead-letters what
//! it cannot process; the dead-letter harness mails failure notices; the
//! change feed consumer mails confirmations for every cataloged image.

use crate::change_feed::ChangeFeedConsumer;
use crate::config::Config;
use crate::dead_letter::FailureNotifier;
use crate::ingest::CatalogRecorder;
use crate::mailer::{MailTransport, SuccessNotifier};
use crate::metadata::MetadataUpdater;
use crate::object_store::ObjectStore;
use crate::store::MemoryCatalog;
use darkroom_pipeline::{
    normalize_notification, AdapterError, ConsumerHarness, FilterPolicy, FilterRule, Queue, Topic,
    METADATA_TYPE_ATTRIBUTE,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The assembled catalog service
pub struct App {
    topic: Arc<Topic>,
    tasks: Vec<JoinHandle<()>>,
    cancellation: CancellationToken,
}

impl App {
    /// Wire every component and start the worker tasks.
    ///
    /// Collaborator handles are injected so tests can swap in in-process
    /// doubles. Must be called from within a runtime.
    pub fn build(
        config: &Config,
        object_store: Arc<dyn ObjectStore>,
        catalog: Arc<MemoryCatalog>,
        transport: Arc<dyn MailTransport>,
        cancellation: CancellationToken,
    ) -> Self {
        let ingest_queue = Arc::new(Queue::new(
            &config.ingest.queue_name,
            &config.ingest.queue_settings(),
        ));
        let dead_letter_queue = Arc::new(Queue::new(
            &config.dead_letter.queue_name,
            &config.dead_letter.queue_settings(),
        ));

        let metadata_updater = Arc::new(MetadataUpdater::new(catalog.clone()));
        let topic = Arc::new(
            Topic::builder(&config.topic.name)
                .queue_subscription(
                    &config.ingest.queue_name,
                    FilterPolicy::match_all()
                        .with_rule(FilterRule::body("records.kind", ["created", "removed"])),
                    ingest_queue.clone(),
                )
                .push_subscription(
                    FilterPolicy::match_all().with_rule(FilterRule::attribute(
                        METADATA_TYPE_ATTRIBUTE,
                        config.topic.metadata_types.clone(),
                    )),
                    metadata_updater,
                )
                .build(),
        );

        let recorder = Arc::new(CatalogRecorder::new(object_store, catalog.clone()));
        let mut tasks = ConsumerHarness::builder(ingest_queue, recorder)
            .settings(config.ingest.consumer_settings())
            .retry_policy(config.ingest.retry_policy())
            .dead_letter_queue(dead_letter_queue.clone())
            .cancellation(cancellation.clone())
            .build()
            .spawn();

        let failure_notifier = Arc::new(FailureNotifier::new(
            transport.clone(),
            config.mail.clone(),
        ));
        tasks.extend(
            ConsumerHarness::builder(dead_letter_queue, failure_notifier)
                .settings(config.dead_letter.consumer_settings())
                .cancellation(cancellation.clone())
                .build()
                .spawn(),
        );

        let success_notifier = Arc::new(SuccessNotifier::new(transport, config.mail.clone()));
        tasks.push(
            ChangeFeedConsumer::new(
                catalog.subscribe_changes(),
                success_notifier,
                cancellation.clone(),
            )
            .spawn(),
        );

        info!(
            topic = %config.topic.name,
            workers = tasks.len(),
            "Catalog service wired"
        );

        Self {
            topic,
            tasks,
            cancellation,
        }
    }

    /// The upload topic everything hangs off
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// A shareable handle to the topic, for feeder tasks
    pub fn topic_handle(&self) -> Arc<Topic> {
        self.topic.clone()
    }

    /// Feed one raw provider notification through the source adapter.
    ///
    /// Returns how many subscriptions the normalized message reached; zero
    /// when the notification held no records or matched no filter.
    pub fn publish_raw(&self, raw: &str) -> Result<usize, AdapterError> {
        match normalize_notification(raw)? {
            Some(message) => Ok(self.topic.publish(message)),
            None => Ok(0),
        }
    }

    /// Stop every worker and wait for them to finish
    pub async fn shutdown(self) {
        info!("Shutting down catalog service");
        self.cancellation.cancel();

        for result in futures::future::join_all(self.tasks).await {
            if let Err(join_error) = result {
                error!(error = %join_error, "Worker ended abnormally");
            }
        }
        info!("Catalog service stopped");
    }
}
