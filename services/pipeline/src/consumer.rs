//! Batch consumer harness with retry and dead-letter handling.
//!
//! The harness pulls batches from a [`Queue`], hands each message to an
//! [`ItemHandler`], and settles every delivery: ack on success, return for
//! retry while attempts remain, or redirect to the dead-letter queue once the
//! retry budget is spent. Handlers only decide success or failure; the
//! delivery bookkeeping lives here.

use crate::config::{ConsumerSettings, RetryPolicy};
use crate::queue::{Delivery, Envelope, Queue};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attribute recording why a message was dead-lettered
pub const DEAD_LETTER_REASON_ATTRIBUTE: &str = "dead_letter_reason";
/// Attribute recording which queue a dead-lettered message came from
pub const SOURCE_QUEUE_ATTRIBUTE: &str = "source_queue";

/// Errors a handler can report for one message
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Dependency unavailable: {0}")]
    DependencyError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),
}

/// How one delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Handler succeeded, message removed
    Acked,
    /// Handler failed, message returned for another attempt
    Retried,
    /// Attempts exhausted, message moved to the dead-letter queue
    DeadLettered,
    /// Attempts exhausted with no dead-letter queue configured
    Discarded,
}

/// Handler trait for processing queued messages
#[async_trait::async_trait]
pub trait ItemHandler: Send + Sync {
    /// Process a single message.
    ///
    /// Returning an error does not decide the message's fate; the harness
    /// applies the retry policy and settles the delivery.
    async fn handle_item(&self, envelope: &Envelope) -> Result<(), ConsumerError>;
}

/// Pull consumer driving an [`ItemHandler`] over queue batches
pub struct ConsumerHarness {
    queue: Arc<Queue>,
    handler: Arc<dyn ItemHandler>,
    settings: ConsumerSettings,
    retry: RetryPolicy,
    dead_letter: Option<Arc<Queue>>,
    cancel: CancellationToken,
}

impl ConsumerHarness {
    /// Start building a harness for the given queue and handler
    pub fn builder(queue: Arc<Queue>, handler: Arc<dyn ItemHandler>) -> ConsumerHarnessBuilder {
        ConsumerHarnessBuilder {
            queue,
            handler,
            settings: ConsumerSettings::default(),
            retry: RetryPolicy::default(),
            dead_letter: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the configured number of worker tasks.
    ///
    /// Workers run until the cancellation token fires. Each worker pulls its
    /// own batches, so batches are processed concurrently but every single
    /// message still belongs to exactly one worker.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let concurrency = self.settings.concurrency;
        let harness = Arc::new(self);

        (0..concurrency)
            .map(|worker| {
                let harness = harness.clone();
                tokio::spawn(async move {
                    info!(queue = %harness.queue.name(), worker, "Consumer worker started");
                    loop {
                        tokio::select! {
                            _ = harness.cancel.cancelled() => break,
                            outcomes = harness.run_batch() => {
                                if !outcomes.is_empty() {
                                    debug!(
                                        queue = %harness.queue.name(),
                                        worker,
                                        settled = outcomes.len(),
                                        "Batch settled"
                                    );
                                }
                            }
                        }
                    }
                    info!(queue = %harness.queue.name(), worker, "Consumer worker stopped");
                })
            })
            .collect()
    }

    /// Pull one batch and settle every delivery in it.
    ///
    /// Returns one outcome per received message, in delivery order. An empty
    /// vec means the batch window passed with nothing queued.
    pub async fn run_batch(&self) -> Vec<ItemOutcome> {
        let deliveries = self
            .queue
            .receive(self.settings.batch_size, self.settings.batch_window())
            .await;

        if deliveries.is_empty() {
            return Vec::new();
        }

        self.process_batch(deliveries).await
    }

    async fn process_batch(&self, deliveries: Vec<Delivery>) -> Vec<ItemOutcome> {
        debug!(
            queue = %self.queue.name(),
            batch = deliveries.len(),
            "Processing batch"
        );

        let resolved: Mutex<Vec<Option<ItemOutcome>>> = Mutex::new(vec![None; deliveries.len()]);

        // Settle items one at a time so a failure never takes down the
        // messages already acked in the same batch.
        let work = async {
            for (index, delivery) in deliveries.iter().enumerate() {
                let outcome = match self.handler.handle_item(&delivery.envelope).await {
                    Ok(()) => {
                        self.queue.ack(&delivery.receipt);
                        metrics::counter!("pipeline.items.acked").increment(1);
                        ItemOutcome::Acked
                    }
                    Err(error) => {
                        warn!(
                            queue = %self.queue.name(),
                            message_id = %delivery.envelope.message_id,
                            error = %error,
                            "Item handler failed"
                        );
                        self.fail_item(delivery, &error.to_string())
                    }
                };
                resolved.lock().unwrap()[index] = Some(outcome);
            }
        };

        let timed_out = tokio::time::timeout(self.settings.handler_timeout(), work)
            .await
            .is_err();

        if timed_out {
            warn!(
                queue = %self.queue.name(),
                timeout_secs = self.settings.handler_timeout_secs,
                "Batch handler timed out"
            );
            metrics::counter!("pipeline.batches.timed_out").increment(1);
        }

        let resolved = resolved.into_inner().unwrap();
        deliveries
            .iter()
            .zip(resolved)
            .map(|(delivery, outcome)| {
                outcome.unwrap_or_else(|| self.fail_item(delivery, "batch handler timed out"))
            })
            .collect()
    }

    /// Settle a failed delivery according to the retry policy
    fn fail_item(&self, delivery: &Delivery, reason: &str) -> ItemOutcome {
        let envelope = &delivery.envelope;

        if !self.retry.attempts_exhausted(envelope.receive_count) {
            self.queue.nack(&delivery.receipt);
            metrics::counter!("pipeline.items.retried").increment(1);
            return ItemOutcome::Retried;
        }

        match &self.dead_letter {
            Some(dead_letter) => {
                error!(
                    queue = %self.queue.name(),
                    message_id = %envelope.message_id,
                    receive_count = envelope.receive_count,
                    dead_letter_queue = %dead_letter.name(),
                    reason,
                    "Delivery attempts exhausted, dead-lettering message"
                );

                let message = envelope
                    .message
                    .clone()
                    .with_attribute(DEAD_LETTER_REASON_ATTRIBUTE, reason)
                    .with_attribute(SOURCE_QUEUE_ATTRIBUTE, self.queue.name());

                dead_letter.publish_envelope(Envelope {
                    message_id: envelope.message_id,
                    receive_count: 0,
                    sent_at: envelope.sent_at,
                    message,
                });
                self.queue.ack(&delivery.receipt);
                metrics::counter!("pipeline.items.dead_lettered").increment(1);
                ItemOutcome::DeadLettered
            }
            None => {
                error!(
                    queue = %self.queue.name(),
                    message_id = %envelope.message_id,
                    receive_count = envelope.receive_count,
                    reason,
                    "Delivery attempts exhausted with no dead-letter queue, dropping message"
                );
                self.queue.ack(&delivery.receipt);
                metrics::counter!("pipeline.items.discarded").increment(1);
                ItemOutcome::Discarded
            }
        }
    }
}

/// Async trait for item handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Builder for assembling a consumer harness
pub struct ConsumerHarnessBuilder {
    queue: Arc<Queue>,
    handler: Arc<dyn ItemHandler>,
    settings: ConsumerSettings,
    retry: RetryPolicy,
    dead_letter: Option<Arc<Queue>>,
    cancel: CancellationToken,
}

impl ConsumerHarnessBuilder {
    /// Set the batch consumer settings
    pub fn settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the redelivery budget
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the queue that receives messages whose attempts are exhausted
    pub fn dead_letter_queue(mut self, queue: Arc<Queue>) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    /// Set the token that stops spawned workers
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Build the harness
    pub fn build(self) -> ConsumerHarness {
        ConsumerHarness {
            queue: self.queue,
            handler: self.handler,
            settings: self.settings,
            retry: self.retry,
            dead_letter: self.dead_letter,
            cancel: self.cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::event::TopicMessage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TaggedHandler {
        failing_tag: Option<String>,
        slow_tag: Option<String>,
        handled: AtomicUsize,
    }

    impl TaggedHandler {
        fn accepting() -> Self {
            Self {
                failing_tag: None,
                slow_tag: None,
                handled: AtomicUsize::new(0),
            }
        }

        fn failing_on(tag: &str) -> Self {
            Self {
                failing_tag: Some(tag.to_string()),
                ..Self::accepting()
            }
        }

        fn slow_on(tag: &str) -> Self {
            Self {
                slow_tag: Some(tag.to_string()),
                ..Self::accepting()
            }
        }
    }

    #[async_trait::async_trait]
    impl ItemHandler for TaggedHandler {
        async fn handle_item(&self, envelope: &Envelope) -> Result<(), ConsumerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            let tag = envelope.message.body["tag"].as_str().unwrap_or_default();

            if self.slow_tag.as_deref() == Some(tag) {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            if self.failing_tag.as_deref() == Some(tag) {
                return Err(ConsumerError::ProcessingError(format!("refusing {tag}")));
            }
            Ok(())
        }
    }

    fn queue_with(messages: &[&str]) -> Arc<Queue> {
        let queue = Arc::new(Queue::new("work", &QueueSettings::default()));
        for tag in messages {
            queue.publish(TopicMessage::new(json!({ "tag": tag })));
        }
        queue
    }

    fn fast_settings() -> ConsumerSettings {
        ConsumerSettings {
            batch_size: 5,
            batch_window_secs: 0,
            handler_timeout_secs: 10,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn test_successful_batch_is_acked() {
        let queue = queue_with(&["a", "b", "c"]);
        let harness = ConsumerHarness::builder(queue.clone(), Arc::new(TaggedHandler::accepting()))
            .settings(fast_settings())
            .build();

        let outcomes = harness.run_batch().await;
        assert_eq!(outcomes, vec![ItemOutcome::Acked; 3]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_item_is_dead_lettered_with_reason() {
        let queue = queue_with(&["bad"]);
        let dead_letter = Arc::new(Queue::new("dead-letter", &QueueSettings::default()));

        let harness = ConsumerHarness::builder(queue.clone(), Arc::new(TaggedHandler::failing_on("bad")))
            .settings(fast_settings())
            .retry_policy(RetryPolicy::new(1))
            .dead_letter_queue(dead_letter.clone())
            .build();

        let outcomes = harness.run_batch().await;
        assert_eq!(outcomes, vec![ItemOutcome::DeadLettered]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);

        let moved = dead_letter.receive(1, Duration::from_millis(10)).await;
        let message = &moved[0].envelope.message;
        assert!(message
            .attribute(DEAD_LETTER_REASON_ATTRIBUTE)
            .unwrap()
            .contains("refusing bad"));
        assert_eq!(message.attribute(SOURCE_QUEUE_ATTRIBUTE), Some("work"));
    }

    #[tokio::test]
    async fn test_item_retries_until_budget_spent() {
        let queue = queue_with(&["bad"]);
        let dead_letter = Arc::new(Queue::new("dead-letter", &QueueSettings::default()));

        let harness = ConsumerHarness::builder(queue.clone(), Arc::new(TaggedHandler::failing_on("bad")))
            .settings(fast_settings())
            .retry_policy(RetryPolicy::new(2))
            .dead_letter_queue(dead_letter.clone())
            .build();

        assert_eq!(harness.run_batch().await, vec![ItemOutcome::Retried]);
        assert_eq!(queue.depth(), 1);
        assert_eq!(dead_letter.depth(), 0);

        assert_eq!(harness.run_batch().await, vec![ItemOutcome::DeadLettered]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(dead_letter.depth(), 1);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_keeps_successes() {
        let queue = queue_with(&["good", "bad", "also-good"]);
        let dead_letter = Arc::new(Queue::new("dead-letter", &QueueSettings::default()));

        let harness = ConsumerHarness::builder(queue.clone(), Arc::new(TaggedHandler::failing_on("bad")))
            .settings(fast_settings())
            .retry_policy(RetryPolicy::new(1))
            .dead_letter_queue(dead_letter.clone())
            .build();

        let outcomes = harness.run_batch().await;
        assert_eq!(
            outcomes,
            vec![
                ItemOutcome::Acked,
                ItemOutcome::DeadLettered,
                ItemOutcome::Acked,
            ]
        );
        assert_eq!(dead_letter.depth(), 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_settles_unfinished_items() {
        let queue = queue_with(&["quick", "stuck"]);
        let handler = Arc::new(TaggedHandler::slow_on("stuck"));

        let harness = ConsumerHarness::builder(queue.clone(), handler)
            .settings(ConsumerSettings {
                batch_size: 5,
                batch_window_secs: 0,
                handler_timeout_secs: 1,
                concurrency: 1,
            })
            .retry_policy(RetryPolicy::new(2))
            .build();

        let outcomes = harness.run_batch().await;
        assert_eq!(outcomes, vec![ItemOutcome::Acked, ItemOutcome::Retried]);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_item_without_dead_letter_queue_is_discarded() {
        let queue = queue_with(&["bad"]);
        let harness = ConsumerHarness::builder(queue.clone(), Arc::new(TaggedHandler::failing_on("bad")))
            .settings(fast_settings())
            .retry_policy(RetryPolicy::new(1))
            .build();

        assert_eq!(harness.run_batch().await, vec![ItemOutcome::Discarded]);
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue_and_stop() {
        let queue = queue_with(&["a", "b", "c", "d", "e", "f", "g"]);
        let handler = Arc::new(TaggedHandler::accepting());
        let cancel = CancellationToken::new();

        let handles = ConsumerHarness::builder(queue.clone(), handler.clone())
            .settings(ConsumerSettings {
                batch_size: 2,
                batch_window_secs: 1,
                handler_timeout_secs: 10,
                concurrency: 2,
            })
            .cancellation(cancel.clone())
            .build()
            .spawn();

        assert_eq!(handles.len(), 2);

        for _ in 0..200 {
            if queue.depth() == 0 && queue.in_flight_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.handled.load(Ordering::SeqCst), 7);

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("worker did not stop")
                .expect("worker panicked");
        }
    }
}
