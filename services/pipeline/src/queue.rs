//! At-least-once delivery queue.
//!
//! Messages published to a queue are wrapped in an [`Envelope`] that tracks
//! how often they have been handed to a consumer. A received message stays
//! invisible until it is acked, nacked, or its visibility timeout lapses;
//! anything not acked comes back, so consumers see a message again until they
//! confirm it.

use crate::config::QueueSettings;
use crate::event::TopicMessage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A queued message together with its delivery bookkeeping
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Stable id assigned when the message was first published
    pub message_id: Uuid,
    /// How many times this message has been handed to a consumer
    pub receive_count: u32,
    /// When the message was first published
    pub sent_at: DateTime<Utc>,
    /// The routed message itself
    pub message: TopicMessage,
}

impl Envelope {
    pub fn new(message: TopicMessage) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            receive_count: 0,
            sent_at: Utc::now(),
            message,
        }
    }
}

/// Opaque handle identifying one delivery of one message.
///
/// A redelivered message gets a fresh receipt, so a stale receipt from an
/// earlier attempt can no longer ack it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(Uuid);

/// One message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub receipt: Receipt,
}

struct InFlightEnvelope {
    envelope: Envelope,
    visible_again_at: Instant,
}

struct QueueState {
    pending: VecDeque<Envelope>,
    in_flight: HashMap<Receipt, InFlightEnvelope>,
}

/// In-process queue with visibility-timeout redelivery
pub struct Queue {
    name: String,
    visibility_timeout: Duration,
    retention: Option<Duration>,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

impl Queue {
    /// Create a new queue with the given settings
    pub fn new(name: impl Into<String>, settings: &QueueSettings) -> Self {
        let name = name.into();
        info!(
            queue = %name,
            visibility_timeout_secs = settings.visibility_timeout_secs,
            retention_secs = ?settings.retention_secs,
            "Creating queue"
        );

        Self {
            name,
            visibility_timeout: settings.visibility_timeout(),
            retention: settings.retention(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            arrivals: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a message, assigning it a fresh envelope
    pub fn publish(&self, message: TopicMessage) -> Uuid {
        let envelope = Envelope::new(message);
        let message_id = envelope.message_id;

        {
            let mut state = self.state.lock().unwrap();
            state.pending.push_back(envelope);
        }
        self.arrivals.notify_one();

        debug!(queue = %self.name, %message_id, "Message enqueued");
        message_id
    }

    /// Re-enqueue an existing envelope, keeping its identity.
    ///
    /// Used when a message is moved between queues; the receive count starts
    /// over because delivery attempts are counted per queue.
    pub fn publish_envelope(&self, mut envelope: Envelope) -> Uuid {
        envelope.receive_count = 0;
        let message_id = envelope.message_id;

        {
            let mut state = self.state.lock().unwrap();
            state.pending.push_back(envelope);
        }
        self.arrivals.notify_one();

        debug!(queue = %self.name, %message_id, "Envelope transferred onto queue");
        message_id
    }

    /// Receive up to `max_messages`, waiting up to `wait` for the first one.
    ///
    /// Returns as soon as anything is available rather than waiting for a full
    /// batch. An empty vec means the wait window elapsed with nothing queued.
    pub async fn receive(&self, max_messages: usize, wait: Duration) -> Vec<Delivery> {
        let deadline = Instant::now() + wait;

        loop {
            let arrival = self.arrivals.notified();

            let next_visibility = {
                let mut state = self.state.lock().unwrap();
                self.reclaim_expired(&mut state);
                self.drop_aged_out(&mut state);

                if !state.pending.is_empty() {
                    let visible_again_at = Instant::now() + self.visibility_timeout;
                    let mut deliveries = Vec::with_capacity(max_messages.min(state.pending.len()));

                    while deliveries.len() < max_messages {
                        let Some(mut envelope) = state.pending.pop_front() else {
                            break;
                        };
                        envelope.receive_count += 1;
                        let receipt = Receipt(Uuid::new_v4());
                        state.in_flight.insert(
                            receipt.clone(),
                            InFlightEnvelope {
                                envelope: envelope.clone(),
                                visible_again_at,
                            },
                        );
                        deliveries.push(Delivery { envelope, receipt });
                    }

                    // Leave a wakeup behind for the next waiting receiver.
                    if !state.pending.is_empty() {
                        self.arrivals.notify_one();
                    }

                    return deliveries;
                }

                state
                    .in_flight
                    .values()
                    .map(|in_flight| in_flight.visible_again_at)
                    .min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }

            // Wake on a new arrival, the wait deadline, or the next point an
            // in-flight message can become visible again.
            let wake_at = match next_visibility {
                Some(visible_again_at) => deadline.min(visible_again_at),
                None => deadline,
            };

            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Confirm a delivery, removing the message for good
    pub fn ack(&self, receipt: &Receipt) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.in_flight.remove(receipt) {
            Some(in_flight) => {
                debug!(
                    queue = %self.name,
                    message_id = %in_flight.envelope.message_id,
                    "Message acked"
                );
                true
            }
            None => {
                debug!(queue = %self.name, "Ack for unknown or expired receipt ignored");
                false
            }
        }
    }

    /// Return a delivery to the queue immediately instead of waiting out the
    /// visibility timeout
    pub fn nack(&self, receipt: &Receipt) -> bool {
        let returned = {
            let mut state = self.state.lock().unwrap();
            match state.in_flight.remove(receipt) {
                Some(in_flight) => {
                    debug!(
                        queue = %self.name,
                        message_id = %in_flight.envelope.message_id,
                        receive_count = in_flight.envelope.receive_count,
                        "Message nacked, back on queue"
                    );
                    state.pending.push_back(in_flight.envelope);
                    true
                }
                None => false,
            }
        };

        if returned {
            self.arrivals.notify_one();
        }
        returned
    }

    /// Messages currently waiting for delivery
    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Messages delivered but not yet acked or returned
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    fn reclaim_expired(&self, state: &mut QueueState) {
        let now = Instant::now();
        let expired: Vec<Receipt> = state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.visible_again_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(in_flight) = state.in_flight.remove(&receipt) {
                warn!(
                    queue = %self.name,
                    message_id = %in_flight.envelope.message_id,
                    receive_count = in_flight.envelope.receive_count,
                    "Visibility timeout lapsed, message returned to queue"
                );
                metrics::counter!("pipeline.queue.visibility_expired").increment(1);
                state.pending.push_back(in_flight.envelope);
            }
        }
    }

    fn drop_aged_out(&self, state: &mut QueueState) {
        let Some(retention) = self.retention else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };

        let cutoff = Utc::now() - retention;
        let before = state.pending.len();
        state.pending.retain(|envelope| {
            let keep = envelope.sent_at > cutoff;
            if !keep {
                warn!(
                    queue = %self.name,
                    message_id = %envelope.message_id,
                    sent_at = %envelope.sent_at,
                    "Dropping message past queue retention"
                );
            }
            keep
        });

        let dropped = before - state.pending.len();
        if dropped > 0 {
            metrics::counter!("pipeline.queue.retention_expired").increment(dropped as u64);
        }
    }
}
