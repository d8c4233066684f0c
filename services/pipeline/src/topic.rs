//! Topic router with filtered fan-out.
//!
//! A topic delivers each published message to every subscription whose filter
//! policy matches. Queue subscriptions enqueue for pull consumers; push
//! subscriptions hand the message to an in-process subscriber through an
//! unbounded lane with a dedicated worker: a matched delivery is never
//! dropped, and a slow subscriber backlogs its own lane without stalling the
//! publisher or its peers.

use crate::event::TopicMessage;
use crate::filter::FilterPolicy;
use crate::queue::Queue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors a push subscriber can report for one delivery
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Subscriber rejected message: {0}")]
    Rejected(String),
}

/// A subscriber that receives matching messages as they are published
#[async_trait::async_trait]
pub trait PushSubscriber: Send + Sync {
    /// Subscription name used in logs and routing decisions
    fn name(&self) -> &str;

    /// Process one delivered message
    async fn deliver(&self, message: TopicMessage) -> Result<(), DeliveryError>;
}

/// Routing verdict for one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub subscription: String,
    pub matched: bool,
}

enum Target {
    Queue(Arc<Queue>),
    Push(mpsc::UnboundedSender<TopicMessage>),
}

struct Subscription {
    name: String,
    policy: FilterPolicy,
    target: Target,
}

/// Fan-out router over a set of filtered subscriptions
pub struct Topic {
    name: String,
    subscriptions: Vec<Subscription>,
}

impl Topic {
    /// Start building a topic
    pub fn builder(name: impl Into<String>) -> TopicBuilder {
        TopicBuilder {
            name: name.into(),
            subscriptions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate every subscription filter without delivering anything
    pub fn route(&self, message: &TopicMessage) -> Vec<RouteDecision> {
        self.subscriptions
            .iter()
            .map(|subscription| RouteDecision {
                subscription: subscription.name.clone(),
                matched: subscription.policy.matches(message),
            })
            .collect()
    }

    /// Deliver a message to every matching subscription.
    ///
    /// Returns how many subscriptions accepted the message. Delivery to one
    /// subscription never depends on the others, and a matched push delivery
    /// is never dropped; the hand-off only fails when the subscriber's worker
    /// is gone.
    pub fn publish(&self, message: TopicMessage) -> usize {
        let mut delivered = 0;

        for subscription in &self.subscriptions {
            if !subscription.policy.matches(&message) {
                debug!(
                    topic = %self.name,
                    subscription = %subscription.name,
                    "Message filtered out"
                );
                continue;
            }

            match &subscription.target {
                Target::Queue(queue) => {
                    queue.publish(message.clone());
                    delivered += 1;
                }
                Target::Push(lane) => match lane.send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        warn!(
                            topic = %self.name,
                            subscription = %subscription.name,
                            "Push worker gone, delivery refused"
                        );
                        metrics::counter!("pipeline.push.failed").increment(1);
                    }
                },
            }
        }

        if delivered == 0 {
            debug!(topic = %self.name, "Message matched no subscription");
            metrics::counter!("pipeline.messages.unmatched").increment(1);
        } else {
            metrics::counter!("pipeline.messages.published").increment(1);
        }

        delivered
    }
}

/// Builder assembling a topic's subscriptions
pub struct TopicBuilder {
    name: String,
    subscriptions: Vec<Subscription>,
}

impl TopicBuilder {
    /// Subscribe a queue, receiving matching messages for pull consumers
    pub fn queue_subscription(
        mut self,
        name: impl Into<String>,
        policy: FilterPolicy,
        queue: Arc<Queue>,
    ) -> Self {
        let name = name.into();
        info!(topic = %self.name, subscription = %name, "Adding queue subscription");
        self.subscriptions.push(Subscription {
            name,
            policy,
            target: Target::Queue(queue),
        });
        self
    }

    /// Subscribe a push subscriber behind its own delivery lane.
    ///
    /// A worker task drains the lane and invokes the subscriber one message at
    /// a time, preserving publish order for this subscription. The lane is
    /// unbounded, so a backlog grows with the publisher instead of shedding
    /// matched deliveries. The worker ends when the topic is dropped. Must be
    /// called from within a runtime.
    pub fn push_subscription(
        mut self,
        policy: FilterPolicy,
        subscriber: Arc<dyn PushSubscriber>,
    ) -> Self {
        let name = subscriber.name().to_string();
        info!(topic = %self.name, subscription = %name, "Adding push subscription");

        let (tx, mut rx) = mpsc::unbounded_channel::<TopicMessage>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match subscriber.deliver(message).await {
                    Ok(()) => {
                        metrics::counter!("pipeline.push.delivered").increment(1);
                    }
                    Err(e) => {
                        warn!(subscription = %worker_name, error = %e, "Push delivery failed");
                        metrics::counter!("pipeline.push.failed").increment(1);
                    }
                }
            }
            debug!(subscription = %worker_name, "Push lane closed");
        });

        self.subscriptions.push(Subscription {
            name,
            policy,
            target: Target::Push(tx),
        });
        self
    }

    /// Build the topic
    pub fn build(self) -> Topic {
        info!(
            topic = %self.name,
            subscriptions = self.subscriptions.len(),
            "Topic ready"
        );
        Topic {
            name: self.name,
            subscriptions: self.subscriptions,
        }
    }
}
