use crate::store::{ChangeFeed, ChangeRecord};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reacts to committed catalog mutations.
///
/// There is no redelivery tier behind the change feed, so handlers must treat
/// every record as best-effort: an `Err` is logged and counted, then the feed
/// moves on.
#[async_trait::async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn on_change(&self, record: &ChangeRecord) -> anyhow::Result<()>;
}

/// Drains a catalog change feed into a handler, one record at a time.
pub struct ChangeFeedConsumer {
    feed: ChangeFeed,
    handler: Arc<dyn ChangeHandler>,
    cancellation: CancellationToken,
}

impl ChangeFeedConsumer {
    pub fn new(
        feed: ChangeFeed,
        handler: Arc<dyn ChangeHandler>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            feed,
            handler,
            cancellation,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        info!(handler = self.handler.name(), "Change feed consumer started");

        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!(handler = self.handler.name(), "Change feed consumer shutting down");
                    break;
                }
                record = self.feed.next() => {
                    match record {
                        Some(record) => self.dispatch(&record).await,
                        None => {
                            info!(handler = self.handler.name(), "Change feed closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, record: &ChangeRecord) {
        match self.handler.on_change(record).await {
            Ok(()) => {
                metrics::counter!("catalog.changes.processed").increment(1);
            }
            Err(error) => {
                error!(
                    handler = self.handler.name(),
                    filename = %record.filename,
                    error = %error,
                    "Change handler failed"
                );
                metrics::counter!("catalog.changes.handler_errors").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Catalog, CatalogEntry, ChangeKind, MemoryCatalog};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingHandler {
        seen: Mutex<Vec<(ChangeKind, String)>>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChangeHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn on_change(&self, record: &ChangeRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((record.kind, record.filename.clone()));
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(())
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_changes_reach_the_handler_in_order() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let handler = Arc::new(RecordingHandler::new(false));
        let cancellation = CancellationToken::new();
        ChangeFeedConsumer::new(catalog.subscribe_changes(), handler.clone(), cancellation)
            .spawn();

        catalog.record(CatalogEntry::new("a.png")).await.unwrap();
        catalog.record(CatalogEntry::new("b.png")).await.unwrap();
        catalog.remove("a.png").await.unwrap();

        eventually(|| handler.seen.lock().unwrap().len() == 3).await;
        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0], (ChangeKind::Insert, "a.png".to_string()));
        assert_eq!(seen[1], (ChangeKind::Insert, "b.png".to_string()));
        assert_eq!(seen[2], (ChangeKind::Remove, "a.png".to_string()));
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_the_feed() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let handler = Arc::new(RecordingHandler::new(true));
        let cancellation = CancellationToken::new();
        ChangeFeedConsumer::new(catalog.subscribe_changes(), handler.clone(), cancellation)
            .spawn();

        catalog.record(CatalogEntry::new("a.png")).await.unwrap();
        catalog.record(CatalogEntry::new("b.png")).await.unwrap();

        eventually(|| handler.calls.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_consumer() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let handler = Arc::new(RecordingHandler::new(false));
        let cancellation = CancellationToken::new();
        let consumer = ChangeFeedConsumer::new(
            catalog.subscribe_changes(),
            handler,
            cancellation.clone(),
        );
        let task = consumer.spawn();

        cancellation.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_feed_stops_the_consumer() {
        let catalog = Arc::new(MemoryCatalog::new("images"));
        let handler = Arc::new(RecordingHandler::new(false));
        let consumer = ChangeFeedConsumer::new(
            catalog.subscribe_changes(),
            handler,
            CancellationToken::new(),
        );
        let task = consumer.spawn();

        drop(catalog);
        task.await.unwrap();
    }
}
