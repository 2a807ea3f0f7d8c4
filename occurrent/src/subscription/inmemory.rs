//! In-memory subscription model, driven by the reference store's append bus.
//!
//! Each subscription owns one worker task that reads the bus, applies the
//! filter and invokes the consumer sequentially. Positions are the store's
//! global append positions rendered as opaque tokens, so the durable and
//! catch-up wrappers work against this model unmodified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::filter::Filter;
use crate::retry::RetryPolicy;
use crate::store::inmemory::{Appended, GlobalPosition, InMemoryEventStore};
use crate::subscription::{
    EventConsumer, PositionAware, PositionStorage, PositionStorageError, PositionedEvent, StartAt,
    StartAtProvider, SubscribeError, Subscription, SubscriptionLifecycle, SubscriptionModel,
    SubscriptionPosition,
};

struct SubscriptionState {
    filter: Option<Filter>,
    consumer: Arc<dyn EventConsumer>,
    start_at: StartAtProvider,
    worker: Option<Worker>,
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        // Cooperative: the worker finishes an in-flight delivery first.
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// In-memory [SubscriptionModel] on top of an [InMemoryEventStore].
#[derive(Clone)]
pub struct InMemorySubscriptionModel {
    store: InMemoryEventStore,
    retry: RetryPolicy,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionState>>>,
    shut_down: Arc<AtomicBool>,
}

impl InMemorySubscriptionModel {
    /// A model delivering events of `store`, retrying failed consumers with
    /// the default fixed-delay policy.
    pub fn new(store: InMemoryEventStore) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: InMemoryEventStore, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            subscriptions: Arc::default(),
            shut_down: Arc::default(),
        }
    }

    fn starting_position(&self, start_at: &StartAt) -> Result<GlobalPosition, SubscribeError> {
        match start_at {
            StartAt::Now => Ok(self.store.head_position()),
            StartAt::Position(SubscriptionPosition::Token(token)) => {
                token.parse::<GlobalPosition>().map_err(|_| {
                    SubscribeError::InvalidArgument(format!(
                        "'{}' is not an in-memory subscription position",
                        token
                    ))
                })
            },
            StartAt::Position(SubscriptionPosition::Time(_)) | StartAt::BeginningOfTime => {
                Err(SubscribeError::InvalidArgument(
                    "the in-memory subscription model only starts from 'now' or a previously \
                     issued position; replay requires a catch-up subscription"
                        .to_owned(),
                ))
            },
        }
    }

    fn spawn_worker(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        consumer: Arc<dyn EventConsumer>,
        from: GlobalPosition,
    ) -> Worker {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let retry = self.retry.clone();
        let subscription_id = subscription_id.to_owned();

        let handle = tokio::spawn(async move {
            let mut bus = store.subscribe_appends();
            // The bus subscription is opened before the backlog is read, so
            // nothing slips between the two; overlap is skipped by position.
            let backlog = store.appends_since(from);
            let mut last = from;

            for appended in backlog {
                if *stop_rx.borrow() {
                    return;
                }
                deliver(&subscription_id, &filter, &consumer, &retry, &appended).await;
                last = appended.position;
            }

            loop {
                let appended = tokio::select! {
                    _ = stop_rx.changed() => return,
                    received = bus.recv() => match received {
                        Ok(appended) => appended,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                subscription.id = %subscription_id,
                                skipped,
                                "subscription lagged behind the append bus, re-reading from the store"
                            );
                            for appended in store.appends_since(last) {
                                deliver(&subscription_id, &filter, &consumer, &retry, &appended).await;
                                last = appended.position;
                            }
                            continue;
                        },
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };

                if appended.position <= last {
                    continue;
                }

                deliver(&subscription_id, &filter, &consumer, &retry, &appended).await;
                last = appended.position;
            }
        });

        Worker { stop_tx, handle }
    }
}

async fn deliver(
    subscription_id: &str,
    filter: &Option<Filter>,
    consumer: &Arc<dyn EventConsumer>,
    retry: &RetryPolicy,
    appended: &Appended,
) {
    if let Some(filter) = filter {
        if !filter.matches(&appended.event) {
            return;
        }
    }

    let positioned = PositionedEvent {
        position: SubscriptionPosition::Token(appended.position.to_string()),
        event: appended.event.clone(),
    };

    let result = retry
        .retry(|_| true, || consumer.consume(positioned.clone()))
        .await;

    if let Err(error) = result {
        tracing::error!(
            subscription.id = %subscription_id,
            event.id = %appended.event.id,
            %error,
            "dropping event after exhausting the retry policy"
        );
    }
}

#[async_trait]
impl SubscriptionModel for InMemorySubscriptionModel {
    async fn subscribe_with(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SubscribeError::ShutDown);
        }
        if subscription_id.is_empty() {
            return Err(SubscribeError::InvalidArgument(
                "subscription id cannot be empty".to_owned(),
            ));
        }

        let resolved = start_at().await?;
        let from = self.starting_position(&resolved)?;

        let mut worker = Some(self.spawn_worker(subscription_id, filter.clone(), consumer.clone(), from));

        let duplicate = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            if subscriptions.contains_key(subscription_id) {
                true
            } else {
                subscriptions.insert(
                    subscription_id.to_owned(),
                    SubscriptionState {
                        filter,
                        consumer,
                        start_at,
                        worker: worker.take(),
                    },
                );
                false
            }
        };

        if duplicate {
            worker
                .take()
                .expect("worker present when duplicate")
                .stop()
                .await;
            return Err(SubscribeError::AlreadyExists(subscription_id.to_owned()));
        }

        tracing::debug!(subscription.id = %subscription_id, "subscription started");

        Ok(Subscription::new(subscription_id))
    }

    async fn cancel(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        let state = self
            .subscriptions
            .lock()
            .expect("acquire lock on subscription registry")
            .remove(subscription_id)
            .ok_or_else(|| SubscribeError::NotFound(subscription_id.to_owned()))?;

        if let Some(worker) = state.worker {
            worker.stop().await;
        }

        tracing::debug!(subscription.id = %subscription_id, "subscription cancelled");

        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let workers: Vec<(String, Worker)> = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            subscriptions
                .iter_mut()
                .filter_map(|(id, state)| state.worker.take().map(|w| (id.clone(), w)))
                .collect()
        };

        for (id, worker) in workers {
            worker.stop().await;
            tracing::debug!(subscription.id = %id, "subscription stopped on shutdown");
        }
    }
}

#[async_trait]
impl PositionAware for InMemorySubscriptionModel {
    async fn global_position(&self) -> Result<SubscriptionPosition, SubscribeError> {
        Ok(SubscriptionPosition::Token(
            self.store.head_position().to_string(),
        ))
    }
}

#[async_trait]
impl SubscriptionLifecycle for InMemorySubscriptionModel {
    async fn pause(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        let worker = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            let state = subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| SubscribeError::NotFound(subscription_id.to_owned()))?;

            state
                .worker
                .take()
                .ok_or_else(|| SubscribeError::NotRunning(subscription_id.to_owned()))?
        };

        worker.stop().await;

        tracing::debug!(subscription.id = %subscription_id, "subscription paused");

        Ok(())
    }

    async fn resume(&self, subscription_id: &str) -> Result<Subscription, SubscribeError> {
        let (filter, consumer, start_at) = {
            let subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            let state = subscriptions
                .get(subscription_id)
                .ok_or_else(|| SubscribeError::NotFound(subscription_id.to_owned()))?;

            if state.worker.is_some() {
                return Err(SubscribeError::NotPaused(subscription_id.to_owned()));
            }

            (state.filter.clone(), state.consumer.clone(), state.start_at.clone())
        };

        // Re-resolve the start position: a durable wrapper will have stored
        // newer positions while this subscription was paused elsewhere.
        let from = self.starting_position(&start_at().await?)?;
        let mut worker = Some(self.spawn_worker(subscription_id, filter, consumer, from));

        let attached = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            match subscriptions.get_mut(subscription_id) {
                Some(state) if state.worker.is_none() => {
                    state.worker = worker.take();
                    true
                },
                _ => false,
            }
        };

        if !attached {
            worker
                .take()
                .expect("worker present when not attached")
                .stop()
                .await;
            return Err(SubscribeError::NotPaused(subscription_id.to_owned()));
        }

        tracing::debug!(subscription.id = %subscription_id, "subscription resumed");

        Ok(Subscription::new(subscription_id))
    }

    async fn is_running(&self, subscription_id: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("acquire lock on subscription registry")
            .get(subscription_id)
            .map_or(false, |state| state.worker.is_some())
    }

    async fn is_paused(&self, subscription_id: &str) -> bool {
        self.subscriptions
            .lock()
            .expect("acquire lock on subscription registry")
            .get(subscription_id)
            .map_or(false, |state| state.worker.is_none())
    }
}

/// In-memory [PositionStorage], a `HashMap` guarded by a mutex.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPositionStorage {
    positions: Arc<Mutex<HashMap<String, (SubscriptionPosition, Option<u64>)>>>,
}

impl InMemoryPositionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionStorage for InMemoryPositionStorage {
    async fn read(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionPosition>, PositionStorageError> {
        Ok(self
            .positions
            .lock()
            .expect("acquire lock on position storage")
            .get(subscription_id)
            .map(|(position, _)| position.clone()))
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        fencing: Option<u64>,
    ) -> Result<(), PositionStorageError> {
        let mut positions = self
            .positions
            .lock()
            .expect("acquire lock on position storage");

        if let (Some(attempted), Some((_, Some(current)))) =
            (fencing, positions.get(subscription_id))
        {
            if attempted < *current {
                return Err(PositionStorageError::StaleLease {
                    subscription_id: subscription_id.to_owned(),
                    attempted,
                });
            }
        }

        positions.insert(subscription_id.to_owned(), (position.clone(), fencing));

        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> Result<(), PositionStorageError> {
        self.positions
            .lock()
            .expect("acquire lock on position storage")
            .remove(subscription_id);

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::subscription::{consumer_fn, EventConsumer, PositionedEvent};

    /// Consumer collecting everything it receives, for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct Collector {
        received: Arc<Mutex<Vec<PositionedEvent>>>,
    }

    impl Collector {
        pub(crate) fn consumer(&self) -> Arc<dyn EventConsumer> {
            let received = self.received.clone();
            consumer_fn(move |event| {
                let received = received.clone();
                async move {
                    received.lock().unwrap().push(event);
                    Ok(())
                }
            })
        }

        pub(crate) fn received(&self) -> Vec<PositionedEvent> {
            self.received.lock().unwrap().clone()
        }

        pub(crate) async fn wait_for(&self, count: usize) -> Vec<PositionedEvent> {
            for _ in 0..200 {
                {
                    let received = self.received.lock().unwrap();
                    if received.len() >= count {
                        return received.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "expected {} events, got {:?}",
                count,
                self.received.lock().unwrap()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::test_support::Collector;
    use super::*;
    use crate::event::tests::event;
    use crate::store::StreamAppender;
    use crate::subscription::consumer_fn;
    use crate::version::WriteCondition;

    #[tokio::test]
    async fn subscribing_from_now_skips_earlier_events() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store.clone());
        let collector = Collector::default();

        store
            .append("stream", WriteCondition::Any, vec![event("before")])
            .await
            .unwrap();

        model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("after")])
            .await
            .unwrap();

        let received = collector.wait_for(1).await;
        assert_eq!(received[0].event.id, "after");
    }

    #[tokio::test]
    async fn resuming_from_a_position_delivers_later_events_only() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store.clone());
        let collector = Collector::default();

        store
            .append("stream", WriteCondition::Any, vec![event("1"), event("2"), event("3")])
            .await
            .unwrap();

        model
            .subscribe(
                "sub",
                None,
                StartAt::Position(SubscriptionPosition::Token("1".to_owned())),
                collector.consumer(),
            )
            .await
            .unwrap();

        let received = collector.wait_for(2).await;
        let ids: Vec<_> = received.iter().map(|e| e.event.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn filters_are_applied_to_deliveries() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store.clone());
        let collector = Collector::default();

        model
            .subscribe(
                "sub",
                Some(crate::filter::Filter::stream_id("interesting")),
                StartAt::Now,
                collector.consumer(),
            )
            .await
            .unwrap();

        store
            .append("boring", WriteCondition::Any, vec![event("skipped")])
            .await
            .unwrap();
        store
            .append("interesting", WriteCondition::Any, vec![event("delivered")])
            .await
            .unwrap();

        let received = collector.wait_for(1).await;
        assert_eq!(received[0].event.id, "delivered");
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn beginning_of_time_is_rejected() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store);
        let collector = Collector::default();

        let error = model
            .subscribe("sub", None, StartAt::BeginningOfTime, collector.consumer())
            .await
            .expect_err("beginning-of-time requires a catch-up subscription");

        assert!(matches!(error, SubscribeError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn duplicate_subscription_ids_are_rejected() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store);
        let collector = Collector::default();

        model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .unwrap();

        let error = model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .expect_err("the id is taken");

        assert!(matches!(error, SubscribeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn cancelled_subscriptions_receive_nothing_further() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store.clone());
        let collector = Collector::default();

        model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("1")])
            .await
            .unwrap();
        collector.wait_for(1).await;

        model.cancel("sub").await.unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("2")])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.received().len(), 1);
    }

    #[tokio::test]
    async fn paused_subscriptions_resume_where_the_provider_says() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store.clone());
        let collector = Collector::default();

        model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .unwrap();
        assert!(model.is_running("sub").await);

        model.pause("sub").await.unwrap();
        assert!(model.is_paused("sub").await);

        store
            .append("stream", WriteCondition::Any, vec![event("while-paused")])
            .await
            .unwrap();

        // StartAt::Now was captured as the provider: resuming starts from the
        // current head, so the event written while paused is skipped.
        model.resume("sub").await.unwrap();
        assert!(model.is_running("sub").await);

        store
            .append("stream", WriteCondition::Any, vec![event("after-resume")])
            .await
            .unwrap();

        let received = collector.wait_for(1).await;
        assert_eq!(received[0].event.id, "after-resume");
    }

    #[tokio::test]
    async fn failed_deliveries_are_retried_without_advancing() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::with_retry(
            store.clone(),
            RetryPolicy::fixed(Duration::from_millis(5)),
        );

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_consumer = attempts.clone();
        let consumer = consumer_fn(move |_event| {
            let attempts = attempts_in_consumer.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("flaky consumer");
                }
                Ok(())
            }
        });

        model.subscribe("sub", None, StartAt::Now, consumer).await.unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("1")])
            .await
            .unwrap();

        for _ in 0..100 {
            if attempts.load(Ordering::SeqCst) >= 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("the delivery was not retried to success");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_subscriptions() {
        let store = InMemoryEventStore::new();
        let model = InMemorySubscriptionModel::new(store);
        let collector = Collector::default();

        model.shutdown().await;

        let error = model
            .subscribe("sub", None, StartAt::Now, collector.consumer())
            .await
            .expect_err("the model is shut down");

        assert!(matches!(error, SubscribeError::ShutDown));
    }

    #[tokio::test]
    async fn position_storage_applies_fencing() {
        let storage = InMemoryPositionStorage::new();
        let position = SubscriptionPosition::Token("5".to_owned());

        storage.save("sub", &position, Some(2)).await.unwrap();

        let error = storage
            .save("sub", &position, Some(1))
            .await
            .expect_err("the fencing token is stale");
        assert!(matches!(error, PositionStorageError::StaleLease { .. }));

        storage.save("sub", &position, Some(3)).await.unwrap();
        assert_eq!(storage.read("sub").await.unwrap(), Some(position));
    }
}
