//! Durable subscriptions: positions survive process restarts.
//!
//! Wraps a position-aware model and a [PositionStorage]. After each
//! successful delivery (or every n-th, per configuration) the event's
//! position is persisted; a persistence failure fails the delivery, so the
//! worker retries and the position is never considered committed without the
//! consumer having run. This is the at-least-once contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::filter::Filter;
use crate::subscription::{
    EventConsumer, FencingTokenSource, PositionAware, PositionStorage, PositionedEvent, StartAt,
    StartAtProvider, SubscribeError, Subscription, SubscriptionLifecycle, SubscriptionModel,
};

/// Configuration for [DurableSubscriptionModel].
#[derive(Debug, Clone)]
pub struct DurableSubscriptionConfig {
    /// Persist the position every this many successful deliveries. 1 (the
    /// default) persists after every delivery; higher values trade restart
    /// duplicates for fewer storage writes.
    pub persist_every: u64,
}

impl Default for DurableSubscriptionConfig {
    fn default() -> Self {
        DurableSubscriptionConfig { persist_every: 1 }
    }
}

/// A [SubscriptionModel] decorator persisting subscription positions.
#[derive(Clone)]
pub struct DurableSubscriptionModel<S, P> {
    model: Arc<S>,
    storage: Arc<P>,
    config: DurableSubscriptionConfig,
    fencing: Option<Arc<dyn FencingTokenSource>>,
}

impl<S, P> DurableSubscriptionModel<S, P>
where
    S: PositionAware + 'static,
    P: PositionStorage + 'static,
{
    pub fn new(model: Arc<S>, storage: Arc<P>) -> Self {
        Self::with_config(model, storage, DurableSubscriptionConfig::default())
    }

    pub fn with_config(model: Arc<S>, storage: Arc<P>, config: DurableSubscriptionConfig) -> Self {
        Self {
            model,
            storage,
            config,
            fencing: None,
        }
    }

    /// Tags every persisted position with the current fencing token of the
    /// given source. Required when this subscription competes across
    /// processes, so that a consumer whose lease was taken over cannot
    /// overwrite positions written by the new leader.
    #[must_use]
    pub fn with_fencing(mut self, fencing: Arc<dyn FencingTokenSource>) -> Self {
        self.fencing = Some(fencing);
        self
    }

    /// The delegate this model wraps.
    pub fn delegate(&self) -> &Arc<S> {
        &self.model
    }

    /// Subscribes starting from the last persisted position for
    /// `subscription_id`. When no position has been persisted yet, the
    /// model's current global position is persisted and used, so the
    /// subscription behaves as if started "now" — but durably.
    ///
    /// The stored position is re-read each time the delegate (re)starts the
    /// subscription, so resuming after a pause picks up positions persisted
    /// in the meantime, possibly by another process.
    pub async fn subscribe_from_stored_position(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        let model = self.model.clone();
        let storage = self.storage.clone();
        let fencing = self.fencing.clone();
        let id = subscription_id.to_owned();

        let start_at: StartAtProvider = Arc::new(move || {
            let model = model.clone();
            let storage = storage.clone();
            let fencing = fencing.clone();
            let id = id.clone();

            async move {
                let stored = storage
                    .read(&id)
                    .await
                    .map_err(|err| SubscribeError::Backend(err.into()))?;

                let position = match stored {
                    Some(position) => position,
                    None => {
                        let position = model.global_position().await?;
                        let token = fencing.as_ref().and_then(|f| f.fencing_token(&id));
                        storage
                            .save(&id, &position, token)
                            .await
                            .map_err(|err| SubscribeError::Backend(err.into()))?;
                        position
                    },
                };

                Ok(StartAt::Position(position))
            }
            .boxed()
        });

        self.subscribe_with(subscription_id, filter, start_at, consumer)
            .await
    }
}

struct PersistingConsumer<P> {
    inner: Arc<dyn EventConsumer>,
    storage: Arc<P>,
    subscription_id: String,
    persist_every: u64,
    delivered: AtomicU64,
    fencing: Option<Arc<dyn FencingTokenSource>>,
}

#[async_trait]
impl<P> EventConsumer for PersistingConsumer<P>
where
    P: PositionStorage + 'static,
{
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        let position = event.position.clone();
        self.inner.consume(event).await?;

        let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        if delivered % self.persist_every == 0 {
            let token = self
                .fencing
                .as_ref()
                .and_then(|f| f.fencing_token(&self.subscription_id));

            // A failed save fails the whole delivery: the position is only
            // committed together with a successful callback.
            self.storage
                .save(&self.subscription_id, &position, token)
                .await?;

            tracing::trace!(
                subscription.id = %self.subscription_id,
                position = ?position,
                "subscription position persisted"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl<S, P> SubscriptionModel for DurableSubscriptionModel<S, P>
where
    S: PositionAware + 'static,
    P: PositionStorage + 'static,
{
    async fn subscribe_with(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        if self.config.persist_every == 0 {
            return Err(SubscribeError::InvalidArgument(
                "persist_every must be at least 1".to_owned(),
            ));
        }

        let persisting = PersistingConsumer {
            inner: consumer,
            storage: self.storage.clone(),
            subscription_id: subscription_id.to_owned(),
            persist_every: self.config.persist_every,
            delivered: AtomicU64::new(0),
            fencing: self.fencing.clone(),
        };

        self.model
            .subscribe_with(subscription_id, filter, start_at, Arc::new(persisting))
            .await
    }

    async fn cancel(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        self.model.cancel(subscription_id).await?;

        self.storage
            .delete(subscription_id)
            .await
            .map_err(|err| SubscribeError::Backend(err.into()))
    }

    async fn shutdown(&self) {
        self.model.shutdown().await;
    }
}

#[async_trait]
impl<S, P> PositionAware for DurableSubscriptionModel<S, P>
where
    S: PositionAware + 'static,
    P: PositionStorage + 'static,
{
    async fn global_position(&self) -> Result<crate::subscription::SubscriptionPosition, SubscribeError> {
        self.model.global_position().await
    }
}

#[async_trait]
impl<S, P> SubscriptionLifecycle for DurableSubscriptionModel<S, P>
where
    S: PositionAware + SubscriptionLifecycle + 'static,
    P: PositionStorage + 'static,
{
    async fn pause(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        self.model.pause(subscription_id).await
    }

    async fn resume(&self, subscription_id: &str) -> Result<Subscription, SubscribeError> {
        self.model.resume(subscription_id).await
    }

    async fn is_running(&self, subscription_id: &str) -> bool {
        self.model.is_running(subscription_id).await
    }

    async fn is_paused(&self, subscription_id: &str) -> bool {
        self.model.is_paused(subscription_id).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::tests::event;
    use crate::store::inmemory::InMemoryEventStore;
    use crate::store::StreamAppender;
    use crate::subscription::inmemory::test_support::Collector;
    use crate::subscription::inmemory::{InMemoryPositionStorage, InMemorySubscriptionModel};
    use crate::subscription::SubscriptionPosition;
    use crate::version::WriteCondition;

    fn durable(
        store: &InMemoryEventStore,
        storage: &Arc<InMemoryPositionStorage>,
        config: DurableSubscriptionConfig,
    ) -> DurableSubscriptionModel<InMemorySubscriptionModel, InMemoryPositionStorage> {
        DurableSubscriptionModel::with_config(
            Arc::new(InMemorySubscriptionModel::new(store.clone())),
            storage.clone(),
            config,
        )
    }

    #[tokio::test]
    async fn position_is_persisted_after_each_delivery() {
        let store = InMemoryEventStore::new();
        let storage = Arc::new(InMemoryPositionStorage::new());
        let model = durable(&store, &storage, DurableSubscriptionConfig::default());
        let collector = Collector::default();

        model
            .subscribe_from_stored_position("sub", None, collector.consumer())
            .await
            .unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("1"), event("2")])
            .await
            .unwrap();

        let received = collector.wait_for(2).await;
        let last = received.last().unwrap().position.clone();

        // The consumer may still be persisting; poll for the final position.
        for _ in 0..100 {
            if storage.read("sub").await.unwrap().as_ref() == Some(&last) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("the last delivered position was never persisted");
    }

    #[tokio::test]
    async fn positions_are_persisted_every_nth_delivery() {
        let store = InMemoryEventStore::new();
        let storage = Arc::new(InMemoryPositionStorage::new());
        let model = durable(
            &store,
            &storage,
            DurableSubscriptionConfig { persist_every: 2 },
        );
        let collector = Collector::default();

        model
            .subscribe_from_stored_position("sub", None, collector.consumer())
            .await
            .unwrap();

        store
            .append(
                "stream",
                WriteCondition::Any,
                vec![event("1"), event("2"), event("3")],
            )
            .await
            .unwrap();

        let received = collector.wait_for(3).await;
        let second = received[1].position.clone();

        for _ in 0..100 {
            if storage.read("sub").await.unwrap().as_ref() == Some(&second) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected the second delivery's position to be the persisted one");
    }

    #[tokio::test]
    async fn restart_resumes_from_the_persisted_position() {
        let store = InMemoryEventStore::new();
        let storage = Arc::new(InMemoryPositionStorage::new());

        let first_run = durable(&store, &storage, DurableSubscriptionConfig::default());
        let first_collector = Collector::default();
        first_run
            .subscribe_from_stored_position("sub", None, first_collector.consumer())
            .await
            .unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("1"), event("2")])
            .await
            .unwrap();
        let received = first_collector.wait_for(2).await;

        // Wait until the position of event 2 is durably stored, then "crash".
        let last = received.last().unwrap().position.clone();
        for _ in 0..100 {
            if storage.read("sub").await.unwrap().as_ref() == Some(&last) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        first_run.shutdown().await;

        store
            .append("stream", WriteCondition::Any, vec![event("3"), event("4")])
            .await
            .unwrap();

        let second_run = durable(&store, &storage, DurableSubscriptionConfig::default());
        let second_collector = Collector::default();
        second_run
            .subscribe_from_stored_position("sub", None, second_collector.consumer())
            .await
            .unwrap();

        let received = second_collector.wait_for(2).await;
        let ids: Vec<_> = received.iter().map(|e| e.event.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn cancel_deletes_the_persisted_position() {
        let store = InMemoryEventStore::new();
        let storage = Arc::new(InMemoryPositionStorage::new());
        let model = durable(&store, &storage, DurableSubscriptionConfig::default());
        let collector = Collector::default();

        model
            .subscribe_from_stored_position("sub", None, collector.consumer())
            .await
            .unwrap();
        assert!(storage.read("sub").await.unwrap().is_some());

        model.cancel("sub").await.unwrap();
        assert!(storage.read("sub").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persisted_positions_carry_the_fencing_token() {
        struct FixedToken(u64);

        impl FencingTokenSource for FixedToken {
            fn fencing_token(&self, _subscription_id: &str) -> Option<u64> {
                Some(self.0)
            }
        }

        let store = InMemoryEventStore::new();
        let storage = Arc::new(InMemoryPositionStorage::new());
        let model = durable(&store, &storage, DurableSubscriptionConfig::default())
            .with_fencing(Arc::new(FixedToken(5)));
        let collector = Collector::default();

        model
            .subscribe_from_stored_position("sub", None, collector.consumer())
            .await
            .unwrap();

        store
            .append("stream", WriteCondition::Any, vec![event("1")])
            .await
            .unwrap();
        collector.wait_for(1).await;

        // An older lease can no longer move the position.
        let position = SubscriptionPosition::Token("0".to_owned());
        for _ in 0..100 {
            match storage.save("sub", &position, Some(4)).await {
                Err(crate::subscription::PositionStorageError::StaleLease { .. }) => return,
                _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        panic!("a stale fencing token was accepted");
    }
}
