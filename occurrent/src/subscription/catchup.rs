//! Catch-up subscriptions: replay history, then join the live feed.
//!
//! A catch-up subscription runs in two phases. The live subscription is
//! opened first but its events are only buffered; a bounded-batch query then
//! replays historical events in ascending time order, persisting a time-based
//! position every few events. Once the query is exhausted the buffer is
//! drained — skipping events already delivered during the historical phase —
//! and deliveries continue live with backend-native position tokens.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use futures::TryStreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::condition::Condition;
use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::retry::RetryPolicy;
use crate::store::{EventQueries, QueryOptions, SortBy};
use crate::subscription::{
    EventConsumer, PositionAware, PositionStorage, PositionedEvent, StartAt, StartAtProvider,
    SubscribeError, Subscription, SubscriptionModel, SubscriptionPosition,
};

/// Configuration for [CatchupSubscriptionModel].
#[derive(Debug, Clone)]
pub struct CatchupSubscriptionConfig {
    /// Page size of the historical query.
    pub batch_size: u64,

    /// Persist a time-based position every this many historical deliveries.
    pub persist_every: u64,

    /// Retry policy around historical deliveries. Live deliveries are
    /// retried by the wrapped model.
    pub retry: RetryPolicy,
}

impl Default for CatchupSubscriptionConfig {
    fn default() -> Self {
        CatchupSubscriptionConfig {
            batch_size: 100,
            persist_every: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Wraps a position-aware model with historical replay for subscriptions
/// starting at the beginning of time or at a time-based position.
///
/// Subscriptions starting from `Now` or a backend-native token pass straight
/// through to the wrapped model.
pub struct CatchupSubscriptionModel<S, Q> {
    delegate: Arc<S>,
    store: Arc<Q>,
    storage: Arc<dyn PositionStorage>,
    config: CatchupSubscriptionConfig,
    replays: Arc<Mutex<HashMap<String, Replay>>>,
}

struct Replay {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

enum Phase {
    /// Live events arrive here until history is exhausted.
    Buffering(Vec<PositionedEvent>),

    /// Live deliveries, de-duplicated against the historical phase until an
    /// event's time strictly exceeds the last historical time.
    Live {
        dedup: Option<HashSet<(String, String)>>,
        last_historical_time: Option<DateTime<FixedOffset>>,
    },
}

struct SwitchingConsumer {
    inner: Arc<dyn EventConsumer>,
    phase: Arc<tokio::sync::Mutex<Phase>>,
}

#[async_trait]
impl EventConsumer for SwitchingConsumer {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        // The phase lock also serializes live deliveries with the buffer
        // drain, preserving per-subscription sequentiality across the
        // switchover.
        let mut phase = self.phase.lock().await;

        match &mut *phase {
            Phase::Buffering(buffer) => {
                buffer.push(event);
                Ok(())
            },
            Phase::Live {
                dedup,
                last_historical_time,
            } => {
                // The de-dup set is only needed around the switchover; drop
                // it once live events move strictly past the last historical
                // time.
                if dedup.is_some() && event.event.time > *last_historical_time {
                    *dedup = None;
                }
                if let Some(seen) = dedup {
                    if seen.contains(&(event.event.id.clone(), event.event.source.clone())) {
                        return Ok(());
                    }
                }
                self.inner.consume(event).await
            },
        }
    }
}

impl<S, Q> CatchupSubscriptionModel<S, Q>
where
    S: PositionAware + 'static,
    Q: EventQueries + 'static,
{
    pub fn new(delegate: Arc<S>, store: Arc<Q>, storage: Arc<dyn PositionStorage>) -> Self {
        Self::with_config(delegate, store, storage, CatchupSubscriptionConfig::default())
    }

    pub fn with_config(
        delegate: Arc<S>,
        store: Arc<Q>,
        storage: Arc<dyn PositionStorage>,
        config: CatchupSubscriptionConfig,
    ) -> Self {
        Self {
            delegate,
            store,
            storage,
            config,
            replays: Arc::default(),
        }
    }

    /// The wrapped, live-only subscription model.
    pub fn delegate(&self) -> &Arc<S> {
        &self.delegate
    }

    async fn subscribe_with_catchup(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        from: Option<DateTime<Utc>>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        let phase = Arc::new(tokio::sync::Mutex::new(Phase::Buffering(Vec::new())));

        let switching = Arc::new(SwitchingConsumer {
            inner: consumer.clone(),
            phase: phase.clone(),
        });

        // Open the live subscription before touching history so that no
        // event written in between is lost; it buffers until the switchover.
        let subscription = self
            .delegate
            .subscribe(subscription_id, filter.clone(), StartAt::Now, switching)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(replay_history(
            self.store.clone(),
            self.storage.clone(),
            self.config.clone(),
            subscription_id.to_owned(),
            filter,
            from,
            consumer,
            phase,
            stop_rx,
        ));

        self.replays
            .lock()
            .expect("acquire lock on replay registry")
            .insert(subscription_id.to_owned(), Replay { stop_tx, handle });

        Ok(subscription)
    }

    async fn stop_replay(&self, subscription_id: &str) {
        let replay = self
            .replays
            .lock()
            .expect("acquire lock on replay registry")
            .remove(subscription_id);

        if let Some(replay) = replay {
            let _ = replay.stop_tx.send(true);
            let _ = replay.handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)] // Spawned once, from one place.
async fn replay_history<Q>(
    store: Arc<Q>,
    storage: Arc<dyn PositionStorage>,
    config: CatchupSubscriptionConfig,
    subscription_id: String,
    filter: Option<Filter>,
    from: Option<DateTime<Utc>>,
    consumer: Arc<dyn EventConsumer>,
    phase: Arc<tokio::sync::Mutex<Phase>>,
    stop_rx: watch::Receiver<bool>,
) where
    Q: EventQueries + 'static,
{
    let mut historical_filter = filter.unwrap_or_else(Filter::all);
    if let Some(from) = from {
        historical_filter =
            historical_filter.and(Filter::time(Condition::gte(from.fixed_offset().into())));
    }

    let mut dedup: HashSet<(String, String)> = HashSet::new();
    let mut last_historical_time: Option<DateTime<FixedOffset>> = None;
    let mut delivered: u64 = 0;
    let mut skip: u64 = 0;

    tracing::debug!(
        subscription.id = %subscription_id,
        from = ?from,
        "starting historical replay"
    );

    loop {
        if *stop_rx.borrow() {
            return;
        }

        let options = QueryOptions::sorted_by(SortBy::TimeAsc)
            .skip(skip)
            .limit(config.batch_size);

        let batch: Vec<CloudEvent> = match store.query(historical_filter.clone(), options).await {
            Ok(cursor) => match cursor.try_collect().await {
                Ok(batch) => batch,
                Err(error) => {
                    tracing::error!(
                        subscription.id = %subscription_id,
                        %error,
                        "historical query failed, abandoning replay"
                    );
                    return;
                },
            },
            Err(error) => {
                tracing::error!(
                    subscription.id = %subscription_id,
                    %error,
                    "historical query failed, abandoning replay"
                );
                return;
            },
        };

        let batch_len = batch.len() as u64;

        for event in batch {
            if *stop_rx.borrow() {
                return;
            }

            let time = event.time;
            let position = SubscriptionPosition::Time(
                time.map(|t| t.with_timezone(&Utc))
                    .unwrap_or(DateTime::UNIX_EPOCH),
            );
            let positioned = PositionedEvent {
                position: position.clone(),
                event,
            };

            let result = config
                .retry
                .retry(|_| true, || consumer.consume(positioned.clone()))
                .await;

            if let Err(error) = result {
                tracing::error!(
                    subscription.id = %subscription_id,
                    event.id = %positioned.event.id,
                    %error,
                    "dropping historical event after exhausting the retry policy"
                );
            }

            dedup.insert((positioned.event.id.clone(), positioned.event.source.clone()));
            last_historical_time = time.or(last_historical_time);
            delivered += 1;

            if delivered % config.persist_every == 0 {
                if let Err(error) = storage.save(&subscription_id, &position, None).await {
                    tracing::warn!(
                        subscription.id = %subscription_id,
                        %error,
                        "failed to persist historical position, replay continues"
                    );
                }
            }
        }

        if batch_len < config.batch_size {
            break;
        }
        skip += batch_len;
    }

    // Switchover: drain buffered live events, skipping the ones history
    // already delivered, then go live.
    let mut phase = phase.lock().await;
    if let Phase::Buffering(buffer) = &mut *phase {
        let buffered = std::mem::take(buffer);

        tracing::debug!(
            subscription.id = %subscription_id,
            replayed = delivered,
            buffered = buffered.len(),
            "historical replay finished, switching to live deliveries"
        );

        for positioned in buffered {
            let key = (positioned.event.id.clone(), positioned.event.source.clone());
            if dedup.contains(&key) {
                continue;
            }

            let result = config
                .retry
                .retry(|_| true, || consumer.consume(positioned.clone()))
                .await;

            if let Err(error) = result {
                tracing::error!(
                    subscription.id = %subscription_id,
                    event.id = %positioned.event.id,
                    %error,
                    "dropping buffered event after exhausting the retry policy"
                );
            }
        }

        *phase = Phase::Live {
            dedup: Some(dedup),
            last_historical_time,
        };
    }
}

#[async_trait]
impl<S, Q> SubscriptionModel for CatchupSubscriptionModel<S, Q>
where
    S: PositionAware + 'static,
    Q: EventQueries + 'static,
{
    async fn subscribe_with(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        if self.config.batch_size == 0 || self.config.persist_every == 0 {
            return Err(SubscribeError::InvalidArgument(
                "batch_size and persist_every must be at least 1".to_owned(),
            ));
        }

        match start_at().await? {
            StartAt::BeginningOfTime => {
                self.subscribe_with_catchup(subscription_id, filter, None, consumer)
                    .await
            },
            StartAt::Position(SubscriptionPosition::Time(time)) => {
                self.subscribe_with_catchup(subscription_id, filter, Some(time), consumer)
                    .await
            },
            StartAt::Now | StartAt::Position(SubscriptionPosition::Token(_)) => {
                self.delegate
                    .subscribe_with(subscription_id, filter, start_at, consumer)
                    .await
            },
        }
    }

    async fn cancel(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        self.stop_replay(subscription_id).await;
        self.delegate.cancel(subscription_id).await
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self
            .replays
            .lock()
            .expect("acquire lock on replay registry")
            .keys()
            .cloned()
            .collect();

        for id in ids {
            self.stop_replay(&id).await;
        }

        self.delegate.shutdown().await;
    }
}

#[async_trait]
impl<S, Q> PositionAware for CatchupSubscriptionModel<S, Q>
where
    S: PositionAware + 'static,
    Q: EventQueries + 'static,
{
    async fn global_position(&self) -> Result<SubscriptionPosition, SubscribeError> {
        self.delegate.global_position().await
    }
}
