//! Competing consumers: at most one process drives a subscription at a time.
//!
//! Coordination is delegated to a [CompetingConsumerStrategy], typically
//! lease-based and backed by the event store's database. The strategy
//! announces ownership changes as [ConsumeChange] messages over an internal
//! broadcast; the subscription model reacts by starting, pausing or resuming
//! the delegate subscription. The strategy also exposes the lease version as
//! a fencing token, which durable position storage uses to reject writes from
//! consumers whose lease was taken over.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::filter::Filter;
use crate::subscription::{
    EventConsumer, FencingTokenSource, StartAtProvider, SubscribeError, Subscription,
    SubscriptionLifecycle, SubscriptionModel,
};

/// Ownership change announced by a [CompetingConsumerStrategy].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeChange {
    /// The subscriber acquired the right to consume the subscription.
    Granted {
        subscription_id: String,
        subscriber_id: String,
    },

    /// The subscriber lost the right to consume the subscription.
    Prohibited {
        subscription_id: String,
        subscriber_id: String,
    },
}

/// Cross-process mutual exclusion per subscription id.
///
/// `register` computes the acquire outcome synchronously; later changes
/// driven by lease refresh and expiry arrive through [`changes`](Self::changes).
#[async_trait]
pub trait CompetingConsumerStrategy: FencingTokenSource + Send + Sync + 'static {
    /// Registers a competing consumer and tries to acquire (or refresh) its
    /// exclusive lease. Returns whether the subscriber may consume.
    async fn register(&self, subscription_id: &str, subscriber_id: &str)
        -> Result<bool, anyhow::Error>;

    /// Unregisters the consumer, releasing its lease if it holds one.
    async fn unregister(&self, subscription_id: &str, subscriber_id: &str);

    /// Whether the subscriber currently holds the lease.
    async fn has_lease(&self, subscription_id: &str, subscriber_id: &str) -> bool;

    /// Subscribes to ownership changes.
    fn changes(&self) -> broadcast::Receiver<ConsumeChange>;
}

type Resubscribe =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Subscription, SubscribeError>> + Send + Sync>;

enum ConsumerState {
    Running,
    /// Never started; holds the deferred delegate subscription.
    Waiting(Resubscribe),
    Paused,
}

struct CompetingConsumer {
    subscriber_id: String,
    state: ConsumerState,
}

/// A [SubscriptionModel] decorator that lets multiple processes subscribe
/// with the same subscription id while only one of them consumes.
pub struct CompetingConsumerSubscriptionModel<S, C> {
    delegate: Arc<S>,
    strategy: Arc<C>,
    consumers: Arc<tokio::sync::Mutex<HashMap<String, CompetingConsumer>>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<S, C> CompetingConsumerSubscriptionModel<S, C>
where
    S: SubscriptionModel + SubscriptionLifecycle + 'static,
    C: CompetingConsumerStrategy,
{
    pub fn new(delegate: Arc<S>, strategy: Arc<C>) -> Self {
        let consumers: Arc<tokio::sync::Mutex<HashMap<String, CompetingConsumer>>> = Arc::default();

        let listener = tokio::spawn(listen_for_changes(
            strategy.changes(),
            delegate.clone(),
            consumers.clone(),
        ));

        Self {
            delegate,
            strategy,
            consumers,
            listener: std::sync::Mutex::new(Some(listener)),
        }
    }

    /// The coordination strategy, also usable as a [FencingTokenSource] for
    /// durable position storage.
    pub fn strategy(&self) -> &Arc<C> {
        &self.strategy
    }

    /// Subscribes with an explicit subscriber id identifying this process.
    ///
    /// If another subscriber currently owns the subscription, the delegate
    /// subscription is not started; it starts automatically once the lease is
    /// acquired, within one lease period of the owner going away.
    pub async fn subscribe_competing(
        &self,
        subscriber_id: &str,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        if subscriber_id.is_empty() || subscription_id.is_empty() {
            return Err(SubscribeError::InvalidArgument(
                "subscriber id and subscription id cannot be empty".to_owned(),
            ));
        }

        // Acquire outcome is computed before taking the registry mutex; only
        // the state transition happens under it.
        let acquired = self
            .strategy
            .register(subscription_id, subscriber_id)
            .await
            .map_err(SubscribeError::Backend)?;

        let mut consumers = self.consumers.lock().await;

        if consumers.contains_key(subscription_id) {
            return Err(SubscribeError::AlreadyExists(subscription_id.to_owned()));
        }

        if acquired {
            let subscription = self
                .delegate
                .subscribe_with(subscription_id, filter, start_at, consumer)
                .await;

            match subscription {
                Ok(subscription) => {
                    consumers.insert(
                        subscription_id.to_owned(),
                        CompetingConsumer {
                            subscriber_id: subscriber_id.to_owned(),
                            state: ConsumerState::Running,
                        },
                    );

                    tracing::debug!(
                        subscription.id = %subscription_id,
                        subscriber.id = %subscriber_id,
                        "competing consumer started running"
                    );

                    Ok(subscription)
                },
                Err(error) => {
                    drop(consumers);
                    self.strategy.unregister(subscription_id, subscriber_id).await;
                    Err(error)
                },
            }
        } else {
            let delegate = self.delegate.clone();
            let deferred_id = subscription_id.to_owned();
            let resubscribe: Resubscribe = Arc::new(move || {
                let delegate = delegate.clone();
                let id = deferred_id.clone();
                let filter = filter.clone();
                let start_at = start_at.clone();
                let consumer = consumer.clone();
                async move { delegate.subscribe_with(&id, filter, start_at, consumer).await }.boxed()
            });

            consumers.insert(
                subscription_id.to_owned(),
                CompetingConsumer {
                    subscriber_id: subscriber_id.to_owned(),
                    state: ConsumerState::Waiting(resubscribe),
                },
            );

            tracing::debug!(
                subscription.id = %subscription_id,
                subscriber.id = %subscriber_id,
                "competing consumer waiting for the lease"
            );

            Ok(Subscription::new(subscription_id))
        }
    }
}

async fn listen_for_changes<S>(
    mut changes: broadcast::Receiver<ConsumeChange>,
    delegate: Arc<S>,
    consumers: Arc<tokio::sync::Mutex<HashMap<String, CompetingConsumer>>>,
) where
    S: SubscriptionModel + SubscriptionLifecycle + 'static,
{
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match change {
            ConsumeChange::Granted {
                subscription_id,
                subscriber_id,
            } => {
                // Decide the transition under the mutex, run the delegate
                // call outside of it.
                let action = {
                    let mut consumers = consumers.lock().await;
                    match consumers.get_mut(&subscription_id) {
                        Some(consumer) if consumer.subscriber_id == subscriber_id => {
                            match std::mem::replace(&mut consumer.state, ConsumerState::Running) {
                                ConsumerState::Waiting(resubscribe) => Some(Granted::Start(resubscribe)),
                                ConsumerState::Paused => Some(Granted::Resume),
                                ConsumerState::Running => None,
                            }
                        },
                        _ => None,
                    }
                };

                let result = match action {
                    None => continue,
                    Some(Granted::Start(resubscribe)) => resubscribe().await.map(|_| ()),
                    Some(Granted::Resume) => delegate.resume(&subscription_id).await.map(|_| ()),
                };

                match result {
                    Ok(()) => {
                        tracing::debug!(
                            subscription.id = %subscription_id,
                            subscriber.id = %subscriber_id,
                            "competing consumer granted consumption"
                        );
                    },
                    Err(error) => {
                        tracing::error!(
                            subscription.id = %subscription_id,
                            subscriber.id = %subscriber_id,
                            %error,
                            "failed to start the granted subscription"
                        );
                        let mut consumers = consumers.lock().await;
                        if let Some(consumer) = consumers.get_mut(&subscription_id) {
                            consumer.state = ConsumerState::Paused;
                        }
                    },
                }
            },
            ConsumeChange::Prohibited {
                subscription_id,
                subscriber_id,
            } => {
                let was_running = {
                    let mut consumers = consumers.lock().await;
                    match consumers.get_mut(&subscription_id) {
                        Some(consumer)
                            if consumer.subscriber_id == subscriber_id
                                && matches!(consumer.state, ConsumerState::Running) =>
                        {
                            consumer.state = ConsumerState::Paused;
                            true
                        },
                        _ => false,
                    }
                };

                if was_running {
                    if let Err(error) = delegate.pause(&subscription_id).await {
                        tracing::error!(
                            subscription.id = %subscription_id,
                            %error,
                            "failed to pause the prohibited subscription"
                        );
                    } else {
                        tracing::debug!(
                            subscription.id = %subscription_id,
                            subscriber.id = %subscriber_id,
                            "competing consumer prohibited from consuming, delegate paused"
                        );
                    }
                }
            },
        }
    }
}

enum Granted {
    Start(Resubscribe),
    Resume,
}

#[async_trait]
impl<S, C> SubscriptionModel for CompetingConsumerSubscriptionModel<S, C>
where
    S: SubscriptionModel + SubscriptionLifecycle + 'static,
    C: CompetingConsumerStrategy,
{
    /// Subscribes with a generated subscriber id.
    async fn subscribe_with(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        let subscriber_id = Uuid::new_v4().to_string();
        self.subscribe_competing(&subscriber_id, subscription_id, filter, start_at, consumer)
            .await
    }

    async fn cancel(&self, subscription_id: &str) -> Result<(), SubscribeError> {
        let removed = self.consumers.lock().await.remove(subscription_id);

        let Some(consumer) = removed else {
            return Err(SubscribeError::NotFound(subscription_id.to_owned()));
        };

        self.strategy
            .unregister(subscription_id, &consumer.subscriber_id)
            .await;

        match consumer.state {
            ConsumerState::Waiting(_) => Ok(()),
            ConsumerState::Running | ConsumerState::Paused => {
                self.delegate.cancel(subscription_id).await
            },
        }
    }

    async fn shutdown(&self) {
        let drained: Vec<(String, CompetingConsumer)> =
            self.consumers.lock().await.drain().collect();

        for (subscription_id, consumer) in drained {
            self.strategy
                .unregister(&subscription_id, &consumer.subscriber_id)
                .await;
        }

        if let Some(listener) = self
            .listener
            .lock()
            .expect("acquire lock on listener handle")
            .take()
        {
            listener.abort();
        }

        self.delegate.shutdown().await;
    }
}

/// In-process lease strategy: leases live in a shared map instead of a
/// database. Useful for tests and for single-process deployments that still
/// want several logical subscribers to compete.
pub struct InMemoryLeaseStrategy {
    lease_duration: std::time::Duration,
    leases: Arc<std::sync::Mutex<HashMap<String, Lease>>>,
    statuses: Arc<std::sync::Mutex<HashMap<(String, String), LeaseStatus>>>,
    changes_tx: broadcast::Sender<ConsumeChange>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
struct Lease {
    subscriber_id: String,
    version: u64,
    expires_at: std::time::Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Held { version: u64 },
    NotHeld,
}

const CHANGES_CHANNEL_CAPACITY: usize = 64;

impl InMemoryLeaseStrategy {
    /// Creates the strategy and starts its background ticker, which
    /// refreshes held leases and retries acquisition for waiting consumers
    /// every half lease duration.
    pub fn new(lease_duration: std::time::Duration) -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);

        let strategy = Arc::new(Self {
            lease_duration,
            leases: Arc::default(),
            statuses: Arc::default(),
            changes_tx,
            ticker: std::sync::Mutex::new(None),
        });

        let ticker_strategy = Arc::downgrade(&strategy);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease_duration / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(strategy) = ticker_strategy.upgrade() else {
                    return;
                };
                strategy.refresh_or_acquire_all();
            }
        });

        *strategy.ticker.lock().expect("acquire lock on ticker handle") = Some(ticker);

        strategy
    }

    fn acquire_or_refresh(&self, subscription_id: &str, subscriber_id: &str) -> Option<u64> {
        let mut leases = self.leases.lock().expect("acquire lock on leases");
        let now = std::time::Instant::now();

        match leases.get_mut(subscription_id) {
            Some(lease) if lease.subscriber_id == subscriber_id || lease.expires_at <= now => {
                if lease.subscriber_id != subscriber_id {
                    lease.version += 1;
                    lease.subscriber_id = subscriber_id.to_owned();
                }
                lease.expires_at = now + self.lease_duration;
                Some(lease.version)
            },
            Some(_) => None,
            None => {
                leases.insert(
                    subscription_id.to_owned(),
                    Lease {
                        subscriber_id: subscriber_id.to_owned(),
                        version: 0,
                        expires_at: now + self.lease_duration,
                    },
                );
                Some(0)
            },
        }
    }

    fn apply_status(&self, subscription_id: &str, subscriber_id: &str, acquired: Option<u64>) -> bool {
        let key = (subscription_id.to_owned(), subscriber_id.to_owned());
        let mut statuses = self.statuses.lock().expect("acquire lock on lease statuses");

        let old = statuses.get(&key).copied();
        let new = match acquired {
            Some(version) => LeaseStatus::Held { version },
            None => LeaseStatus::NotHeld,
        };
        statuses.insert(key, new);

        let was_held = matches!(old, Some(LeaseStatus::Held { .. }));
        let is_held = matches!(new, LeaseStatus::Held { .. });

        if !was_held && is_held {
            let _ = self.changes_tx.send(ConsumeChange::Granted {
                subscription_id: subscription_id.to_owned(),
                subscriber_id: subscriber_id.to_owned(),
            });
        } else if was_held && !is_held {
            let _ = self.changes_tx.send(ConsumeChange::Prohibited {
                subscription_id: subscription_id.to_owned(),
                subscriber_id: subscriber_id.to_owned(),
            });
        }

        is_held
    }

    fn refresh_or_acquire_all(&self) {
        let registered: Vec<(String, String)> = self
            .statuses
            .lock()
            .expect("acquire lock on lease statuses")
            .keys()
            .cloned()
            .collect();

        for (subscription_id, subscriber_id) in registered {
            let acquired = self.acquire_or_refresh(&subscription_id, &subscriber_id);
            self.apply_status(&subscription_id, &subscriber_id, acquired);
        }
    }
}

impl FencingTokenSource for InMemoryLeaseStrategy {
    fn fencing_token(&self, subscription_id: &str) -> Option<u64> {
        self.statuses
            .lock()
            .expect("acquire lock on lease statuses")
            .iter()
            .find_map(|((s, _), status)| match status {
                LeaseStatus::Held { version } if s == subscription_id => Some(*version),
                _ => None,
            })
    }
}

#[async_trait]
impl CompetingConsumerStrategy for InMemoryLeaseStrategy {
    async fn register(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> Result<bool, anyhow::Error> {
        let acquired = self.acquire_or_refresh(subscription_id, subscriber_id);
        Ok(self.apply_status(subscription_id, subscriber_id, acquired))
    }

    async fn unregister(&self, subscription_id: &str, subscriber_id: &str) {
        let key = (subscription_id.to_owned(), subscriber_id.to_owned());
        self.statuses
            .lock()
            .expect("acquire lock on lease statuses")
            .remove(&key);

        let mut leases = self.leases.lock().expect("acquire lock on leases");
        if leases
            .get(subscription_id)
            .map_or(false, |lease| lease.subscriber_id == subscriber_id)
        {
            leases.remove(subscription_id);
        }
    }

    async fn has_lease(&self, subscription_id: &str, subscriber_id: &str) -> bool {
        let key = (subscription_id.to_owned(), subscriber_id.to_owned());
        matches!(
            self.statuses
                .lock()
                .expect("acquire lock on lease statuses")
                .get(&key),
            Some(LeaseStatus::Held { .. })
        )
    }

    fn changes(&self) -> broadcast::Receiver<ConsumeChange> {
        self.changes_tx.subscribe()
    }
}

impl Drop for InMemoryLeaseStrategy {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .lock()
            .expect("acquire lock on ticker handle")
            .take()
        {
            ticker.abort();
        }
    }
}
