//! Subscriptions push newly written events to consumers.
//!
//! A [SubscriptionModel] owns one logical worker per subscription: the worker
//! invokes the consumer sequentially, so callbacks never overlap for the same
//! subscription id, while distinct subscriptions run in parallel. Each
//! delivered event is annotated with a resumable [SubscriptionPosition].
//!
//! On top of a position-aware model, wrappers add durability
//! ([durable::DurableSubscriptionModel]), historical catch-up
//! ([catchup::CatchupSubscriptionModel]) and cross-process competing-consumer
//! coordination ([competing::CompetingConsumerSubscriptionModel]).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::CloudEvent;
use crate::filter::Filter;

pub mod catchup;
pub mod competing;
pub mod durable;
pub mod inmemory;

/// An opaque token a subscription can later be resumed from.
///
/// Backends issue whatever they can resume cheaply: a native resume cursor
/// rendered as an opaque string, or a wall-clock instant for positions that
/// must survive translation between the historical and live phases of a
/// catch-up subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionPosition {
    Time(DateTime<Utc>),
    Token(String),
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, PartialEq)]
pub enum StartAt {
    /// Only events written after the subscription is established.
    Now,

    /// Every event ever written. Only supported by models with a catch-up
    /// phase.
    BeginningOfTime,

    /// Resume right after the event that produced this position.
    Position(SubscriptionPosition),
}

/// Lazily resolved [StartAt].
///
/// Wrappers that persist positions resolve the start lazily so that a
/// restarted or resumed subscription picks up the latest stored position, not
/// the one from when the process booted.
pub type StartAtProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<StartAt, SubscribeError>> + Send + Sync>;

impl StartAt {
    /// A provider that always resolves to this value.
    pub fn into_provider(self) -> StartAtProvider {
        Arc::new(move || {
            let start_at = self.clone();
            async move { Ok::<_, SubscribeError>(start_at) }.boxed()
        })
    }
}

/// A CloudEvent annotated with the position it was observed at.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedEvent {
    pub position: SubscriptionPosition,
    pub event: CloudEvent,
}

/// Consumes events delivered by a subscription.
///
/// Returning an error makes the subscription worker re-deliver according to
/// its retry policy; the subscription position does not advance until the
/// consumer succeeds.
#[async_trait]
pub trait EventConsumer: Send + Sync + 'static {
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()>;
}

struct ConsumerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventConsumer for ConsumerFn<F>
where
    F: Fn(PositionedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn consume(&self, event: PositionedEvent) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// Adapts an async closure into an [EventConsumer].
pub fn consumer_fn<F, Fut>(f: F) -> Arc<dyn EventConsumer>
where
    F: Fn(PositionedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ConsumerFn { f })
}

/// Handle to a started subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: String,
}

impl Subscription {
    pub fn new(id: impl Into<String>) -> Self {
        Subscription { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Error returned by subscription management operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("a subscription with id '{0}' already exists")]
    AlreadyExists(String),

    #[error("subscription '{0}' was not found")]
    NotFound(String),

    #[error("subscription '{0}' is not running")]
    NotRunning(String),

    #[error("subscription '{0}' is not paused")]
    NotPaused(String),

    #[error("the subscription model has been shut down")]
    ShutDown,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Creates and manages long-running subscriptions.
#[async_trait]
pub trait SubscriptionModel: Send + Sync {
    /// Starts a subscription whose start position is resolved lazily through
    /// `start_at`. Most callers want [`SubscriptionModel::subscribe`]
    /// instead.
    async fn subscribe_with(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAtProvider,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError>;

    /// Starts a subscription delivering every event matching `filter` from
    /// `start_at` on to `consumer`.
    async fn subscribe(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        start_at: StartAt,
        consumer: Arc<dyn EventConsumer>,
    ) -> Result<Subscription, SubscribeError> {
        self.subscribe_with(subscription_id, filter, start_at.into_provider(), consumer)
            .await
    }

    /// Cancels a subscription: no further callbacks are delivered once an
    /// in-flight one completes.
    async fn cancel(&self, subscription_id: &str) -> Result<(), SubscribeError>;

    /// Stops all subscriptions and releases backend resources. The model
    /// cannot be used afterwards.
    async fn shutdown(&self);
}

/// A [SubscriptionModel] that can report the position of "now".
#[async_trait]
pub trait PositionAware: SubscriptionModel {
    /// The current global position: a subscription started from it observes
    /// exactly the events written after this call.
    async fn global_position(&self) -> Result<SubscriptionPosition, SubscribeError>;
}

/// Pause/resume support, required by the competing-consumer coordinator.
///
/// Pausing keeps the subscription registered but stops its worker; resuming
/// re-resolves the start position through the provider given at subscribe
/// time and starts a fresh worker.
#[async_trait]
pub trait SubscriptionLifecycle: SubscriptionModel {
    async fn pause(&self, subscription_id: &str) -> Result<(), SubscribeError>;

    async fn resume(&self, subscription_id: &str) -> Result<Subscription, SubscribeError>;

    async fn is_running(&self, subscription_id: &str) -> bool;

    async fn is_paused(&self, subscription_id: &str) -> bool;
}

/// Error returned by a [PositionStorage].
#[derive(Debug, thiserror::Error)]
pub enum PositionStorageError {
    /// The write carried a fencing token older than the one already stored;
    /// the caller lost its lease and must not advance the position.
    #[error("position write for subscription '{subscription_id}' rejected, lease version {attempted} is stale")]
    StaleLease {
        subscription_id: String,
        attempted: u64,
    },

    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Durable storage for subscription positions.
///
/// `fencing` carries the lease version of the writing consumer when the
/// competing-consumer coordinator is in use; implementations must reject
/// writes whose fencing token is older than the stored one.
#[async_trait]
pub trait PositionStorage: Send + Sync {
    async fn read(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionPosition>, PositionStorageError>;

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        fencing: Option<u64>,
    ) -> Result<(), PositionStorageError>;

    async fn delete(&self, subscription_id: &str) -> Result<(), PositionStorageError>;
}

/// Source of the current fencing token for a subscription, implemented by
/// competing-consumer strategies. Position writes performed on behalf of a
/// subscription are tagged with this token.
pub trait FencingTokenSource: Send + Sync {
    fn fencing_token(&self, subscription_id: &str) -> Option<u64>;
}
