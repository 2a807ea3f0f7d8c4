//! Change-stream driven subscription model.
//!
//! Each subscription owns a worker task tailing the event collection's
//! change stream. Insert notifications are decoded back into CloudEvents and
//! delivered together with the change stream's resume token, rendered as an
//! opaque position. A broken stream is re-established from the last observed
//! token, so subscriptions survive transient cursor failures without losing
//! their place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use chrono::Utc;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::change_stream::ChangeStream;
use mongodb::options::ChangeStreamOptions;
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use occurrent::filter::Filter;
use occurrent::retry::RetryPolicy;
use occurrent::subscription::{
    EventConsumer, PositionAware, PositionedEvent, StartAt, StartAtProvider, SubscribeError,
    Subscription, SubscriptionLifecycle, SubscriptionModel, SubscriptionPosition,
};

use crate::document::decode;
use crate::query::to_query_prefixed;
use crate::SubscriptionConfig;

/// Wire form of a MongoDB subscription position, rendered to an opaque token
/// string inside [SubscriptionPosition::Token].
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum MongoPosition {
    /// A change-stream resume token.
    ResumeToken(Document),

    /// A cluster operation time.
    OperationTime { time: u32, increment: u32 },
}

impl MongoPosition {
    pub(crate) fn to_position(&self) -> Result<SubscriptionPosition, serde_json::Error> {
        Ok(SubscriptionPosition::Token(serde_json::to_string(self)?))
    }

    pub(crate) fn from_token(token: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(token)
    }
}

enum StartPoint {
    Now,
    After(mongodb::change_stream::event::ResumeToken),
    OperationTime(Timestamp),
}

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
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Position-aware [SubscriptionModel] backed by MongoDB change streams.
pub struct MongoSubscriptionModel {
    db: Database,
    events: Collection<Document>,
    config: SubscriptionConfig,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionState>>>,
    shut_down: Arc<AtomicBool>,
}

impl MongoSubscriptionModel {
    pub fn new(client: &Client, database: &str, config: SubscriptionConfig) -> Self {
        let db = client.database(database);
        let events = db.collection::<Document>(&config.event_collection);

        Self {
            db,
            events,
            config,
            subscriptions: Arc::default(),
            shut_down: Arc::default(),
        }
    }

    fn start_point(&self, start_at: &StartAt) -> Result<StartPoint, SubscribeError> {
        match start_at {
            StartAt::Now => Ok(StartPoint::Now),
            StartAt::Position(SubscriptionPosition::Token(token)) => {
                match MongoPosition::from_token(token) {
                    Ok(MongoPosition::ResumeToken(document)) => {
                        let token = bson::from_document(document).map_err(|err| {
                            SubscribeError::InvalidArgument(format!(
                                "malformed resume token: {}",
                                err
                            ))
                        })?;
                        Ok(StartPoint::After(token))
                    },
                    Ok(MongoPosition::OperationTime { time, increment }) => {
                        Ok(StartPoint::OperationTime(Timestamp { time, increment }))
                    },
                    Err(err) => Err(SubscribeError::InvalidArgument(format!(
                        "'{}' is not a MongoDB subscription position: {}",
                        token, err
                    ))),
                }
            },
            StartAt::Position(SubscriptionPosition::Time(time)) => {
                Ok(StartPoint::OperationTime(Timestamp {
                    time: time.timestamp() as u32,
                    increment: 0,
                }))
            },
            StartAt::BeginningOfTime => Err(SubscribeError::InvalidArgument(
                "change streams cannot start at the beginning of time; replay requires a \
                 catch-up subscription"
                    .to_owned(),
            )),
        }
    }

    fn spawn_worker(
        &self,
        subscription_id: &str,
        filter: Option<Filter>,
        consumer: Arc<dyn EventConsumer>,
        start: StartPoint,
    ) -> Worker {
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker(
            self.events.clone(),
            self.config.clone(),
            subscription_id.to_owned(),
            filter,
            consumer,
            start,
            stop_rx,
        ));

        Worker { stop_tx, handle }
    }
}

fn change_stream_pipeline(filter: &Option<Filter>, config: &SubscriptionConfig) -> Vec<Document> {
    let mut match_document = doc! { "operationType": "insert" };

    if let Some(filter) = filter {
        let lowered = to_query_prefixed(filter, config.time_representation, "fullDocument.");
        for (key, value) in lowered {
            match_document.insert(key, value);
        }
    }

    vec![doc! { "$match": match_document }]
}

fn options_for(start: &StartPoint) -> ChangeStreamOptions {
    let mut options = ChangeStreamOptions::builder().build();
    match start {
        StartPoint::Now => {},
        StartPoint::After(token) => options.start_after = Some(token.clone()),
        StartPoint::OperationTime(timestamp) => options.start_at_operation_time = Some(*timestamp),
    }
    options
}

async fn run_worker(
    events: Collection<Document>,
    config: SubscriptionConfig,
    subscription_id: String,
    filter: Option<Filter>,
    consumer: Arc<dyn EventConsumer>,
    start: StartPoint,
    mut stop_rx: watch::Receiver<bool>,
) {
    let pipeline = change_stream_pipeline(&filter, &config);
    let mut next_start = start;

    'reconnect: loop {
        if *stop_rx.borrow() {
            return;
        }

        let mut stream: ChangeStream<ChangeStreamEvent<Document>> = match events
            .watch(pipeline.clone(), options_for(&next_start))
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    subscription.id = %subscription_id,
                    %error,
                    "failed to open the change stream, backing off"
                );
                if wait_or_stop(&mut stop_rx, config.restart_backoff).await {
                    return;
                }
                continue;
            },
        };

        loop {
            let change = tokio::select! {
                _ = stop_rx.changed() => return,
                change = stream.next() => change,
            };

            let change = match change {
                Some(Ok(change)) => change,
                Some(Err(error)) => {
                    tracing::warn!(
                        subscription.id = %subscription_id,
                        %error,
                        "change stream failed, re-establishing from the last position"
                    );
                    if wait_or_stop(&mut stop_rx, config.restart_backoff).await {
                        return;
                    }
                    continue 'reconnect;
                },
                None => {
                    if wait_or_stop(&mut stop_rx, config.restart_backoff).await {
                        return;
                    }
                    continue 'reconnect;
                },
            };

            // Any observed change moves the resume point forward, inserts or
            // not, so a restart does not replay already-seen notifications.
            next_start = StartPoint::After(change.id.clone());

            if change.operation_type != OperationType::Insert {
                continue;
            }
            let Some(document) = change.full_document else {
                continue;
            };

            let event = match decode(document, config.time_representation) {
                Ok(event) => event,
                Err(error) => {
                    tracing::error!(
                        subscription.id = %subscription_id,
                        %error,
                        "skipping change stream document that does not decode to a cloud event"
                    );
                    continue;
                },
            };

            // The pipeline already filtered server-side; re-checked here as
            // a safety net.
            if let Some(filter) = &filter {
                if !filter.matches(&event) {
                    continue;
                }
            }

            let token = match bson::to_document(&change.id) {
                Ok(document) => document,
                Err(error) => {
                    tracing::error!(
                        subscription.id = %subscription_id,
                        %error,
                        "failed to encode the resume token, skipping delivery"
                    );
                    continue;
                },
            };
            let position = match (MongoPosition::ResumeToken(token)).to_position() {
                Ok(position) => position,
                Err(error) => {
                    tracing::error!(
                        subscription.id = %subscription_id,
                        %error,
                        "failed to render the resume token, skipping delivery"
                    );
                    continue;
                },
            };

            let positioned = PositionedEvent { position, event };

            // Retries stop once cancellation is requested; the in-flight
            // attempt always completes.
            let stop_requested = stop_rx.clone();
            let result = config
                .retry
                .retry(
                    move |_: &anyhow::Error| !*stop_requested.borrow(),
                    || consumer.consume(positioned.clone()),
                )
                .await;

            if let Err(error) = result {
                tracing::error!(
                    subscription.id = %subscription_id,
                    event.id = %positioned.event.id,
                    %error,
                    "dropping event after exhausting the retry policy"
                );
            }
        }
    }
}

/// Sleeps for `backoff`, returning true if stop was requested meanwhile.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, backoff: std::time::Duration) -> bool {
    tokio::select! {
        _ = stop_rx.changed() => true,
        _ = tokio::time::sleep(backoff) => *stop_rx.borrow(),
    }
}

#[async_trait]
impl SubscriptionModel for MongoSubscriptionModel {
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
        let start = self.start_point(&resolved)?;

        let mut worker = Some(self.spawn_worker(subscription_id, filter.clone(), consumer.clone(), start));

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

        tracing::debug!(subscription.id = %subscription_id, "change stream subscription started");

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

        tracing::debug!(subscription.id = %subscription_id, "change stream subscription cancelled");

        Ok(())
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);

        let workers: Vec<Worker> = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .expect("acquire lock on subscription registry");

            subscriptions
                .values_mut()
                .filter_map(|state| state.worker.take())
                .collect()
        };

        for worker in workers {
            worker.stop().await;
        }
    }
}

#[async_trait]
impl PositionAware for MongoSubscriptionModel {
    /// Reads the server's current operation time and advances it by one
    /// increment, so a subscription started from the returned position does
    /// not re-observe events written before this call.
    async fn global_position(&self) -> Result<SubscriptionPosition, SubscribeError> {
        let reply = self
            .db
            .run_command(doc! { "hello": 1 }, None)
            .await
            .map_err(|err| SubscribeError::Backend(anyhow::Error::new(err)))?;

        match reply.get("operationTime") {
            Some(Bson::Timestamp(timestamp)) => MongoPosition::OperationTime {
                time: timestamp.time,
                increment: timestamp.increment + 1,
            }
            .to_position()
            .map_err(|err| SubscribeError::Backend(anyhow::Error::new(err))),
            // Standalone servers report no operation time; fall back to wall
            // clock, which a catch-up subscription can start from.
            _ => Ok(SubscriptionPosition::Time(Utc::now())),
        }
    }
}

#[async_trait]
impl SubscriptionLifecycle for MongoSubscriptionModel {
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

        tracing::debug!(subscription.id = %subscription_id, "change stream subscription paused");

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

        // The provider is re-invoked so the resumed subscription starts from
        // the most recently persisted position.
        let resolved = start_at().await?;
        let start = self.start_point(&resolved)?;
        let mut worker = Some(self.spawn_worker(subscription_id, filter, consumer, start));

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

        tracing::debug!(subscription.id = %subscription_id, "change stream subscription resumed");

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
