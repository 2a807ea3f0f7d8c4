//! Lease-based competing-consumer coordination in MongoDB.
//!
//! One lease document per subscription id:
//! `{_id, subscriberId, version, expiresAt}`. Ownership is taken with a
//! single conditional `findOneAndUpdate` upsert, so exactly one subscriber
//! wins; `version` is a fencing token bumped whenever ownership moves to a
//! different subscriber, and is what position storage checks stale writes
//! against. A background ticker refreshes held leases and retries
//! acquisition for the waiting ones every half lease duration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument, UpdateModifications};
use mongodb::{Client, Collection};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use occurrent::subscription::competing::{CompetingConsumerStrategy, ConsumeChange};
use occurrent::subscription::FencingTokenSource;

pub const DEFAULT_LEASE_COLLECTION: &str = "competing-consumer-leases";
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(20);

const CHANGES_CHANNEL_CAPACITY: usize = 64;

/// Configuration of the [MongoLeaseStrategy].
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub collection: String,

    /// How long a lease lives without a refresh. Failover happens within one
    /// lease duration of the owner going away.
    pub lease_duration: Duration,

    /// How often held leases are refreshed and waiting consumers retry
    /// acquisition. Defaults to half the lease duration.
    pub refresh_interval: Option<Duration>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            collection: DEFAULT_LEASE_COLLECTION.to_owned(),
            lease_duration: DEFAULT_LEASE_DURATION,
            refresh_interval: None,
        }
    }
}

fn lease_version(document: &Document) -> Option<u64> {
    match document.get("version") {
        Some(Bson::Int32(version)) => Some(*version as u64),
        Some(Bson::Int64(version)) => Some(*version as u64),
        _ => None,
    }
}

/// Attempts to acquire the lease for `subscriber_id`, or refresh it if
/// already held. Returns the fencing version on success, `None` when another
/// subscriber owns an unexpired lease.
pub async fn acquire_or_refresh(
    leases: &Collection<Document>,
    subscription_id: &str,
    subscriber_id: &str,
    lease_duration: Duration,
) -> Result<Option<u64>, mongodb::error::Error> {
    let now = bson::DateTime::now();
    let expires_at =
        bson::DateTime::from_millis(now.timestamp_millis() + lease_duration.as_millis() as i64);

    let filter = doc! {
        "_id": subscription_id,
        "$or": [
            { "expiresAt": Bson::Null },
            { "expiresAt": { "$exists": false } },
            { "expiresAt": { "$lte": now } },
            { "subscriberId": subscriber_id },
        ],
    };

    // Pipeline update: the version only increments when ownership changes
    // subscribers, and starts at 0 on the initial upsert.
    let update = UpdateModifications::Pipeline(vec![doc! {
        "$set": {
            "subscriberId": subscriber_id,
            "expiresAt": expires_at,
            "version": {
                "$cond": {
                    "if": { "$ne": ["$subscriberId", subscriber_id] },
                    "then": { "$ifNull": [{ "$add": ["$version", 1] }, 0] },
                    "else": "$version",
                }
            },
        }
    }]);

    let options = FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::After)
        .projection(doc! { "version": 1 })
        .build();

    match leases.find_one_and_update(filter, update, options).await {
        Ok(Some(document)) => Ok(lease_version(&document)),
        Ok(None) => Ok(None),
        // A losing upsert collides with the winner on _id.
        Err(err) if is_duplicate_key(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Extends the lease iff `subscriber_id` still owns it. Returns false when
/// the lease was lost.
pub async fn refresh(
    leases: &Collection<Document>,
    subscription_id: &str,
    subscriber_id: &str,
    lease_duration: Duration,
) -> Result<bool, mongodb::error::Error> {
    let now = bson::DateTime::now();
    let expires_at =
        bson::DateTime::from_millis(now.timestamp_millis() + lease_duration.as_millis() as i64);

    let result = leases
        .update_one(
            doc! { "_id": subscription_id, "subscriberId": subscriber_id },
            doc! { "$set": { "expiresAt": expires_at } },
            None,
        )
        .await?;

    Ok(result.matched_count > 0)
}

/// Deletes the lease iff `subscriber_id` owns it.
pub async fn release(
    leases: &Collection<Document>,
    subscription_id: &str,
    subscriber_id: &str,
) -> Result<(), mongodb::error::Error> {
    leases
        .delete_one(
            doc! { "_id": subscription_id, "subscriberId": subscriber_id },
            None,
        )
        .await?;

    Ok(())
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Held { version: u64 },
    NotHeld,
}

/// [CompetingConsumerStrategy] backed by MongoDB leases.
pub struct MongoLeaseStrategy {
    leases: Collection<Document>,
    config: LeaseConfig,
    statuses: Arc<std::sync::Mutex<HashMap<(String, String), LeaseStatus>>>,
    changes_tx: broadcast::Sender<ConsumeChange>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MongoLeaseStrategy {
    /// Creates the strategy and starts its background refresh ticker.
    pub fn new(client: &Client, database: &str, config: LeaseConfig) -> Arc<Self> {
        let leases = client.database(database).collection(&config.collection);
        let (changes_tx, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);

        let interval = config.refresh_interval.unwrap_or(config.lease_duration / 2);

        let strategy = Arc::new(Self {
            leases,
            config,
            statuses: Arc::default(),
            changes_tx,
            ticker: std::sync::Mutex::new(None),
        });

        let ticker_strategy = Arc::downgrade(&strategy);
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                let Some(strategy) = ticker_strategy.upgrade() else {
                    return;
                };
                strategy.refresh_or_acquire_all().await;
            }
        });

        *strategy
            .ticker
            .lock()
            .expect("acquire lock on ticker handle") = Some(ticker);

        strategy
    }

    pub fn with_defaults(client: &Client, database: &str) -> Arc<Self> {
        Self::new(client, database, LeaseConfig::default())
    }

    fn apply_status(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
        acquired: Option<u64>,
    ) -> bool {
        let key = (subscription_id.to_owned(), subscriber_id.to_owned());
        let mut statuses = self
            .statuses
            .lock()
            .expect("acquire lock on lease statuses");

        // Unregistered in the meantime: do not resurrect the entry.
        if !statuses.contains_key(&key) && acquired.is_none() {
            return false;
        }

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

    async fn refresh_or_acquire_all(&self) {
        let registered: Vec<((String, String), LeaseStatus)> = {
            self.statuses
                .lock()
                .expect("acquire lock on lease statuses")
                .iter()
                .map(|(key, status)| (key.clone(), *status))
                .collect()
        };

        for ((subscription_id, subscriber_id), status) in registered {
            match status {
                LeaseStatus::Held { .. } => {
                    match refresh(
                        &self.leases,
                        &subscription_id,
                        &subscriber_id,
                        self.config.lease_duration,
                    )
                    .await
                    {
                        Ok(true) => {},
                        Ok(false) => {
                            tracing::debug!(
                                subscription.id = %subscription_id,
                                subscriber.id = %subscriber_id,
                                "lease lost"
                            );
                            self.apply_status(&subscription_id, &subscriber_id, None);
                        },
                        Err(error) => {
                            tracing::warn!(
                                subscription.id = %subscription_id,
                                %error,
                                "failed to refresh lease, keeping current state until the next tick"
                            );
                        },
                    }
                },
                LeaseStatus::NotHeld => {
                    match acquire_or_refresh(
                        &self.leases,
                        &subscription_id,
                        &subscriber_id,
                        self.config.lease_duration,
                    )
                    .await
                    {
                        Ok(acquired) => {
                            self.apply_status(&subscription_id, &subscriber_id, acquired);
                        },
                        Err(error) => {
                            tracing::warn!(
                                subscription.id = %subscription_id,
                                %error,
                                "failed to attempt lease acquisition"
                            );
                        },
                    }
                },
            }
        }
    }
}

impl FencingTokenSource for MongoLeaseStrategy {
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
impl CompetingConsumerStrategy for MongoLeaseStrategy {
    async fn register(
        &self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> Result<bool, anyhow::Error> {
        // The acquire outcome is computed without holding the status lock.
        let acquired = acquire_or_refresh(
            &self.leases,
            subscription_id,
            subscriber_id,
            self.config.lease_duration,
        )
        .await?;

        self.statuses
            .lock()
            .expect("acquire lock on lease statuses")
            .entry((subscription_id.to_owned(), subscriber_id.to_owned()))
            .or_insert(LeaseStatus::NotHeld);

        Ok(self.apply_status(subscription_id, subscriber_id, acquired))
    }

    async fn unregister(&self, subscription_id: &str, subscriber_id: &str) {
        let key = (subscription_id.to_owned(), subscriber_id.to_owned());
        let held = {
            let mut statuses = self
                .statuses
                .lock()
                .expect("acquire lock on lease statuses");
            matches!(statuses.remove(&key), Some(LeaseStatus::Held { .. }))
        };

        if held {
            if let Err(error) = release(&self.leases, subscription_id, subscriber_id).await {
                tracing::warn!(
                    subscription.id = %subscription_id,
                    %error,
                    "failed to release lease on unregister, it will expire on its own"
                );
            }
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

impl Drop for MongoLeaseStrategy {
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
