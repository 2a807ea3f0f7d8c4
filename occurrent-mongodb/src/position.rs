//! Durable subscription positions in a MongoDB collection.
//!
//! One document per subscription: `{_id, token | time, leaseVersion?}`.
//! `leaseVersion` is the fencing token of the competing consumer that wrote
//! the position; a write carrying an older token than the stored one is
//! rejected, so a consumer whose lease was taken over cannot corrupt the
//! position persisted by the new leader.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::options::UpdateOptions;
use mongodb::{Client, Collection};

use occurrent::subscription::{PositionStorage, PositionStorageError, SubscriptionPosition};

const TOKEN_FIELD: &str = "token";
const TIME_FIELD: &str = "time";
const LEASE_VERSION_FIELD: &str = "leaseVersion";

pub const DEFAULT_POSITION_COLLECTION: &str = "subscription-positions";

/// [PositionStorage] persisting positions to MongoDB.
#[derive(Debug, Clone)]
pub struct MongoPositionStorage {
    positions: Collection<Document>,
}

impl MongoPositionStorage {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            positions: client.database(database).collection(collection),
        }
    }

    pub fn with_defaults(client: &Client, database: &str) -> Self {
        Self::new(client, database, DEFAULT_POSITION_COLLECTION)
    }

    fn position_fields(position: &SubscriptionPosition) -> (Document, &'static str) {
        match position {
            SubscriptionPosition::Token(token) => {
                (doc! { TOKEN_FIELD: token }, TIME_FIELD)
            },
            SubscriptionPosition::Time(time) => (
                doc! { TIME_FIELD: Bson::DateTime(bson::DateTime::from_millis(time.timestamp_millis())) },
                TOKEN_FIELD,
            ),
        }
    }
}

fn backend_error(err: mongodb::error::Error) -> PositionStorageError {
    PositionStorageError::Backend(anyhow::Error::new(err))
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};

    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000
    )
}

#[async_trait]
impl PositionStorage for MongoPositionStorage {
    async fn read(
        &self,
        subscription_id: &str,
    ) -> Result<Option<SubscriptionPosition>, PositionStorageError> {
        let found = self
            .positions
            .find_one(doc! { "_id": subscription_id }, None)
            .await
            .map_err(backend_error)?;

        let Some(document) = found else {
            return Ok(None);
        };

        if let Ok(token) = document.get_str(TOKEN_FIELD) {
            return Ok(Some(SubscriptionPosition::Token(token.to_owned())));
        }
        if let Ok(time) = document.get_datetime(TIME_FIELD) {
            return Ok(Some(SubscriptionPosition::Time(time.to_chrono())));
        }

        Err(PositionStorageError::Backend(anyhow::anyhow!(
            "position document for subscription '{}' carries neither a token nor a time",
            subscription_id
        )))
    }

    async fn save(
        &self,
        subscription_id: &str,
        position: &SubscriptionPosition,
        fencing: Option<u64>,
    ) -> Result<(), PositionStorageError> {
        let (mut fields, stale_field) = Self::position_fields(position);

        match fencing {
            None => {
                self.positions
                    .update_one(
                        doc! { "_id": subscription_id },
                        doc! { "$set": fields, "$unset": { stale_field: "" } },
                        UpdateOptions::builder().upsert(true).build(),
                    )
                    .await
                    .map_err(backend_error)?;
                Ok(())
            },
            Some(version) => {
                fields.insert(LEASE_VERSION_FIELD, version as i64);

                // Matching on the stored lease version makes stale writers
                // collide with the _id on the upsert path and fail.
                let result = self
                    .positions
                    .update_one(
                        doc! {
                            "_id": subscription_id,
                            "$or": [
                                { LEASE_VERSION_FIELD: { "$exists": false } },
                                { LEASE_VERSION_FIELD: { "$lte": version as i64 } },
                            ],
                        },
                        doc! { "$set": fields, "$unset": { stale_field: "" } },
                        UpdateOptions::builder().upsert(true).build(),
                    )
                    .await;

                match result {
                    Ok(_) => Ok(()),
                    Err(err) if is_duplicate_key(&err) => {
                        Err(PositionStorageError::StaleLease {
                            subscription_id: subscription_id.to_owned(),
                            attempted: version,
                        })
                    },
                    Err(err) => Err(backend_error(err)),
                }
            },
        }
    }

    async fn delete(&self, subscription_id: &str) -> Result<(), PositionStorageError> {
        self.positions
            .delete_one(doc! { "_id": subscription_id }, None)
            .await
            .map_err(backend_error)?;

        Ok(())
    }
}
