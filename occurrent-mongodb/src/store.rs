//! MongoDB implementation of the event store.
//!
//! Concurrency control depends on the configured
//! [StreamConsistencyGuarantee]: `Transactional` keeps the stream version in
//! a separate collection updated inside a multi-document transaction,
//! `IndexOnly` derives it from the events and lets a unique index on
//! `(streamid, streamversion)` arbitrate racing writers, `None` derives it
//! with no arbitration at all.

use async_trait::async_trait;
use bson::{doc, Document};
use futures::future::ready;
use futures::{StreamExt, TryStreamExt};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions, InsertManyOptions, UpdateOptions};
use mongodb::{Client, ClientSession, Collection, IndexModel};

use occurrent::event::{CloudEvent, STREAM_ID, STREAM_VERSION};
use occurrent::filter::Filter;
use occurrent::store::{
    check_update_identity, AppendError, EventCursor, EventQueries, EventStream, QueryOptions,
    ReadRange, SortBy, StoreError, StreamAppender, StreamReader, UpdateError,
};
use occurrent::version::{StreamVersion, WriteCondition};

use crate::document::{decode, encode};
use crate::query::to_query;
use crate::{EventStoreConfig, StreamConsistencyGuarantee};

const ID_SOURCE_INDEX: &str = "id_source_unique";
const STREAM_VERSION_INDEX: &str = "streamid_streamversion_unique";

/// Event store persisting CloudEvents to a MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoEventStore {
    client: Client,
    events: Collection<Document>,
    versions: Option<Collection<Document>>,
    config: EventStoreConfig,
}

impl MongoEventStore {
    /// Connects the store to `database`, creating the indexes the configured
    /// consistency guarantee relies on.
    pub async fn new(
        client: Client,
        database: &str,
        config: EventStoreConfig,
    ) -> Result<Self, StoreError> {
        if config.event_collection.is_empty() {
            return Err(StoreError::InvalidArgument(
                "event collection name cannot be empty".to_owned(),
            ));
        }

        let db = client.database(database);
        let events = db.collection::<Document>(&config.event_collection);

        events
            .create_index(
                IndexModel::builder().keys(doc! { STREAM_ID: 1 }).build(),
                None,
            )
            .await
            .map_err(store_error)?;

        // The CloudEvents spec makes (id, source) globally unique.
        events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "id": 1, "source": 1 })
                    .options(
                        IndexOptions::builder()
                            .unique(true)
                            .name(ID_SOURCE_INDEX.to_owned())
                            .build(),
                    )
                    .build(),
                None,
            )
            .await
            .map_err(store_error)?;

        let versions = match &config.consistency {
            StreamConsistencyGuarantee::Transactional {
                stream_version_collection,
            } => {
                if stream_version_collection.is_empty() {
                    return Err(StoreError::InvalidArgument(
                        "stream version collection name cannot be empty".to_owned(),
                    ));
                }
                Some(db.collection::<Document>(stream_version_collection))
            },
            StreamConsistencyGuarantee::IndexOnly => {
                events
                    .create_index(
                        IndexModel::builder()
                            .keys(doc! { STREAM_ID: 1, STREAM_VERSION: 1 })
                            .options(
                                IndexOptions::builder()
                                    .unique(true)
                                    .name(STREAM_VERSION_INDEX.to_owned())
                                    .build(),
                            )
                            .build(),
                        None,
                    )
                    .await
                    .map_err(store_error)?;
                None
            },
            StreamConsistencyGuarantee::None => None,
        };

        Ok(Self {
            client,
            events,
            versions,
            config,
        })
    }

    /// The stream's version according to the tracked-version collection.
    async fn tracked_version(
        &self,
        versions: &Collection<Document>,
        stream_id: &str,
        session: Option<&mut ClientSession>,
    ) -> Result<StreamVersion, StoreError> {
        let found = match session {
            Some(session) => {
                versions
                    .find_one_with_session(doc! { "_id": stream_id }, None, session)
                    .await
            },
            None => versions.find_one(doc! { "_id": stream_id }, None).await,
        }
        .map_err(store_error)?;

        Ok(found
            .and_then(|doc| doc.get_i64("version").ok())
            .map_or(0, |version| version as StreamVersion))
    }

    /// The stream's version derived from the highest `streamversion` found.
    async fn derived_version(&self, stream_id: &str) -> Result<StreamVersion, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { STREAM_VERSION: -1 })
            .projection(doc! { STREAM_VERSION: 1 })
            .build();

        let found = self
            .events
            .find_one(doc! { STREAM_ID: stream_id }, options)
            .await
            .map_err(store_error)?;

        Ok(found
            .and_then(|doc| doc.get_i64(STREAM_VERSION).ok())
            .map_or(0, |version| version as StreamVersion))
    }

    async fn current_version(&self, stream_id: &str) -> Result<StreamVersion, StoreError> {
        match &self.versions {
            Some(versions) => self.tracked_version(versions, stream_id, None).await,
            None => self.derived_version(stream_id).await,
        }
    }

    fn encode_events(
        &self,
        stream_id: &str,
        current: StreamVersion,
        events: Vec<CloudEvent>,
    ) -> Result<Vec<Document>, AppendError> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| {
                if event.id.is_empty() || event.source.is_empty() {
                    return Err(AppendError::InvalidArgument(
                        "cloud event id and source cannot be empty".to_owned(),
                    ));
                }
                let versioned = event.with_stream_identity(stream_id, current + (i as u64) + 1);
                encode(&versioned, self.config.time_representation)
                    .map_err(|err| AppendError::InvalidArgument(err.to_string()))
            })
            .collect()
    }

    async fn append_transactional(
        &self,
        versions: &Collection<Document>,
        stream_id: &str,
        condition: &WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<StreamVersion, AppendError> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(append_error_plain)?;
        session
            .start_transaction(None)
            .await
            .map_err(append_error_plain)?;

        let current = self
            .tracked_version(versions, stream_id, Some(&mut session))
            .await?;

        if !condition.is_fulfilled_by(current) {
            let _ = session.abort_transaction().await;
            return Err(condition.not_fulfilled(current).into());
        }

        if events.is_empty() {
            let _ = session.abort_transaction().await;
            return Ok(current);
        }

        let new_version = current + events.len() as u64;
        let documents = self.encode_events(stream_id, current, events)?;

        // Matching on the current version makes concurrent writers collide
        // on the upsert: the loser aborts with a write conflict or duplicate
        // key and is reported as an unfulfilled write condition.
        let update = versions
            .update_one_with_session(
                doc! { "_id": stream_id, "version": current as i64 },
                doc! { "$set": { "version": new_version as i64 } },
                UpdateOptions::builder().upsert(true).build(),
                &mut session,
            )
            .await;

        if let Err(err) = update {
            let _ = session.abort_transaction().await;
            return Err(self.translate_version_race(err, stream_id, condition).await);
        }

        let inserted = self
            .events
            .insert_many_with_session(
                documents,
                InsertManyOptions::builder().ordered(true).build(),
                &mut session,
            )
            .await;

        if let Err(err) = inserted {
            let _ = session.abort_transaction().await;
            return Err(self.translate_insert_error(err, stream_id, condition).await);
        }

        if let Err(err) = session.commit_transaction().await {
            return Err(self.translate_version_race(err, stream_id, condition).await);
        }

        Ok(new_version)
    }

    async fn append_derived(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<StreamVersion, AppendError> {
        let current = self.derived_version(stream_id).await?;

        if !condition.is_fulfilled_by(current) {
            return Err(condition.not_fulfilled(current).into());
        }

        if events.is_empty() {
            return Ok(current);
        }

        let new_version = current + events.len() as u64;
        let documents = self.encode_events(stream_id, current, events)?;

        if let Err(err) = self
            .events
            .insert_many(documents, InsertManyOptions::builder().ordered(true).build())
            .await
        {
            return Err(self.translate_insert_error(err, stream_id, condition).await);
        }

        Ok(new_version)
    }

    /// Re-reads the current version so a conflict caused by a racing writer
    /// reports the version that beat us.
    async fn conflict_with_fresh_version(
        &self,
        stream_id: &str,
        condition: &WriteCondition,
    ) -> AppendError {
        match self.current_version(stream_id).await {
            Ok(actual) => condition.not_fulfilled(actual).into(),
            Err(err) => AppendError::Internal(anyhow::Error::new(ReadBackError(Box::new(err)))),
        }
    }

    async fn translate_version_race(
        &self,
        err: mongodb::error::Error,
        stream_id: &str,
        condition: &WriteCondition,
    ) -> AppendError {
        if duplicate_key(&err).is_some() || is_write_conflict(&err) {
            return self.conflict_with_fresh_version(stream_id, condition).await;
        }
        append_error_plain(err)
    }

    async fn translate_insert_error(
        &self,
        err: mongodb::error::Error,
        stream_id: &str,
        condition: &WriteCondition,
    ) -> AppendError {
        if let Some(message) = duplicate_key(&err) {
            if message.contains(STREAM_VERSION_INDEX) {
                return self.conflict_with_fresh_version(stream_id, condition).await;
            }
            return duplicate_event_from_message(&message);
        }
        if is_write_conflict(&err) {
            return self.conflict_with_fresh_version(stream_id, condition).await;
        }
        append_error_plain(err)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to read back the stream version after a conflicting write: {0}")]
struct ReadBackError(#[source] Box<StoreError>);

fn is_transient(err: &mongodb::error::Error) -> bool {
    err.contains_label("TransientTransactionError")
        || err.contains_label("UnknownTransactionCommitResult")
        || matches!(&*err.kind, ErrorKind::Io(_) | ErrorKind::ServerSelection { .. })
}

pub(crate) fn store_error(err: mongodb::error::Error) -> StoreError {
    if is_transient(&err) {
        StoreError::Transient(anyhow::Error::new(err))
    } else {
        StoreError::Internal(anyhow::Error::new(err))
    }
}

fn append_error_plain(err: mongodb::error::Error) -> AppendError {
    if is_transient(&err) {
        AppendError::Transient(anyhow::Error::new(err))
    } else {
        AppendError::Internal(anyhow::Error::new(err))
    }
}

/// Returns the duplicate-key error message, if the error is one.
fn duplicate_key(err: &mongodb::error::Error) -> Option<String> {
    const DUPLICATE_KEY: i32 = 11000;

    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY => {
            Some(write_error.message.clone())
        },
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .and_then(|errors| errors.iter().find(|e| e.code == DUPLICATE_KEY))
            .map(|e| e.message.clone()),
        ErrorKind::Command(command_error) if command_error.code == DUPLICATE_KEY => {
            Some(command_error.message.clone())
        },
        _ => None,
    }
}

fn is_write_conflict(err: &mongodb::error::Error) -> bool {
    const WRITE_CONFLICT: i32 = 112;

    matches!(&*err.kind, ErrorKind::Command(command_error) if command_error.code == WRITE_CONFLICT)
}

/// Best-effort extraction of the colliding (id, source) pair from a
/// duplicate-key message such as
/// `... dup key: { id: "x", source: "urn:y" }`.
fn duplicate_event_from_message(message: &str) -> AppendError {
    fn extract(message: &str, key: &str) -> Option<String> {
        let start = message.find(&format!("{}: \"", key))? + key.len() + 3;
        let end = message[start..].find('"')? + start;
        Some(message[start..end].to_owned())
    }

    AppendError::DuplicateEvent {
        id: extract(message, "id").unwrap_or_default(),
        source: extract(message, "source").unwrap_or_default(),
    }
}

fn sort_document(sort: SortBy) -> Option<Document> {
    match sort {
        SortBy::GlobalAsc => None,
        SortBy::GlobalDesc => Some(doc! { "$natural": -1 }),
        // The stored `time` sorts chronologically under both
        // representations: native datetimes, or RFC 3339 strings the mapper
        // normalises to UTC. Catch-up replay relies on this.
        SortBy::TimeAsc => Some(doc! { "time": 1, STREAM_VERSION: 1 }),
        SortBy::TimeDesc => Some(doc! { "time": -1, STREAM_VERSION: -1 }),
    }
}

impl MongoEventStore {
    fn decode_cursor(&self, cursor: mongodb::Cursor<Document>) -> EventCursor<'static> {
        let time_representation = self.config.time_representation;

        cursor
            .map_err(store_error)
            .and_then(move |document| {
                ready(
                    decode(document, time_representation)
                        .map_err(|err| StoreError::Decode(anyhow::Error::new(err))),
                )
            })
            .boxed()
    }
}

#[async_trait]
impl StreamReader for MongoEventStore {
    async fn read(
        &self,
        stream_id: &str,
        range: ReadRange,
    ) -> Result<EventStream<'static>, StoreError> {
        if stream_id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "stream id cannot be empty".to_owned(),
            ));
        }

        let version = self.current_version(stream_id).await?;

        let mut options = FindOptions::builder()
            .sort(doc! { STREAM_VERSION: 1 })
            .build();
        if range.skip > 0 {
            options.skip = Some(range.skip);
        }
        if let Some(limit) = range.limit {
            options.limit = Some(limit as i64);
        }

        let cursor = self
            .events
            .find(doc! { STREAM_ID: stream_id }, options)
            .await
            .map_err(store_error)?;

        Ok(EventStream {
            id: stream_id.to_owned(),
            version,
            events: self.decode_cursor(cursor),
        })
    }

    async fn exists(&self, stream_id: &str) -> Result<bool, StoreError> {
        let options = FindOneOptions::builder()
            .projection(doc! { "_id": 1 })
            .build();

        let found = self
            .events
            .find_one(doc! { STREAM_ID: stream_id }, options)
            .await
            .map_err(store_error)?;

        Ok(found.is_some())
    }
}

#[async_trait]
impl StreamAppender for MongoEventStore {
    async fn append(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<StreamVersion, AppendError> {
        if stream_id.is_empty() {
            return Err(AppendError::InvalidArgument(
                "stream id cannot be empty".to_owned(),
            ));
        }

        match self.versions.clone() {
            Some(versions) => {
                self.append_transactional(&versions, stream_id, &condition, events)
                    .await
            },
            None => self.append_derived(stream_id, &condition, events).await,
        }
    }
}

#[async_trait]
impl EventQueries for MongoEventStore {
    async fn query(
        &self,
        filter: Filter,
        options: QueryOptions,
    ) -> Result<EventCursor<'static>, StoreError> {
        let mut find_options = FindOptions::builder().build();
        find_options.sort = sort_document(options.sort);
        if options.skip > 0 {
            find_options.skip = Some(options.skip);
        }
        if let Some(limit) = options.limit {
            find_options.limit = Some(limit as i64);
        }

        let cursor = self
            .events
            .find(to_query(&filter, self.config.time_representation), find_options)
            .await
            .map_err(store_error)?;

        Ok(self.decode_cursor(cursor))
    }

    async fn count(&self, filter: Filter) -> Result<u64, StoreError> {
        self.events
            .count_documents(to_query(&filter, self.config.time_representation), None)
            .await
            .map_err(store_error)
    }

    async fn delete(&self, filter: Filter) -> Result<u64, StoreError> {
        let result = self
            .events
            .delete_many(to_query(&filter, self.config.time_representation), None)
            .await
            .map_err(store_error)?;

        Ok(result.deleted_count)
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), StoreError> {
        match &self.versions {
            Some(versions) => {
                let mut session = self
                    .client
                    .start_session(None)
                    .await
                    .map_err(store_error)?;
                session.start_transaction(None).await.map_err(store_error)?;

                let result = async {
                    self.events
                        .delete_many_with_session(
                            doc! { STREAM_ID: stream_id },
                            None,
                            &mut session,
                        )
                        .await?;
                    // The tracked version goes too: a later append restarts
                    // the stream at version 1.
                    versions
                        .delete_one_with_session(doc! { "_id": stream_id }, None, &mut session)
                        .await?;
                    Ok::<(), mongodb::error::Error>(())
                }
                .await;

                match result {
                    Ok(()) => session.commit_transaction().await.map_err(store_error),
                    Err(err) => {
                        let _ = session.abort_transaction().await;
                        Err(store_error(err))
                    },
                }
            },
            None => {
                self.events
                    .delete_many(doc! { STREAM_ID: stream_id }, None)
                    .await
                    .map_err(store_error)?;
                Ok(())
            },
        }
    }

    async fn delete_event(&self, id: &str, source: &str) -> Result<(), StoreError> {
        self.events
            .delete_one(doc! { "id": id, "source": source }, None)
            .await
            .map_err(store_error)?;

        Ok(())
    }

    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: &(dyn Fn(CloudEvent) -> CloudEvent + Send + Sync),
    ) -> Result<Option<CloudEvent>, UpdateError> {
        let found = self
            .events
            .find_one(doc! { "id": id, "source": source }, None)
            .await
            .map_err(store_error)?;

        let Some(document) = found else {
            return Ok(None);
        };

        let before = decode(document, self.config.time_representation)
            .map_err(|err| StoreError::Decode(anyhow::Error::new(err)))?;
        let after = f(before.clone());
        check_update_identity(&before, &after)?;

        let replacement = encode(&after, self.config.time_representation)
            .map_err(|err| StoreError::InvalidArgument(err.to_string()))?;

        self.events
            .replace_one(doc! { "id": id, "source": source }, replacement, None)
            .await
            .map_err(store_error)?;

        Ok(Some(after))
    }
}
