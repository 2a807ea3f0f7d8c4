//! MongoDB backend for [occurrent]: event store, change-stream driven
//! subscriptions, durable subscription positions and lease-based competing
//! consumer coordination.
//!
//! Events are persisted one document per CloudEvent, each attribute a
//! top-level field, with the `streamid` and `streamversion` extensions
//! written explicitly. New events surface to subscriptions through the
//! collection's change stream, whose resume tokens become the subscription
//! positions.

use std::time::Duration;

pub mod document;
pub mod lease;
pub mod position;
pub mod query;
pub mod store;
pub mod subscription;

pub use document::TimeRepresentation;
pub use lease::{LeaseConfig, MongoLeaseStrategy};
pub use position::MongoPositionStorage;
pub use store::MongoEventStore;
pub use subscription::MongoSubscriptionModel;

/// How the stream version is kept consistent under concurrent appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamConsistencyGuarantee {
    /// No concurrency guarantee: the write condition is evaluated against a
    /// derived version (max `streamversion` in the stream) without any
    /// atomicity. Concurrent conditional writers may both succeed.
    None,

    /// The stream version is tracked in a separate collection and updated in
    /// the same multi-document transaction as the event insert. Requires a
    /// replica set.
    Transactional {
        stream_version_collection: String,
    },

    /// The version is derived from the events and a unique index on
    /// `(streamid, streamversion)` arbitrates concurrent writers: the loser
    /// fails with a duplicate key, translated to a write-condition failure.
    IndexOnly,
}

impl StreamConsistencyGuarantee {
    /// Transactional tracking with the default version collection name.
    pub fn transactional() -> Self {
        StreamConsistencyGuarantee::Transactional {
            stream_version_collection: "stream-versions".to_owned(),
        }
    }
}

/// Configuration of the MongoDB event store.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// Collection holding the event documents.
    pub event_collection: String,

    /// How `time` is persisted. Immutable once the store is constructed:
    /// changing it on an existing collection breaks decoding and time
    /// filters.
    pub time_representation: TimeRepresentation,

    pub consistency: StreamConsistencyGuarantee,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        EventStoreConfig {
            event_collection: "events".to_owned(),
            time_representation: TimeRepresentation::Rfc3339String,
            consistency: StreamConsistencyGuarantee::transactional(),
        }
    }
}

/// Configuration of the change-stream subscription model.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Collection the change stream watches; must match the store's.
    pub event_collection: String,

    pub time_representation: TimeRepresentation,

    /// Retry policy around consumer invocations.
    pub retry: occurrent::retry::RetryPolicy,

    /// Backoff between attempts to re-establish a broken change stream.
    pub restart_backoff: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            event_collection: "events".to_owned(),
            time_representation: TimeRepresentation::Rfc3339String,
            retry: occurrent::retry::RetryPolicy::default(),
            restart_backoff: Duration::from_secs(1),
        }
    }
}
