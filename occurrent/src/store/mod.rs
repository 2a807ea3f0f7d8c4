//! The event store: append-only persistence of CloudEvents in streams.
//!
//! The store surface is split in small traits the way consumers use it:
//! [StreamReader] for per-stream reads, [StreamAppender] for conditional
//! appends, [EventQueries] for cross-stream queries and maintenance. The
//! [EventStore] alias pulls the first two together.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::version::{StreamVersion, WriteCondition, WriteConditionNotFulfilled};

pub mod inmemory;

pub use inmemory::InMemoryEventStore;

/// A lazy sequence of events, backed by a store cursor.
///
/// Dropping the stream closes the cursor; callers that stop early (cancel,
/// shutdown) release backend resources deterministically.
pub type EventCursor<'a> = BoxStream<'a, Result<CloudEvent, StoreError>>;

/// The result of reading one event stream.
pub struct EventStream<'a> {
    /// The stream id that was read.
    pub id: String,

    /// The stream's current version: the highest `streamversion` in the
    /// stream, or 0 if the stream does not exist.
    pub version: StreamVersion,

    /// The events, in ascending `streamversion` order.
    pub events: EventCursor<'a>,
}

/// Slice selection for [`StreamReader::read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadRange {
    pub skip: u64,
    pub limit: Option<u64>,
}

impl ReadRange {
    /// The whole stream.
    pub fn all() -> Self {
        ReadRange::default()
    }

    pub fn new(skip: u64, limit: u64) -> Self {
        ReadRange {
            skip,
            limit: Some(limit),
        }
    }
}

/// Sort order for [`EventQueries::query`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Ascending global position: the order events were appended across all
    /// streams. The default.
    #[default]
    GlobalAsc,
    GlobalDesc,
    /// Ascending event time, ties broken by stream version. Used by catch-up
    /// subscriptions.
    TimeAsc,
    TimeDesc,
}

/// Pagination and ordering for [`EventQueries::query`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub skip: u64,
    pub limit: Option<u64>,
    pub sort: SortBy,
}

impl QueryOptions {
    pub fn sorted_by(sort: SortBy) -> Self {
        QueryOptions {
            sort,
            ..QueryOptions::default()
        }
    }

    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Error returned by read and query operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to decode persisted event: {0}")]
    Decode(#[source] anyhow::Error),

    #[error("transient backend failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("backend failure: {0}")]
    Internal(#[source] anyhow::Error),
}

/// Error returned by [`StreamAppender::append`].
///
/// Implemented by hand rather than via `#[derive(thiserror::Error)]`: the
/// `DuplicateEvent` variant has a field literally named `source` (the
/// CloudEvents `source` attribute, not an error cause), which thiserror's
/// derive always treats as the error's source regardless of type.
#[derive(Debug)]
pub enum AppendError {
    /// The write condition did not hold against the current stream version.
    /// Recoverable by re-reading the stream and retrying at a higher layer.
    Conflict(WriteConditionNotFulfilled),

    /// An event with the same `(id, source)` already exists.
    DuplicateEvent { id: String, source: String },

    InvalidArgument(String),

    Transient(anyhow::Error),

    Internal(anyhow::Error),
}

impl std::fmt::Display for AppendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppendError::Conflict(source) => std::fmt::Display::fmt(source, f),
            AppendError::DuplicateEvent { id, source } => write!(
                f,
                "duplicate cloud event detected, id: {id}, source: {source}"
            ),
            AppendError::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            AppendError::Transient(source) => write!(f, "transient backend failure: {source}"),
            AppendError::Internal(source) => write!(f, "backend failure: {source}"),
        }
    }
}

impl std::error::Error for AppendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppendError::Conflict(source) => Some(source),
            AppendError::DuplicateEvent { .. } | AppendError::InvalidArgument(_) => None,
            AppendError::Transient(source) | AppendError::Internal(source) => {
                Some(source.as_ref())
            },
        }
    }
}

impl From<WriteConditionNotFulfilled> for AppendError {
    fn from(source: WriteConditionNotFulfilled) -> Self {
        AppendError::Conflict(source)
    }
}

/// Reads performed while evaluating an append surface their failures with
/// append semantics.
impl From<StoreError> for AppendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidArgument(message) => AppendError::InvalidArgument(message),
            StoreError::Transient(source) => AppendError::Transient(source),
            StoreError::Decode(source) | StoreError::Internal(source) => {
                AppendError::Internal(source)
            },
        }
    }
}

/// Error returned by [`EventQueries::update_event`].
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The transformation changed the event's identity or stream placement
    /// (`id`, `source`, `streamid` or `streamversion`).
    #[error("event transformation must not change {0}")]
    IdentityChanged(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reads event streams back from the store.
#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Reads the stream with the given id. A stream that does not exist
    /// yields `version == 0` and no events.
    async fn read(&self, stream_id: &str, range: ReadRange) -> Result<EventStream<'static>, StoreError>;

    /// Whether any event belongs to the given stream.
    async fn exists(&self, stream_id: &str) -> Result<bool, StoreError>;
}

/// Appends new events to an event stream.
#[async_trait]
pub trait StreamAppender: Send + Sync {
    /// Appends `events` to the stream iff `condition` holds against its
    /// current version, assigning versions `current+1..=current+N`
    /// atomically. Returns the new stream version.
    async fn append(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<StreamVersion, AppendError>;
}

/// Cross-stream queries and event maintenance.
#[async_trait]
pub trait EventQueries: Send + Sync {
    /// All events matching `filter`, lazily. Default sort is ascending
    /// global position.
    async fn query(&self, filter: Filter, options: QueryOptions) -> Result<EventCursor<'static>, StoreError>;

    /// Number of events matching `filter`.
    async fn count(&self, filter: Filter) -> Result<u64, StoreError>;

    /// Deletes every event matching `filter`. Surviving events keep their
    /// `streamversion`, so deleting from the middle of a stream leaves
    /// visible gaps; nothing is renumbered.
    async fn delete(&self, filter: Filter) -> Result<u64, StoreError>;

    /// Deletes all events of the given stream. A subsequent `read` returns
    /// version 0 and a subsequent append restarts at version 1.
    async fn delete_stream(&self, stream_id: &str) -> Result<(), StoreError>;

    /// Deletes the single event identified by `(id, source)`.
    async fn delete_event(&self, id: &str, source: &str) -> Result<(), StoreError>;

    /// Reads the event identified by `(id, source)`, applies `f` and writes
    /// the result back in place. Returns the updated event, or `None` if no
    /// such event exists.
    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: &(dyn Fn(CloudEvent) -> CloudEvent + Send + Sync),
    ) -> Result<Option<CloudEvent>, UpdateError>;
}

/// An event store: something that can both read and append event streams.
pub trait EventStore: StreamReader + StreamAppender {}

impl<T> EventStore for T where T: StreamReader + StreamAppender {}

/// Validates that an event transformation kept the event's identity and
/// stream placement. Store implementations call this in `update_event`.
pub fn check_update_identity(before: &CloudEvent, after: &CloudEvent) -> Result<(), UpdateError> {
    if before.id != after.id {
        return Err(UpdateError::IdentityChanged("id"));
    }
    if before.source != after.source {
        return Err(UpdateError::IdentityChanged("source"));
    }
    if before.stream_id() != after.stream_id() {
        return Err(UpdateError::IdentityChanged("streamid"));
    }
    if before.stream_version() != after.stream_version() {
        return Err(UpdateError::IdentityChanged("streamversion"));
    }
    Ok(())
}
