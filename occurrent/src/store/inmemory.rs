//! In-memory reference implementation of the event store.
//!
//! Streams are kept in a single append-ordered log guarded by a read-write
//! lock; a write evaluates its condition and appends under the same guard, so
//! the operation is atomic. Every successful append is also published to an
//! internal broadcast bus, which the in-memory subscription model consumes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use crate::event::CloudEvent;
use crate::filter::Filter;
use crate::store::{
    check_update_identity, AppendError, EventCursor, EventQueries, EventStream, QueryOptions,
    ReadRange, SortBy, StoreError, StreamAppender, StreamReader, UpdateError,
};
use crate::version::{StreamVersion, WriteCondition};

const APPEND_BUS_CAPACITY: usize = 256;

/// The position of an event in the store-wide append order, starting at 1.
pub type GlobalPosition = u64;

/// An event together with its global position, as published on the append
/// bus.
#[derive(Debug, Clone)]
pub struct Appended {
    pub position: GlobalPosition,
    pub event: CloudEvent,
}

#[derive(Debug, Default)]
struct Backend {
    log: Vec<Appended>,
    versions: HashMap<String, StreamVersion>,
    last_position: GlobalPosition,
}

/// In-memory [EventStore](crate::store::EventStore) implementation, backed by
/// a thread-safe log.
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    backend: Arc<RwLock<Backend>>,
    append_tx: broadcast::Sender<Appended>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        let (append_tx, _) = broadcast::channel(APPEND_BUS_CAPACITY);

        Self {
            backend: Arc::default(),
            append_tx,
        }
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to events appended from this point on. Each successful
    /// write publishes its events here in global-position order.
    pub fn subscribe_appends(&self) -> broadcast::Receiver<Appended> {
        self.append_tx.subscribe()
    }

    /// The global position of the most recent append, or 0 if the store is
    /// empty. A subscription resumed from this position only observes later
    /// events.
    pub fn head_position(&self) -> GlobalPosition {
        self.backend
            .read()
            .expect("acquire read lock on event store backend")
            .last_position
    }

    /// All surviving events with a global position strictly greater than
    /// `position`, in order.
    pub fn appends_since(&self, position: GlobalPosition) -> Vec<Appended> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        backend
            .log
            .iter()
            .filter(|appended| appended.position > position)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StreamReader for InMemoryEventStore {
    async fn read(&self, stream_id: &str, range: ReadRange) -> Result<EventStream<'static>, StoreError> {
        if stream_id.is_empty() {
            return Err(StoreError::InvalidArgument("stream id cannot be empty".to_owned()));
        }

        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let version = backend.versions.get(stream_id).copied().unwrap_or_default();

        let events: Vec<CloudEvent> = backend
            .log
            .iter()
            .filter(|appended| appended.event.stream_id() == Some(stream_id))
            .map(|appended| appended.event.clone())
            .skip(range.skip as usize)
            .take(range.limit.map_or(usize::MAX, |limit| limit as usize))
            .collect();

        Ok(EventStream {
            id: stream_id.to_owned(),
            version,
            events: stream::iter(events).map(Ok).boxed(),
        })
    }

    async fn exists(&self, stream_id: &str) -> Result<bool, StoreError> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        Ok(backend
            .log
            .iter()
            .any(|appended| appended.event.stream_id() == Some(stream_id)))
    }
}

#[async_trait]
impl StreamAppender for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &str,
        condition: WriteCondition,
        events: Vec<CloudEvent>,
    ) -> Result<StreamVersion, AppendError> {
        if stream_id.is_empty() {
            return Err(AppendError::InvalidArgument("stream id cannot be empty".to_owned()));
        }

        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let current = backend.versions.get(stream_id).copied().unwrap_or_default();

        if !condition.is_fulfilled_by(current) {
            return Err(condition.not_fulfilled(current).into());
        }

        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for event in &events {
            if event.id.is_empty() || event.source.is_empty() {
                return Err(AppendError::InvalidArgument(
                    "cloud event id and source cannot be empty".to_owned(),
                ));
            }
            let exists = backend.log.iter().any(|appended| {
                appended.event.id == event.id && appended.event.source == event.source
            });
            if exists || !seen.insert((event.id.as_str(), event.source.as_str())) {
                return Err(AppendError::DuplicateEvent {
                    id: event.id.clone(),
                    source: event.source.clone(),
                });
            }
        }

        let mut version = current;
        for event in events {
            version += 1;
            backend.last_position += 1;

            let appended = Appended {
                position: backend.last_position,
                event: event.with_stream_identity(stream_id, version),
            };

            backend.log.push(appended.clone());

            // Published under the monitor so bus order equals global order.
            // Send only fails when nobody subscribes, which is fine.
            let _ = self.append_tx.send(appended);
        }

        backend.versions.insert(stream_id.to_owned(), version);

        Ok(version)
    }
}

#[async_trait]
impl EventQueries for InMemoryEventStore {
    async fn query(&self, filter: Filter, options: QueryOptions) -> Result<EventCursor<'static>, StoreError> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        let mut matching: Vec<&Appended> = backend
            .log
            .iter()
            .filter(|appended| filter.matches(&appended.event))
            .collect();

        match options.sort {
            SortBy::GlobalAsc => {},
            SortBy::GlobalDesc => matching.reverse(),
            SortBy::TimeAsc => matching.sort_by_key(|appended| {
                (appended.event.time, appended.event.stream_version())
            }),
            SortBy::TimeDesc => {
                matching.sort_by_key(|appended| {
                    (appended.event.time, appended.event.stream_version())
                });
                matching.reverse();
            },
        }

        let events: Vec<CloudEvent> = matching
            .into_iter()
            .map(|appended| appended.event.clone())
            .skip(options.skip as usize)
            .take(options.limit.map_or(usize::MAX, |limit| limit as usize))
            .collect();

        Ok(stream::iter(events).map(Ok).boxed())
    }

    async fn count(&self, filter: Filter) -> Result<u64, StoreError> {
        let backend = self
            .backend
            .read()
            .expect("acquire read lock on event store backend");

        Ok(backend
            .log
            .iter()
            .filter(|appended| filter.matches(&appended.event))
            .count() as u64)
    }

    async fn delete(&self, filter: Filter) -> Result<u64, StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let before = backend.log.len();
        backend.log.retain(|appended| !filter.matches(&appended.event));

        Ok((before - backend.log.len()) as u64)
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<(), StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        backend
            .log
            .retain(|appended| appended.event.stream_id() != Some(stream_id));

        // Clearing the tracked version makes a subsequent append restart the
        // stream at version 1.
        backend.versions.remove(stream_id);

        Ok(())
    }

    async fn delete_event(&self, id: &str, source: &str) -> Result<(), StoreError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        backend
            .log
            .retain(|appended| !(appended.event.id == id && appended.event.source == source));

        Ok(())
    }

    async fn update_event(
        &self,
        id: &str,
        source: &str,
        f: &(dyn Fn(CloudEvent) -> CloudEvent + Send + Sync),
    ) -> Result<Option<CloudEvent>, UpdateError> {
        let mut backend = self
            .backend
            .write()
            .expect("acquire write lock on event store backend");

        let Some(index) = backend
            .log
            .iter()
            .position(|appended| appended.event.id == id && appended.event.source == source)
        else {
            return Ok(None);
        };

        let before = backend.log[index].event.clone();
        let after = f(before.clone());
        check_update_identity(&before, &after)?;

        backend.log[index].event = after.clone();

        Ok(Some(after))
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;

    use super::*;
    use crate::condition::Condition;
    use crate::event::tests::event;
    use crate::event::CloudEvent;

    fn named_event(id: &str) -> CloudEvent {
        event(id)
    }

    #[tokio::test]
    async fn append_assigns_dense_stream_versions() {
        let store = InMemoryEventStore::new();

        let version = store
            .append(
                "name",
                WriteCondition::Any,
                vec![named_event("1"), named_event("2")],
            )
            .await
            .expect("append should succeed");

        assert_eq!(version, 2);

        let stream = store.read("name", ReadRange::all()).await.unwrap();
        assert_eq!(stream.version, 2);

        let events: Vec<_> = stream.events.try_collect().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stream_id(), Some("name"));
        assert_eq!(events[0].stream_version(), Some(1));
        assert_eq!(events[1].stream_id(), Some("name"));
        assert_eq!(events[1].stream_version(), Some(2));
    }

    #[tokio::test]
    async fn reading_a_missing_stream_yields_version_zero() {
        let store = InMemoryEventStore::new();

        let stream = store.read("nothing-here", ReadRange::all()).await.unwrap();
        assert_eq!(stream.version, 0);

        let events: Vec<_> = stream.events.try_collect().await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unfulfilled_write_condition_reports_expected_and_actual() {
        let store = InMemoryEventStore::new();

        store
            .append("name", WriteCondition::Any, vec![named_event("1")])
            .await
            .unwrap();

        let error = store
            .append(
                "name",
                WriteCondition::stream_version_eq(10),
                vec![named_event("2")],
            )
            .await
            .expect_err("the condition should not hold");

        assert!(error
            .to_string()
            .ends_with("Expected version to be equal to 10 but was 1."));
    }

    #[tokio::test]
    async fn concurrent_conditional_writers_lose_all_but_one() {
        let store = InMemoryEventStore::new();

        let (first, second) = futures::join!(
            store.append("name", WriteCondition::stream_version_eq(0), vec![named_event("1")]),
            store.append("name", WriteCondition::stream_version_eq(0), vec![named_event("2")]),
        );

        match (first, second) {
            (Ok(_), Err(AppendError::Conflict(_))) | (Err(AppendError::Conflict(_)), Ok(_)) => {},
            (first, second) => panic!("unexpected outcome: {:?} / {:?}", first, second),
        }
    }

    #[tokio::test]
    async fn duplicate_id_and_source_is_rejected() {
        let store = InMemoryEventStore::new();

        store
            .append("name", WriteCondition::Any, vec![named_event("1")])
            .await
            .unwrap();

        let error = store
            .append("other", WriteCondition::Any, vec![named_event("1")])
            .await
            .expect_err("the event already exists");

        assert!(matches!(error, AppendError::DuplicateEvent { .. }));
    }

    #[tokio::test]
    async fn delete_by_filter_spares_other_streams_and_leaves_gaps() {
        let store = InMemoryEventStore::new();
        let now = Utc::now().fixed_offset();

        let old = CloudEvent::builder()
            .id("old")
            .source("urn:occurrent:test")
            .ty("test.happened")
            .time(now - Duration::minutes(5))
            .build()
            .unwrap();
        let recent = CloudEvent::builder()
            .id("recent")
            .source("urn:occurrent:test")
            .ty("test.happened")
            .time(now + Duration::minutes(5))
            .build()
            .unwrap();

        store
            .append("name", WriteCondition::Any, vec![old, recent])
            .await
            .unwrap();
        store
            .append("name2", WriteCondition::Any, vec![named_event("other")])
            .await
            .unwrap();

        let cutoff = now + Duration::minutes(1);
        let filter = Filter::stream_id("name").and(Filter::time(Condition::lte(cutoff.into())));
        let deleted = store.delete(filter).await.unwrap();
        assert_eq!(deleted, 1);

        let survivors: Vec<_> = store
            .read("name", ReadRange::all())
            .await
            .unwrap()
            .events
            .try_collect()
            .await
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, "recent");
        // The survivor keeps its original version; the gap stays visible.
        assert_eq!(survivors[0].stream_version(), Some(2));

        let untouched: Vec<_> = store
            .read("name2", ReadRange::all())
            .await
            .unwrap()
            .events
            .try_collect()
            .await
            .unwrap();
        assert_eq!(untouched.len(), 1);
    }

    #[tokio::test]
    async fn delete_stream_resets_versioning() {
        let store = InMemoryEventStore::new();

        store
            .append("name", WriteCondition::Any, vec![named_event("1"), named_event("2")])
            .await
            .unwrap();

        store.delete_stream("name").await.unwrap();

        let stream = store.read("name", ReadRange::all()).await.unwrap();
        assert_eq!(stream.version, 0);
        assert!(!store.exists("name").await.unwrap());

        let version = store
            .append("name", WriteCondition::Any, vec![named_event("3")])
            .await
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn update_event_transforms_in_place() {
        let store = InMemoryEventStore::new();

        store
            .append("name", WriteCondition::Any, vec![named_event("1")])
            .await
            .unwrap();

        let updated = store
            .update_event("1", "urn:occurrent:test", &|mut event| {
                event.subject = Some("redacted".to_owned());
                event
            })
            .await
            .unwrap()
            .expect("the event exists");

        assert_eq!(updated.subject.as_deref(), Some("redacted"));

        let events: Vec<_> = store
            .read("name", ReadRange::all())
            .await
            .unwrap()
            .events
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events[0].subject.as_deref(), Some("redacted"));
    }

    #[tokio::test]
    async fn update_event_rejects_identity_changes() {
        let store = InMemoryEventStore::new();

        store
            .append("name", WriteCondition::Any, vec![named_event("1")])
            .await
            .unwrap();

        let error = store
            .update_event("1", "urn:occurrent:test", &|mut event| {
                event.id = "2".to_owned();
                event
            })
            .await
            .expect_err("changing the id must fail");

        assert!(matches!(error, UpdateError::IdentityChanged("id")));
    }

    #[tokio::test]
    async fn update_event_returns_none_for_missing_events() {
        let store = InMemoryEventStore::new();

        let updated = store
            .update_event("missing", "urn:occurrent:test", &|event| event)
            .await
            .unwrap();

        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn query_agrees_with_the_in_memory_matcher() {
        let store = InMemoryEventStore::new();

        for stream in ["a", "b"] {
            let events = (0..5)
                .map(|i| {
                    CloudEvent::builder()
                        .id(format!("{}-{}", stream, i))
                        .source("urn:occurrent:test")
                        .ty(if i % 2 == 0 { "even.event" } else { "odd.event" })
                        .json_data(serde_json::json!({ "n": i }))
                        .build()
                        .unwrap()
                })
                .collect();
            store.append(stream, WriteCondition::Any, events).await.unwrap();
        }

        let filters = vec![
            Filter::all(),
            Filter::ty("even.event"),
            Filter::stream_id("a"),
            Filter::stream_version(Condition::gte(3u64.into())),
            Filter::attribute("data.n", Condition::not(Condition::eq(2i64.into()))).unwrap(),
            Filter::ty("odd.event").and(Filter::stream_id("b")),
            Filter::attribute(
                "data.n",
                Condition::or(Condition::lt(1i64.into()), Condition::gt(3i64.into()), []),
            )
            .unwrap(),
        ];

        let population = store.appends_since(0);

        for filter in filters {
            let queried: Vec<_> = store
                .query(filter.clone(), QueryOptions::default())
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();

            let expected: Vec<_> = population
                .iter()
                .filter(|appended| filter.matches(&appended.event))
                .map(|appended| appended.event.clone())
                .collect();

            assert_eq!(queried, expected, "filter: {:?}", filter);

            let counted = store.count(filter).await.unwrap();
            assert_eq!(counted, expected.len() as u64);
        }
    }

    #[tokio::test]
    async fn query_sorts_by_time_when_asked() {
        let store = InMemoryEventStore::new();
        let base = Utc::now().fixed_offset();

        // Append out of time order on purpose.
        for (id, offset) in [("late", 60), ("early", -60), ("middle", 0)] {
            let event = CloudEvent::builder()
                .id(id)
                .source("urn:occurrent:test")
                .ty("test.happened")
                .time(base + Duration::seconds(offset))
                .build()
                .unwrap();
            store.append(id, WriteCondition::Any, vec![event]).await.unwrap();
        }

        let sorted: Vec<_> = store
            .query(Filter::all(), QueryOptions::sorted_by(SortBy::TimeAsc))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let ids: Vec<_> = sorted.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn appends_are_published_on_the_bus_in_order() {
        let store = InMemoryEventStore::new();
        let mut rx = store.subscribe_appends();

        store
            .append("name", WriteCondition::Any, vec![named_event("1"), named_event("2")])
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(first.position, 1);
        assert_eq!(first.event.stream_version(), Some(1));
        assert_eq!(second.position, 2);
        assert_eq!(second.event.stream_version(), Some(2));
    }
}
