use std::sync::Arc;
use std::time::Duration;

use occurrent::retry::RetryPolicy;
use occurrent::store::StreamAppender;
use occurrent::subscription::durable::DurableSubscriptionModel;
use occurrent::subscription::{
    PositionAware, StartAt, SubscriptionLifecycle, SubscriptionModel, SubscriptionPosition,
};
use occurrent::version::WriteCondition;
use occurrent_mongodb::{
    EventStoreConfig, MongoEventStore, MongoPositionStorage, MongoSubscriptionModel,
    StreamConsistencyGuarantee, SubscriptionConfig, TimeRepresentation,
};

mod setup;

struct Fixture {
    store: MongoEventStore,
    model: Arc<MongoSubscriptionModel>,
}

async fn fixture() -> Fixture {
    let client = setup::connect().await;
    let collection = setup::random_id("events");

    let store = MongoEventStore::new(
        client.clone(),
        setup::DATABASE,
        EventStoreConfig {
            event_collection: collection.clone(),
            time_representation: TimeRepresentation::Rfc3339String,
            consistency: StreamConsistencyGuarantee::IndexOnly,
        },
    )
    .await
    .expect("the event store should initialize");

    let model = Arc::new(MongoSubscriptionModel::new(
        &client,
        setup::DATABASE,
        SubscriptionConfig {
            event_collection: collection,
            time_representation: TimeRepresentation::Rfc3339String,
            retry: RetryPolicy::fixed(Duration::from_millis(100)),
            restart_backoff: Duration::from_millis(200),
        },
    ));

    Fixture { store, model }
}

#[tokio::test]
async fn subscribing_from_now_delivers_new_events_with_resume_tokens() {
    let Fixture { store, model } = fixture().await;
    let collector = setup::Collector::default();
    let stream_id = setup::random_id("stream");

    model
        .subscribe("sub", None, StartAt::Now, collector.consumer())
        .await
        .unwrap();

    // Give the change stream a moment to open before writing.
    tokio::time::sleep(Duration::from_millis(500)).await;

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("event"))],
        )
        .await
        .unwrap();

    let received = collector.wait_for(1).await;
    assert_eq!(received[0].event.stream_id(), Some(stream_id.as_str()));
    assert!(matches!(received[0].position, SubscriptionPosition::Token(_)));

    model.shutdown().await;
}

#[tokio::test]
async fn filters_are_pushed_to_the_change_stream() {
    let Fixture { store, model } = fixture().await;
    let collector = setup::Collector::default();
    let interesting = setup::random_id("interesting");
    let boring = setup::random_id("boring");

    model
        .subscribe(
            "sub",
            Some(occurrent::filter::Filter::stream_id(&interesting)),
            StartAt::Now,
            collector.consumer(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    store
        .append(
            &boring,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("skipped"))],
        )
        .await
        .unwrap();
    store
        .append(
            &interesting,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("delivered"))],
        )
        .await
        .unwrap();

    let received = collector.wait_for(1).await;
    assert_eq!(received[0].event.stream_id(), Some(interesting.as_str()));
    assert_eq!(received.len(), 1);

    model.shutdown().await;
}

#[tokio::test]
async fn resuming_from_a_token_skips_already_seen_events() {
    let Fixture { store, model } = fixture().await;
    let collector = setup::Collector::default();
    let stream_id = setup::random_id("stream");

    model
        .subscribe("sub", None, StartAt::Now, collector.consumer())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("first"))],
        )
        .await
        .unwrap();
    let received = collector.wait_for(1).await;
    let position = received[0].position.clone();

    model.cancel("sub").await.unwrap();

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("second"))],
        )
        .await
        .unwrap();

    let resumed = setup::Collector::default();
    model
        .subscribe("sub", None, StartAt::Position(position), resumed.consumer())
        .await
        .unwrap();

    let received = resumed.wait_for(1).await;
    assert_eq!(received.len(), 1);
    assert_ne!(received[0].event.id, collector.received()[0].event.id);

    model.shutdown().await;
}

#[tokio::test]
async fn pause_and_resume_preserve_the_subscription() {
    let Fixture { store, model } = fixture().await;
    let collector = setup::Collector::default();
    let stream_id = setup::random_id("stream");

    model
        .subscribe("sub", None, StartAt::Now, collector.consumer())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(model.is_running("sub").await);

    model.pause("sub").await.unwrap();
    assert!(model.is_paused("sub").await);

    model.resume("sub").await.unwrap();
    assert!(model.is_running("sub").await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("after-resume"))],
        )
        .await
        .unwrap();

    collector.wait_for(1).await;

    model.shutdown().await;
}

#[tokio::test]
async fn global_position_does_not_replay_earlier_events() {
    let Fixture { store, model } = fixture().await;
    let collector = setup::Collector::default();
    let stream_id = setup::random_id("stream");

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("before"))],
        )
        .await
        .unwrap();

    let position = model.global_position().await.unwrap();

    model
        .subscribe("sub", None, StartAt::Position(position), collector.consumer())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let after = setup::random_id("after");
    store
        .append(&stream_id, WriteCondition::Any, vec![setup::test_event(&after)])
        .await
        .unwrap();

    let received = collector.wait_for(1).await;
    assert_eq!(received[0].event.id, after);
    assert_eq!(received.len(), 1);

    model.shutdown().await;
}

#[tokio::test]
async fn durable_subscriptions_persist_their_position() {
    let client = setup::connect().await;
    let Fixture { store, model } = fixture().await;
    let storage = Arc::new(MongoPositionStorage::new(
        &client,
        setup::DATABASE,
        &setup::random_id("positions"),
    ));

    let durable = DurableSubscriptionModel::new(model.clone(), storage.clone());
    let collector = setup::Collector::default();
    let stream_id = setup::random_id("stream");

    durable
        .subscribe_from_stored_position("sub", None, collector.consumer())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    store
        .append(
            &stream_id,
            WriteCondition::Any,
            vec![setup::test_event(&setup::random_id("event"))],
        )
        .await
        .unwrap();

    let received = collector.wait_for(1).await;
    let delivered_position = received[0].position.clone();

    use occurrent::subscription::PositionStorage;
    for _ in 0..100 {
        if storage.read("sub").await.unwrap().as_ref() == Some(&delivered_position) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(storage.read("sub").await.unwrap(), Some(delivered_position));

    // Cancelling removes the stored position.
    durable.cancel("sub").await.unwrap();
    assert_eq!(storage.read("sub").await.unwrap(), None);
}
