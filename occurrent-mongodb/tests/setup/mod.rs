use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mongodb::Client;
use rand::Rng;

use occurrent::event::CloudEvent;
use occurrent::subscription::{consumer_fn, EventConsumer, PositionedEvent};

pub const DATABASE: &str = "occurrent_tests";

pub async fn connect() -> Client {
    let url = std::env::var("MONGODB_URL").expect("the env var MONGODB_URL is required");

    Client::with_uri_str(&url)
        .await
        .expect("connection to MongoDB should work")
}

pub fn random_id(prefix: &str) -> String {
    format!("{}-{}", prefix, rand::thread_rng().gen::<u64>())
}

pub fn test_event(id: &str) -> CloudEvent {
    CloudEvent::builder()
        .id(id)
        .source("urn:occurrent:test")
        .ty("test.happened")
        .time(Utc::now().fixed_offset())
        .json_data(serde_json::json!({ "name": id }))
        .build()
        .expect("test event should be valid")
}

/// Consumer collecting everything it receives, for assertions.
#[derive(Clone, Default)]
pub struct Collector {
    received: Arc<Mutex<Vec<PositionedEvent>>>,
}

#[allow(dead_code)] // Each integration test binary uses a different subset.
impl Collector {
    pub fn consumer(&self) -> Arc<dyn EventConsumer> {
        let received = self.received.clone();
        consumer_fn(move |event| {
            let received = received.clone();
            async move {
                received.lock().unwrap().push(event);
                Ok(())
            }
        })
    }

    pub fn received(&self) -> Vec<PositionedEvent> {
        self.received.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<PositionedEvent> {
        for _ in 0..300 {
            {
                let received = self.received.lock().unwrap();
                if received.len() >= count {
                    return received.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {} events, got {:?}",
            count,
            self.received.lock().unwrap()
        );
    }
}
