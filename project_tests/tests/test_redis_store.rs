//! Runs against a live server: `REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use lib_telemetry::models::SubscriberId;
use lib_telemetry::{EphemeralStore, FanoutConfig, FanoutCore, RedisStore};
use project_tests::ScriptedStatusProvider;

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    RedisStore::connect(&url).await.unwrap()
}

fn unique(name: &str) -> String {
    format!("telemetry-test:{}:{}", name, Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[tokio::test]
#[ignore]
async fn test_redis_primitives() {
    let store = store().await;
    store.ping().await.unwrap();

    let marker = unique("marker");
    assert!(store.set_if_absent(&marker, "1", Duration::from_secs(5)).await.unwrap());
    assert!(!store.set_if_absent(&marker, "1", Duration::from_secs(5)).await.unwrap());
    assert!(store.delete(&marker).await.unwrap());
    assert!(store.set_if_absent(&marker, "1", Duration::from_secs(5)).await.unwrap());
    store.delete(&marker).await.unwrap();

    let window = unique("window");
    let periods = [Duration::from_secs(60), Duration::from_secs(300)];
    for token in ["a", "b", "c"] {
        store.append_and_count(&window, token, &periods).await.unwrap();
    }
    assert_eq!(store.count_windows(&window, &periods).await.unwrap(), vec![3, 3]);
    store.delete(&window).await.unwrap();

    let list = unique("list");
    store.push(&list, "x", Duration::from_secs(5)).await.unwrap();
    assert_eq!(store.push(&list, "y", Duration::from_secs(5)).await.unwrap(), 2);
    assert_eq!(store.drain_list(&list).await.unwrap(), vec!["x", "y"]);
    assert!(store.drain_list(&list).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_pipeline_over_redis() {
    let config = FanoutConfig {
        debounce_interval_ms: 200,
        key_prefix: unique("core"),
        ..FanoutConfig::default()
    };
    let core = FanoutCore::new(
        config,
        Arc::new(store().await),
        Arc::new(ScriptedStatusProvider::new()),
    )
    .unwrap();
    let mut client = core.registry.connect(&SubscriberId::from("u1"));

    for value in [1.0, 2.0] {
        let reading = serde_json::from_value(json!({
            "device_id": "d1",
            "subscriber_id": "u1",
            "kind": "sensor",
            "sensor_id": "s1",
            "sensor_type": "temperature",
            "value": value,
        }))
        .unwrap();
        core.ingestor.ingest(reading).await.unwrap();
    }

    let frame = tokio::time::timeout(Duration::from_secs(2), client.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["type"], "batch_update");
    assert_eq!(
        frame["updates"]["sensor_data"]["d1"]["s1"]["data_points"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}
