//! Worker runs end to end: drain-once mode, lease release, busy conflict.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use qvarn_client::{Resource, Store};
use qvarnmr::config::EngineSettings;
use qvarnmr::handlers::{item_value, sum_values, value};
use qvarnmr::listeners::{get_or_create_listeners, LISTENERS_TYPE};
use qvarnmr::testing::resource_values;
use qvarnmr::topology::{HandlerSpec, HandlersConfig, Topology};
use qvarnmr::worker::run_with_store;
use simqvarn::SimQvarn;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn obj(v: Value) -> Resource {
    match v {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn sum_config() -> HandlersConfig {
    [
        (
            "mapped".to_string(),
            [(
                "source".to_string(),
                HandlerSpec::map(1, item_value("key", "value")),
            )]
            .into(),
        ),
        (
            "reduced".to_string(),
            [(
                "mapped".to_string(),
                HandlerSpec::reduce_with_map(1, sum_values(), value()),
            )]
            .into(),
        ),
    ]
    .into()
}

fn settings() -> EngineSettings {
    EngineSettings {
        instance: "test".to_string(),
        keep_alive_update_interval: 10.0,
        keep_alive_timeout: 60.0,
    }
}

fn store() -> Arc<dyn Store> {
    let sim = Arc::new(SimQvarn::new());
    sim.add_resource_types(&[
        "source",
        "mapped",
        "reduced",
        "qvarnmr_listeners",
        "qvarnmr_handlers",
    ]);
    sim
}

#[tokio::test]
async fn worker_drains_once_and_releases_its_leases() {
    let store = store();
    // Listeners exist first, so the source writes below queue real
    // notifications for the worker to drain.
    let topology = Topology::new(sum_config()).unwrap();
    drop(
        get_or_create_listeners(store.as_ref(), "test", &topology)
            .await
            .unwrap(),
    );
    for value in [1, 2, 3] {
        store
            .create("source", obj(json!({"key": 1, "value": value})))
            .await
            .unwrap();
    }

    let code = run_with_store(Arc::clone(&store), topology, &settings(), false)
        .await
        .unwrap();
    assert_eq!(code, 0);

    // The backlog was processed through both stages.
    assert_eq!(
        resource_values(store.as_ref(), "reduced", &["_mr_key", "_mr_value"])
            .await
            .unwrap(),
        vec![vec![json!(1), json!(6)]]
    );

    // Every lease was released on exit, ready for the next worker.
    let lease_ids = store.get_list(LISTENERS_TYPE).await.unwrap();
    assert!(!lease_ids.is_empty());
    for id in lease_ids {
        let lease = store.get(LISTENERS_TYPE, &id).await.unwrap();
        assert!(lease["owner"].is_null());
    }
}

#[tokio::test]
async fn worker_exits_with_code_one_when_another_worker_is_live() {
    let store = store();
    store
        .create("source", obj(json!({"key": 1, "value": 1})))
        .await
        .unwrap();

    // Another worker holds a fresh lease on our source types.
    let topology = Topology::new(sum_config()).unwrap();
    let listeners = get_or_create_listeners(store.as_ref(), "test", &topology)
        .await
        .unwrap();
    for listener in &listeners {
        let id = listener.state["id"].as_str().unwrap();
        let mut payload = store.get(LISTENERS_TYPE, id).await.unwrap();
        payload.insert("owner".to_string(), json!("otherhost/4242"));
        payload.insert(
            "timestamp".to_string(),
            json!(Utc::now().format(DATETIME_FORMAT).to_string()),
        );
        store.update(LISTENERS_TYPE, id, payload).await.unwrap();
    }

    let code = run_with_store(Arc::clone(&store), topology, &settings(), false)
        .await
        .unwrap();
    assert_eq!(code, 1);

    // Nothing was processed and the foreign lease was left untouched.
    assert!(store.get_list("mapped").await.unwrap().is_empty());
    for id in store.get_list(LISTENERS_TYPE).await.unwrap() {
        let lease = store.get(LISTENERS_TYPE, &id).await.unwrap();
        assert_eq!(lease["owner"], json!("otherhost/4242"));
    }
}

#[tokio::test]
async fn worker_resyncs_new_handlers_on_first_run() {
    let store = store();
    // Sources that existed before the engine was ever deployed: no
    // notifications are pending for them once the listener is created,
    // so only the automatic resync can pick them up.
    for value in [2, 3] {
        store
            .create("source", obj(json!({"key": 7, "value": value})))
            .await
            .unwrap();
    }

    let topology = Topology::new(sum_config()).unwrap();
    drop(
        get_or_create_listeners(store.as_ref(), "test", &topology)
            .await
            .unwrap(),
    );
    let pre_existing: Vec<String> = store.get_list("source").await.unwrap();
    assert_eq!(pre_existing.len(), 2);

    let code = run_with_store(Arc::clone(&store), topology, &settings(), false)
        .await
        .unwrap();
    assert_eq!(code, 0);

    assert_eq!(
        resource_values(store.as_ref(), "reduced", &["_mr_key", "_mr_value"])
            .await
            .unwrap(),
        vec![vec![json!(7), json!(5)]]
    );
}
