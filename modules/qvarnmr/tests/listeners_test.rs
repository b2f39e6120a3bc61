//! Listener lease lifecycle: creation, keep-alive, conflict, takeover,
//! release.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use qvarn_client::{SearchQuery, Store};
use qvarnmr::error::Error;
use qvarnmr::handlers::item;
use qvarnmr::listeners::{
    check_and_update_listeners_state, clear_listener_owners, get_or_create_listeners,
    worker_signature, Listener, LISTENERS_TYPE,
};
use qvarnmr::topology::{HandlerSpec, HandlersConfig, Topology};
use simqvarn::SimQvarn;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn simple_config() -> HandlersConfig {
    [(
        "mapped".to_string(),
        [("source".to_string(), HandlerSpec::map(1, item("id")))].into(),
    )]
    .into()
}

async fn setup() -> (Arc<dyn Store>, Topology, Vec<Listener>) {
    let sim = Arc::new(SimQvarn::new());
    sim.add_resource_types(&["source", "mapped", "qvarnmr_listeners"]);
    let store: Arc<dyn Store> = sim;
    let topology = Topology::new(simple_config()).expect("valid topology");
    let listeners = get_or_create_listeners(store.as_ref(), "test", &topology)
        .await
        .expect("listeners");
    (store, topology, listeners)
}

/// Overwrite the lease record of the first listener.
async fn set_state(store: &dyn Store, listener: &Listener, owner: Value, timestamp: Value) {
    let id = listener.state["id"].as_str().expect("state id");
    let mut payload = store.get(LISTENERS_TYPE, id).await.expect("state");
    payload.insert("owner".to_string(), owner);
    payload.insert("timestamp".to_string(), timestamp);
    store
        .update(LISTENERS_TYPE, id, payload)
        .await
        .expect("update state");
}

/// Re-read the listeners so their in-memory state matches the store.
async fn reload(store: &dyn Store, listeners: &[Listener]) -> Vec<Listener> {
    let mut reloaded = Vec::new();
    for listener in listeners {
        let id = listener.state["id"].as_str().expect("state id");
        let state = store.get(LISTENERS_TYPE, id).await.expect("state");
        reloaded.push(Listener {
            state,
            ..listener.clone()
        });
    }
    reloaded
}

fn timestamp_value(age: Duration) -> Value {
    Value::String((Utc::now() - age).format(DATETIME_FORMAT).to_string())
}

#[tokio::test]
async fn listeners_are_created_once_per_source_type() {
    let (store, topology, listeners) = setup().await;
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0].source_resource_type, "source");

    // A second call reuses the same listener and state records.
    let again = get_or_create_listeners(store.as_ref(), "test", &topology)
        .await
        .unwrap();
    assert_eq!(
        again[0].listener["id"].as_str(),
        listeners[0].listener["id"].as_str()
    );
    assert_eq!(store.get_list(LISTENERS_TYPE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn a_fresh_record_is_claimed_immediately() {
    let (store, _topology, listeners) = setup().await;
    // New records have neither owner nor timestamp.
    assert!(listeners[0].owner().is_none());

    let updated = check_and_update_listeners_state(store.as_ref(), &listeners, 10.0, 60.0)
        .await
        .unwrap();
    assert_eq!(updated[0].owner(), Some(worker_signature().as_str()));
    assert!(updated[0].state["timestamp"].is_string());
}

#[tokio::test]
async fn a_live_foreign_owner_means_busy() {
    let (store, _topology, listeners) = setup().await;
    set_state(
        store.as_ref(),
        &listeners[0],
        json!("otherhost/4242"),
        timestamp_value(Duration::seconds(5)),
    )
    .await;
    let listeners = reload(store.as_ref(), &listeners).await;

    let err = check_and_update_listeners_state(store.as_ref(), &listeners, 10.0, 60.0)
        .await
        .unwrap_err();
    match err {
        Error::Busy { owner } => assert_eq!(owner, "otherhost/4242"),
        other => panic!("expected Busy, got {other}"),
    }
}

#[tokio::test]
async fn a_timed_out_owner_forfeits_the_lease() {
    let (store, _topology, listeners) = setup().await;
    set_state(
        store.as_ref(),
        &listeners[0],
        json!("otherhost/4242"),
        timestamp_value(Duration::seconds(120)),
    )
    .await;
    let listeners = reload(store.as_ref(), &listeners).await;

    let updated = check_and_update_listeners_state(store.as_ref(), &listeners, 10.0, 60.0)
        .await
        .unwrap();
    assert_eq!(updated[0].owner(), Some(worker_signature().as_str()));
}

#[tokio::test]
async fn a_stale_in_memory_record_is_reread_before_takeover() {
    let (store, _topology, listeners) = setup().await;

    // In-memory state looks timed out, but the store says another worker
    // refreshed its stamp meanwhile: we must not steal the lease.
    let mut stale = reload(store.as_ref(), &listeners).await;
    stale[0].state.insert(
        "owner".to_string(),
        json!("otherhost/4242"),
    );
    stale[0]
        .state
        .insert("timestamp".to_string(), timestamp_value(Duration::seconds(120)));
    set_state(
        store.as_ref(),
        &listeners[0],
        json!("otherhost/4242"),
        timestamp_value(Duration::seconds(1)),
    )
    .await;

    let err = check_and_update_listeners_state(store.as_ref(), &stale, 10.0, 60.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Busy { .. }));
}

#[tokio::test]
async fn our_own_fresh_stamp_is_left_alone_within_the_interval() {
    let (store, _topology, listeners) = setup().await;
    let claimed = check_and_update_listeners_state(store.as_ref(), &listeners, 10.0, 60.0)
        .await
        .unwrap();
    let stamp = claimed[0].state["timestamp"].clone();

    // Refreshing right away changes nothing: the stamp is younger than
    // the update interval.
    let refreshed = check_and_update_listeners_state(store.as_ref(), &claimed, 10.0, 60.0)
        .await
        .unwrap();
    assert_eq!(refreshed[0].state["timestamp"], stamp);
}

#[tokio::test]
async fn clearing_owners_releases_the_lease() {
    let (store, _topology, listeners) = setup().await;
    let claimed = check_and_update_listeners_state(store.as_ref(), &listeners, 10.0, 60.0)
        .await
        .unwrap();
    assert!(claimed[0].owner().is_some());

    let cleared = clear_listener_owners(store.as_ref(), &claimed).await.unwrap();
    assert!(cleared[0].owner().is_none());

    // The store record agrees, so another worker could start immediately.
    let state = store
        .search_one(
            LISTENERS_TYPE,
            SearchQuery::new()
                .exact("instance", "test")
                .exact("resource_type", "source")
                .show_all(),
        )
        .await
        .unwrap();
    assert!(state["owner"].is_null());
}

#[tokio::test]
async fn listener_records_are_scoped_by_instance() {
    let sim = Arc::new(SimQvarn::new());
    sim.add_resource_types(&["source", "mapped", "qvarnmr_listeners"]);
    let store: Arc<dyn Store> = sim;
    let topology = Topology::new(simple_config()).unwrap();

    get_or_create_listeners(store.as_ref(), "alpha", &topology)
        .await
        .unwrap();
    get_or_create_listeners(store.as_ref(), "beta", &topology)
        .await
        .unwrap();

    // One lease record per (instance, source type).
    assert_eq!(store.get_list(LISTENERS_TYPE).await.unwrap().len(), 2);
}
