//! End-to-end map/reduce flows against the in-memory store.

use std::sync::Arc;

use serde_json::{json, Value};

use qvarn_client::{Resource, Store};
use qvarnmr::engine::MapReduceEngine;
use qvarnmr::handlers::{
    item, item_value, join, sum_values, value, JoinMapping, MapFn, MapOutput,
};
use qvarnmr::listeners::{get_or_create_listeners, Listener};
use qvarnmr::notifications::get_changes;
use qvarnmr::testing::{cleaned, process, reduced_by_key, resource_values};
use qvarnmr::topology::{HandlerSpec, HandlersConfig, Topology};
use simqvarn::SimQvarn;

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    sim: Arc<SimQvarn>,
    store: Arc<dyn Store>,
    listeners: Vec<Listener>,
    engine: MapReduceEngine,
}

async fn fixture(resource_types: &[&str], config: HandlersConfig) -> Fixture {
    let sim = Arc::new(SimQvarn::new());
    sim.add_resource_types(resource_types);
    sim.add_resource_types(&["qvarnmr_listeners", "qvarnmr_handlers"]);
    let store: Arc<dyn Store> = sim.clone();
    let topology = Topology::new(config).expect("valid topology");
    let listeners = get_or_create_listeners(store.as_ref(), "test", &topology)
        .await
        .expect("listeners");
    let engine = MapReduceEngine::new(Arc::clone(&store), topology).with_raise_errors(true);
    Fixture {
        sim,
        store,
        listeners,
        engine,
    }
}

fn obj(value: Value) -> Resource {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn config(entries: Vec<(&str, Vec<(&str, HandlerSpec)>)>) -> HandlersConfig {
    entries
        .into_iter()
        .map(|(target, sources)| {
            (
                target.to_string(),
                sources
                    .into_iter()
                    .map(|(source, spec)| (source.to_string(), spec))
                    .collect(),
            )
        })
        .collect()
}

/// The standard sum topology: `source{key,value}` → `mapped` → `reduced`.
fn sum_config() -> HandlersConfig {
    config(vec![
        ("mapped", vec![("source", HandlerSpec::map(1, item_value("key", "value")))]),
        (
            "reduced",
            vec![(
                "mapped",
                HandlerSpec::reduce_with_map(1, sum_values(), value()),
            )],
        ),
    ])
}

async fn create_source(store: &dyn Store, key: i64, val: i64) -> Resource {
    store
        .create("source", obj(json!({"key": key, "value": val})))
        .await
        .expect("create source")
}

fn source_id(doc: &Resource) -> String {
    doc["id"].as_str().expect("id").to_string()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sum_reduce_produces_one_row_per_key() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;
    create_source(fx.store.as_ref(), 1, 1).await;
    create_source(fx.store.as_ref(), 1, 2).await;
    create_source(fx.store.as_ref(), 1, 3).await;

    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    assert_eq!(
        resource_values(fx.store.as_ref(), "reduced", &["_mr_key", "_mr_value"])
            .await
            .unwrap(),
        vec![vec![json!(1), json!(6)]]
    );
    assert_eq!(fx.store.get_list("mapped").await.unwrap().len(), 3);
}

#[tokio::test]
async fn updates_propagate_to_the_reduced_value() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;
    let first = create_source(fx.store.as_ref(), 1, 1).await;
    create_source(fx.store.as_ref(), 1, 2).await;
    let third = create_source(fx.store.as_ref(), 1, 3).await;
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    fx.store
        .update(
            "source",
            &source_id(&first),
            obj(json!({"key": 1, "value": 2})),
        )
        .await
        .unwrap();
    fx.store
        .update(
            "source",
            &source_id(&third),
            obj(json!({"key": 1, "value": 5})),
        )
        .await
        .unwrap();
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    assert_eq!(
        resource_values(fx.store.as_ref(), "reduced", &["_mr_key", "_mr_value"])
            .await
            .unwrap(),
        vec![vec![json!(1), json!(9)]]
    );
}

#[tokio::test]
async fn deletes_propagate_and_tombstones_are_swept() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;
    create_source(fx.store.as_ref(), 1, 1).await;
    create_source(fx.store.as_ref(), 1, 3).await;
    let third = create_source(fx.store.as_ref(), 1, 3).await;
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    fx.store
        .delete("source", &source_id(&third))
        .await
        .unwrap();

    // First round: the source DELETE only tombstones the mapped rows; the
    // reduce has not observed the change yet.
    let changes = get_changes(fx.store.as_ref(), &fx.listeners).await.unwrap();
    fx.engine.process_changes(changes, false).await.unwrap();
    let tombstoned = resource_values(fx.store.as_ref(), "mapped", &["_mr_deleted"])
        .await
        .unwrap();
    assert!(tombstoned.iter().any(|row| row[0] == json!(true)));

    // Draining the tombstone-update notifications completes the cycle:
    // the reduced value shrinks and the marked rows are gone.
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();
    assert_eq!(
        resource_values(fx.store.as_ref(), "reduced", &["_mr_key", "_mr_value"])
            .await
            .unwrap(),
        vec![vec![json!(1), json!(4)]]
    );
    assert_eq!(fx.store.get_list("mapped").await.unwrap().len(), 2);
}

#[tokio::test]
async fn deleting_every_source_removes_the_reduced_row() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;
    let a = create_source(fx.store.as_ref(), 1, 1).await;
    let b = create_source(fx.store.as_ref(), 1, 2).await;
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();
    assert_eq!(fx.store.get_list("reduced").await.unwrap().len(), 1);

    fx.store.delete("source", &source_id(&a)).await.unwrap();
    fx.store.delete("source", &source_id(&b)).await.unwrap();
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    assert!(fx.store.get_list("reduced").await.unwrap().is_empty());
    assert!(fx.store.get_list("mapped").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_reduced_rows_are_reconciled_by_timestamp() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;

    // Two leftover rows for the same key, as after a worker handover race.
    fx.store
        .create(
            "reduced",
            obj(json!({"_mr_key": 1, "_mr_value": 100, "_mr_version": 1, "_mr_timestamp": 100})),
        )
        .await
        .unwrap();
    let newer = fx
        .store
        .create(
            "reduced",
            obj(json!({"_mr_key": 1, "_mr_value": 200, "_mr_version": 1, "_mr_timestamp": 200})),
        )
        .await
        .unwrap();

    create_source(fx.store.as_ref(), 1, 1).await;
    create_source(fx.store.as_ref(), 1, 2).await;
    create_source(fx.store.as_ref(), 1, 3).await;
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    let ids = fx.store.get_list("reduced").await.unwrap();
    assert_eq!(ids.len(), 1);
    // The row with the greater timestamp survived and now carries the
    // current reducer output.
    assert_eq!(ids[0], newer["id"].as_str().unwrap());
    let survivor = fx.store.get("reduced", &ids[0]).await.unwrap();
    assert_eq!(survivor["_mr_value"], json!(6));
}

#[tokio::test]
async fn record_outputs_are_spread_into_the_mapped_row() {
    let handler = MapFn::plain(|resource: &Resource| {
        let product = resource.get("foo").and_then(Value::as_i64).unwrap_or(0)
            * resource.get("bar").and_then(Value::as_i64).unwrap_or(0);
        Ok(MapOutput::from((
            Value::Null,
            json!({"result": product}),
        )))
    });
    let mut fx = fixture(
        &["data", "data__map"],
        config(vec![("data__map", vec![("data", HandlerSpec::map(1, handler))])]),
    )
    .await;

    let data = fx
        .store
        .create("data", obj(json!({"foo": 4, "bar": 4})))
        .await
        .unwrap();
    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    let ids = fx.store.get_list("data__map").await.unwrap();
    assert_eq!(ids.len(), 1);
    let row = fx.store.get("data__map", &ids[0]).await.unwrap();
    assert_eq!(
        Value::Object(cleaned(&row)),
        json!({
            "type": "data__map",
            "result": 16,
            "_mr_key": null,
            "_mr_value": null,
            "_mr_source_id": data["id"],
            "_mr_source_type": "data",
            "_mr_deleted": false,
            "_mr_version": 1,
        })
    );
}

#[tokio::test]
async fn join_merges_source_documents_per_key() {
    let mapping: JoinMapping = [
        (
            "orgs".to_string(),
            [("id".to_string(), Some("org_id".to_string()))].into(),
        ),
        (
            "reports".to_string(),
            [("id".to_string(), Some("report_id".to_string()))].into(),
        ),
    ]
    .into();

    let mut fx = fixture(
        &["orgs", "reports", "company_reports__map", "company_reports"],
        config(vec![
            (
                "company_reports__map",
                vec![
                    ("orgs", HandlerSpec::map(1, item("id"))),
                    ("reports", HandlerSpec::map(1, item("org"))),
                ],
            ),
            (
                "company_reports",
                vec![("company_reports__map", HandlerSpec::reduce(1, join(mapping)))],
            ),
        ]),
    )
    .await;

    let org = fx
        .store
        .create("orgs", obj(json!({"names": ["Orgtra"]})))
        .await
        .unwrap();
    let org_id = org["id"].as_str().unwrap().to_string();
    fx.store
        .create("reports", obj(json!({"org": org_id, "generated_timestamp": "1"})))
        .await
        .unwrap();
    let report2 = fx
        .store
        .create("reports", obj(json!({"org": org_id, "generated_timestamp": "2"})))
        .await
        .unwrap();

    process(fx.store.as_ref(), &fx.listeners, &mut fx.engine)
        .await
        .unwrap();

    assert_eq!(fx.store.get_list("company_reports__map").await.unwrap().len(), 3);
    let reduced = reduced_by_key(fx.store.as_ref(), "company_reports")
        .await
        .unwrap();
    assert_eq!(reduced.len(), 1);
    assert_eq!(
        Value::Object(reduced[&org_id].clone()),
        json!({
            "type": "company_reports",
            "_mr_key": org_id.clone(),
            "_mr_value": null,
            "_mr_version": 1,
            "org_id": org_id.clone(),
            "report_id": report2["id"],
        })
    );
}

#[tokio::test]
async fn processing_no_notifications_is_a_noop() {
    let mut fx = fixture(&["source", "mapped", "reduced"], sum_config()).await;
    let writes_before = fx.sim.write_count();
    let processed = fx.engine.process_changes(Vec::new(), false).await.unwrap();
    assert_eq!(processed, 0);
    assert_eq!(fx.sim.write_count(), writes_before);
}
