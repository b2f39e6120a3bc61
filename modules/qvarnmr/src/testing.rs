//! Test helpers: drain the engine until quiescent and snapshot derived
//! resources in assertion-friendly shapes.

use std::collections::BTreeMap;

use anyhow::{bail, Context as _};
use serde_json::Value;

use qvarn_client::{Resource, Store};

use crate::engine::MapReduceEngine;
use crate::listeners::Listener;
use crate::notifications::get_changes;

/// Upper bound on processing rounds before a test is declared stuck.
const PROCESS_ROUND_LIMIT: usize = 10;

/// Process rounds of notifications until a round handles zero changes.
/// Returns the total number of changes processed.
pub async fn process(
    store: &dyn Store,
    listeners: &[Listener],
    engine: &mut MapReduceEngine,
) -> anyhow::Result<usize> {
    let mut total = 0;
    for _ in 0..PROCESS_ROUND_LIMIT {
        let changes = get_changes(store, listeners).await?;
        let processed = engine.process_changes(changes, false).await?;
        if processed == 0 {
            return Ok(total);
        }
        total += processed;
    }
    bail!("map/reduce did not settle within {PROCESS_ROUND_LIMIT} rounds");
}

/// Strip the store-assigned and timing fields so snapshots compare stably.
pub fn cleaned(resource: &Resource) -> Resource {
    resource
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "id" | "revision" | "_mr_timestamp"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// All rows of a mapped target, keyed by `_mr_source_id` and cleaned.
/// Fails when two rows share a source id.
pub async fn mapped_by_source(
    store: &dyn Store,
    target: &str,
) -> anyhow::Result<BTreeMap<String, Resource>> {
    let ids = store.get_list(target).await?;
    let mut result = BTreeMap::new();
    for row in store.get_multiple(target, &ids).await? {
        let source_id = row
            .get("_mr_source_id")
            .and_then(Value::as_str)
            .context("mapped row without _mr_source_id")?
            .to_string();
        if result.insert(source_id.clone(), cleaned(&row)).is_some() {
            bail!("two mapped rows share source id {source_id}");
        }
    }
    Ok(result)
}

/// All rows of a reduced target, keyed by rendered `_mr_key` and cleaned.
/// Fails when two rows share a key.
pub async fn reduced_by_key(
    store: &dyn Store,
    target: &str,
) -> anyhow::Result<BTreeMap<String, Resource>> {
    let ids = store.get_list(target).await?;
    let mut result = BTreeMap::new();
    for row in store.get_multiple(target, &ids).await? {
        let key = match row.get("_mr_key") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => bail!("reduced row without _mr_key"),
        };
        if result.insert(key.clone(), cleaned(&row)).is_some() {
            bail!("two reduced rows share key {key}");
        }
    }
    Ok(result)
}

/// The given fields of every row of a target, sorted for stable asserts.
pub async fn resource_values(
    store: &dyn Store,
    target: &str,
    fields: &[&str],
) -> anyhow::Result<Vec<Vec<Value>>> {
    let ids = store.get_list(target).await?;
    let mut result = Vec::new();
    for row in store.get_multiple(target, &ids).await? {
        result.push(
            fields
                .iter()
                .map(|field| row.get(*field).cloned().unwrap_or(Value::Null))
                .collect::<Vec<Value>>(),
        );
    }
    result.sort_by_key(|values| format!("{values:?}"));
    Ok(result)
}
