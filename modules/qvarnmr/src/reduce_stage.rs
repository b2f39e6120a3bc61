//! The reduce stage: recompute the single reduced row for one key.

use std::cmp::Reverse;
use std::time::Instant;

use serde_json::Value;
use tracing::info;

use qvarn_client::{Resource, SearchQuery, Store, StoreError};

use crate::clock;
use crate::error::{Error, Result};
use crate::handlers::{normalized_payload, Context};
use crate::topology::{ReduceSpec, Topology};

fn row_id(row: &Resource) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Store(StoreError::Parse("reduced row without an id".to_string())))
}

/// Fetch the reduced row for a key, enforcing uniqueness: when several
/// exist (a race between briefly overlapping workers), the one with the
/// greatest `_mr_timestamp` survives and the rest are deleted.
async fn ensure_single_resource(
    store: &dyn Store,
    target_resource_type: &str,
    key: &Value,
) -> Result<Option<Resource>> {
    let mut rows = store
        .search(
            target_resource_type,
            SearchQuery::new().exact("_mr_key", key).show_all(),
        )
        .await?;

    if rows.len() > 1 {
        rows.sort_by_key(|row| {
            Reverse(row.get("_mr_timestamp").and_then(Value::as_i64).unwrap_or(0))
        });
        let losers = rows[1..]
            .iter()
            .map(row_id)
            .collect::<Result<Vec<String>>>()?;
        store
            .delete_multiple(target_resource_type, &losers)
            .await?;
        rows.truncate(1);
    }

    Ok(rows.pop())
}

/// Live (non-tombstoned) mapped row ids for a key, verifying that every
/// row was produced by the currently registered version of its map
/// handler. A mismatch means resync is mid-flight for this key; the
/// reduce must wait until the data is consistent again.
async fn live_row_ids(
    store: &dyn Store,
    topology: &Topology,
    source_resource_type: &str,
    key: &Value,
) -> Result<Vec<String>> {
    let rows = store
        .search(
            source_resource_type,
            SearchQuery::new()
                .exact("_mr_key", key)
                .show("_mr_source_type")
                .show("_mr_version")
                .show("_mr_deleted"),
        )
        .await?;

    let mut ids = Vec::new();
    for row in rows {
        if row.get("_mr_deleted").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let row_source_type = row
            .get("_mr_source_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Store(StoreError::Parse(
                    "mapped row without _mr_source_type".to_string(),
                ))
            })?;
        let map_spec = topology
            .map_spec(source_resource_type, row_source_type)
            .ok_or_else(|| {
                Error::Config(format!(
                    "no map handler registered for {source_resource_type} <- {row_source_type}"
                ))
            })?;
        if row.get("_mr_version").and_then(Value::as_i64) != Some(map_spec.version) {
            return Err(Error::VersionSkew { key: key.clone() });
        }
        ids.push(row_id(&row)?);
    }
    Ok(ids)
}

/// Recompute the reduced rows for one `(mapped type, key)` group through
/// every reduce handler registered for the mapped type.
pub async fn process_reduce(
    store: &dyn Store,
    topology: &Topology,
    source_resource_type: &str,
    key: &Value,
    handlers: &[(String, ReduceSpec)],
    resync: bool,
) -> Result<()> {
    let context = Context {
        store,
        source_resource_type,
    };

    for (target_resource_type, spec) in handlers {
        info!(
            source = source_resource_type,
            target = target_resource_type.as_str(),
            key = %key,
            version = spec.version,
            resync,
            "processing reduce handler"
        );
        let started = Instant::now();

        let survivor = ensure_single_resource(store, target_resource_type, key).await?;

        if resync {
            let up_to_date = survivor
                .as_ref()
                .and_then(|row| row.get("_mr_version").and_then(Value::as_i64))
                == Some(spec.version);
            if up_to_date {
                // Full resync: this key is already on the new version.
                continue;
            }
        }

        let ids = live_row_ids(store, topology, source_resource_type, key).await?;
        let mut items: Vec<Value> = ids.into_iter().map(Value::String).collect();
        if let Some(transform) = &spec.map {
            items = transform
                .run(context, items)
                .await
                .map_err(Error::Handler)?;
        }

        if items.is_empty() {
            if let Some(survivor_row) = &survivor {
                // No live mapped rows left: the key is gone.
                store
                    .delete(target_resource_type, &row_id(survivor_row)?)
                    .await?;
                continue;
            }
        }

        let value = spec
            .handler
            .run(context, items)
            .await
            .map_err(Error::Handler)?;

        let mut payload = normalized_payload(value);
        payload.insert("_mr_key".to_string(), key.clone());
        payload.insert("_mr_version".to_string(), Value::from(spec.version));
        payload.insert(
            "_mr_timestamp".to_string(),
            Value::from(clock::monotonic_ns()),
        );

        match survivor {
            None => {
                store.create(target_resource_type, payload).await?;
            }
            Some(survivor) => {
                if let Some(revision) = survivor.get("revision") {
                    payload.insert("revision".to_string(), revision.clone());
                }
                store
                    .update(target_resource_type, &row_id(&survivor)?, payload)
                    .await?;
            }
        }

        info!(
            source = source_resource_type,
            target = target_resource_type.as_str(),
            key = %key,
            version = spec.version,
            resync,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "done processing reduce handler"
        );
    }

    Ok(())
}
