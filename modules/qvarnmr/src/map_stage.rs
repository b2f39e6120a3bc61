//! The map stage: turn one source change into replaced mapped rows.

use std::time::Instant;

use serde_json::Value;
use tracing::info;

use qvarn_client::{Resource, SearchQuery, Store};

use crate::error::{Error, Result};
use crate::handlers::{normalized_payload, Context};
use crate::notifications::ResourceChange;
use crate::topology::MapSpec;

/// True when the previous run of this handler left exactly one row set and
/// it already carries the handler's version — resync can skip the source.
fn same_version(version: i64, existing: &[Resource]) -> bool {
    existing.len() == 1
        && existing[0].get("_mr_version").and_then(Value::as_i64) == Some(version)
}

fn row_id(row: &Resource) -> Result<String> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Store(qvarn_client::StoreError::Parse(
                "mapped row without an id".to_string(),
            ))
        })
}

/// Process one notification through every map handler registered for its
/// source type. Returns the number of mapped rows written.
///
/// On CREATED/UPDATED the handler output replaces all previous rows for
/// the source id; the output is fully materialized before anything is
/// deleted, so a failing handler leaves the prior rows intact. On DELETED
/// the rows are only tombstoned — the downstream reduce learns of the
/// change through the update notification and the rows are removed after
/// it has processed the key.
pub async fn process_map(
    store: &dyn Store,
    source_resource_type: &str,
    resource_change: ResourceChange,
    resource_id: &str,
    handlers: &[(String, MapSpec)],
    resync: bool,
) -> Result<usize> {
    let mut resources_updated = 0;
    let context = Context {
        store,
        source_resource_type,
    };

    match resource_change {
        ResourceChange::Created | ResourceChange::Updated => {
            let resource = store.get(source_resource_type, resource_id).await?;
            for (target_resource_type, spec) in handlers {
                info!(
                    source = source_resource_type,
                    target = target_resource_type.as_str(),
                    change = %resource_change,
                    resource = resource_id,
                    version = spec.version,
                    resync,
                    "processing map handler"
                );
                let started = Instant::now();

                let existing = store
                    .search(
                        target_resource_type,
                        SearchQuery::new()
                            .exact("_mr_source_id", resource_id)
                            .show("_mr_version"),
                    )
                    .await?;

                if resync && same_version(spec.version, &existing) {
                    // Full resync: this source is already up to date.
                    continue;
                }

                // Run the handler and materialize its whole output before
                // touching the store; a handler failure must not leave
                // partial state.
                let pairs = spec
                    .handler
                    .run(context, &resource)
                    .await
                    .map_err(Error::Handler)?;

                // Previously generated (key, value) pairs cannot be
                // matched up with the new ones, so replace them wholesale.
                let existing_ids = existing
                    .iter()
                    .map(row_id)
                    .collect::<Result<Vec<String>>>()?;
                store
                    .delete_multiple(target_resource_type, &existing_ids)
                    .await?;

                let output = pairs.len();
                for (key, value) in pairs {
                    let mut payload = normalized_payload(value);
                    payload.insert("_mr_key".to_string(), key);
                    payload.insert(
                        "_mr_source_id".to_string(),
                        Value::String(resource_id.to_string()),
                    );
                    payload.insert(
                        "_mr_source_type".to_string(),
                        Value::String(source_resource_type.to_string()),
                    );
                    payload.insert("_mr_deleted".to_string(), Value::Bool(false));
                    payload.insert("_mr_version".to_string(), Value::from(spec.version));
                    store.create(target_resource_type, payload).await?;
                    resources_updated += 1;
                }

                info!(
                    source = source_resource_type,
                    target = target_resource_type.as_str(),
                    change = %resource_change,
                    resource = resource_id,
                    version = spec.version,
                    resync,
                    output,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "done processing map handler"
                );
            }
        }

        ResourceChange::Deleted => {
            for (target_resource_type, spec) in handlers {
                info!(
                    source = source_resource_type,
                    target = target_resource_type.as_str(),
                    change = %resource_change,
                    resource = resource_id,
                    version = spec.version,
                    resync,
                    "processing map handler"
                );
                let started = Instant::now();

                let ids = store
                    .search_ids(
                        target_resource_type,
                        SearchQuery::new().exact("_mr_source_id", resource_id),
                    )
                    .await?;
                for mut row in store.get_multiple(target_resource_type, &ids).await? {
                    // The reduce handlers still need the key, so only mark
                    // the row; it is cleaned up after the reduce cycle.
                    row.insert("_mr_deleted".to_string(), Value::Bool(true));
                    let id = row_id(&row)?;
                    store.update(target_resource_type, &id, row).await?;
                    resources_updated += 1;
                }

                info!(
                    source = source_resource_type,
                    target = target_resource_type.as_str(),
                    change = %resource_change,
                    resource = resource_id,
                    version = spec.version,
                    resync,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "done processing map handler"
                );
            }
        }
    }

    Ok(resources_updated)
}
