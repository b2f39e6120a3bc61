//! Listener leases: at most one active worker per source type.
//!
//! Each `(instance, source type)` pair has one state record in the store.
//! A running worker stamps `{owner, timestamp}` at least every `interval`
//! seconds; a worker whose stamp is older than `timeout` is considered
//! dead and its lease is forfeit. On clean exit the owner is cleared so
//! the next worker starts without waiting for the timeout.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use qvarn_client::{optional, Resource, SearchQuery, Store, StoreError};

use crate::error::{Error, Result};
use crate::topology::Topology;

/// Resource type holding the lease records.
pub const LISTENERS_TYPE: &str = "qvarnmr_listeners";

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A notification listener owned by this topology, together with its
/// lease state record.
#[derive(Debug, Clone)]
pub struct Listener {
    pub source_resource_type: String,
    pub listener: Resource,
    pub state: Resource,
}

impl Listener {
    pub fn listener_id(&self) -> Result<&str> {
        str_field(&self.listener, "id")
    }

    fn state_id(&self) -> Result<&str> {
        str_field(&self.state, "id")
    }

    pub fn owner(&self) -> Option<&str> {
        self.state.get("owner").and_then(Value::as_str)
    }
}

fn str_field<'r>(doc: &'r Resource, name: &str) -> Result<&'r str> {
    doc.get(name).and_then(Value::as_str).ok_or_else(|| {
        Error::Store(StoreError::Parse(format!(
            "listener record without a {name} field"
        )))
    })
}

fn parse_timestamp(state: &Resource) -> Result<Option<DateTime<Utc>>> {
    match state.get("timestamp") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(|err| {
                Error::Store(StoreError::Parse(format!(
                    "bad listener timestamp {raw:?}: {err}"
                )))
            }),
        Some(other) => Err(Error::Store(StoreError::Parse(format!(
            "bad listener timestamp: {other}"
        )))),
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(DATETIME_FORMAT).to_string()
}

/// This worker's lease owner identity.
pub fn worker_signature() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{host}/{}", std::process::id())
}

/// Make sure every distinct source type of the topology has a listener in
/// the store and a lease record, creating both on first run.
pub async fn get_or_create_listeners(
    store: &dyn Store,
    instance: &str,
    topology: &Topology,
) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    for source_resource_type in topology.source_types() {
        let state = optional(
            store
                .search_one(
                    LISTENERS_TYPE,
                    SearchQuery::new()
                        .exact("instance", instance)
                        .exact("resource_type", source_resource_type.as_str()),
                )
                .await,
        )?;

        let (listener, state) = match state {
            None => {
                let mut listener_payload = Resource::new();
                listener_payload.insert("notify_of_new".to_string(), Value::Bool(true));
                listener_payload.insert("listen_on_all".to_string(), Value::Bool(true));
                let listener = store
                    .create_listener(&source_resource_type, listener_payload)
                    .await?;

                let mut state_payload = Resource::new();
                state_payload.insert("instance".to_string(), Value::String(instance.to_string()));
                state_payload.insert(
                    "resource_type".to_string(),
                    Value::String(source_resource_type.clone()),
                );
                state_payload.insert(
                    "listener_id".to_string(),
                    listener.get("id").cloned().unwrap_or(Value::Null),
                );
                state_payload.insert("timestamp".to_string(), Value::Null);
                state_payload.insert("owner".to_string(), Value::Null);
                let state = store.create(LISTENERS_TYPE, state_payload).await?;
                (listener, state)
            }
            Some(state) => {
                let listener_id = str_field(&state, "listener_id")?.to_string();
                let listener = store
                    .get_listener(&source_resource_type, &listener_id)
                    .await?;
                (listener, state)
            }
        };

        listeners.push(Listener {
            source_resource_type,
            listener,
            state,
        });
    }
    Ok(listeners)
}

/// Refresh the keep-alive stamp on every lease, taking ownership where the
/// record is unowned or its owner timed out. Fails with [`Error::Busy`]
/// when another worker's stamp is still fresh.
pub async fn check_and_update_listeners_state(
    store: &dyn Store,
    listeners: &[Listener],
    interval: f64,
    timeout: f64,
) -> Result<Vec<Listener>> {
    let signature = worker_signature();
    let interval = Duration::milliseconds((interval * 1000.0) as i64);
    let timeout = Duration::milliseconds((timeout * 1000.0) as i64);

    let mut result = Vec::new();
    for listener in listeners {
        let now = Utc::now();
        let mut state = listener.state.clone();
        let mut timestamp = parse_timestamp(&state)?.unwrap_or(now);

        // After a long gap the record may have changed hands; re-read it
        // before deciding anything.
        if now - timestamp >= timeout {
            warn!(
                timeout_s = timeout.num_seconds(),
                stale_s = (now - timestamp).num_seconds(),
                "lease stamp past timeout, re-reading state from the store"
            );
            state = store.get(LISTENERS_TYPE, listener.state_id()?).await?;
            timestamp = parse_timestamp(&state)?.unwrap_or(now);
        }

        let missing =
            !state.get("timestamp").is_some_and(|t| !t.is_null())
                || !state.get("owner").is_some_and(|o| !o.is_null());
        let owner = state
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or(&signature)
            .to_string();
        let elapsed = now - timestamp;

        let outdated = owner == signature && elapsed > interval;
        let timed_out = owner != signature && elapsed > timeout;
        let busy = owner != signature && elapsed <= timeout;

        if outdated || timed_out || missing {
            debug!(
                signature = %signature,
                owner = %owner,
                elapsed_s = elapsed.num_seconds(),
                source = %listener.source_resource_type,
                "updating keep-alive state"
            );
            let mut payload = state.clone();
            payload.insert("owner".to_string(), Value::String(signature.clone()));
            payload.insert(
                "timestamp".to_string(),
                Value::String(format_timestamp(now)),
            );
            let state_id = str_field(&state, "id")?.to_string();
            let state = store.update(LISTENERS_TYPE, &state_id, payload).await?;
            result.push(Listener {
                state,
                ..listener.clone()
            });
        } else if busy {
            error!(
                signature = %signature,
                owner = %owner,
                elapsed_s = elapsed.num_seconds(),
                source = %listener.source_resource_type,
                "another worker holds a live lease"
            );
            return Err(Error::Busy { owner });
        } else {
            result.push(Listener {
                state,
                ..listener.clone()
            });
        }
    }
    Ok(result)
}

/// Clear the owner from every lease so the next worker can start
/// immediately, without waiting for the timeout.
pub async fn clear_listener_owners(
    store: &dyn Store,
    listeners: &[Listener],
) -> Result<Vec<Listener>> {
    let mut result = Vec::new();
    for listener in listeners {
        let state_id = listener.state_id()?.to_string();
        let mut payload = store.get(LISTENERS_TYPE, &state_id).await?;
        payload.insert("owner".to_string(), Value::Null);
        payload.insert(
            "timestamp".to_string(),
            Value::String(format_timestamp(Utc::now())),
        );
        let state = store.update(LISTENERS_TYPE, &state_id, payload).await?;
        result.push(Listener {
            state,
            ..listener.clone()
        });
    }
    Ok(result)
}
