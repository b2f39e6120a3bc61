//! In-memory fake of the Qvarn document store for tests.
//!
//! Faithful to the pieces of the store contract the engine relies on:
//! declared resource types, server-assigned ids and revisions, revision
//! conflicts on update, per-type listeners with notification records
//! generated on every change, and exact-match search with
//! repeated-sub-field semantics and projections.
//!
//! No network, no database — `cargo test` in seconds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use qvarn_client::search::Condition;
use qvarn_client::{Resource, Result, SearchQuery, Store, StoreError};

#[derive(Default)]
struct TypeTable {
    /// Documents in insertion order; each carries `id`, `type`, `revision`.
    docs: Vec<Resource>,
    listeners: Vec<Resource>,
    /// Notification records in generation order.
    notifications: Vec<Resource>,
}

#[derive(Default)]
pub struct SimQvarn {
    tables: Mutex<BTreeMap<String, TypeTable>>,
    /// Resource creates + updates + deletes, for write-idempotence tests.
    writes: AtomicU64,
}

impl SimQvarn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource type. Access to undeclared types errors, the way
    /// the real store rejects unknown paths.
    pub fn add_resource_type(&self, name: &str) {
        self.tables
            .lock()
            .expect("simqvarn lock poisoned")
            .entry(name.to_string())
            .or_default();
    }

    pub fn add_resource_types(&self, names: &[&str]) {
        for name in names {
            self.add_resource_type(name);
        }
    }

    /// Number of resource writes (create/update/delete) seen so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn with_table<T>(
        &self,
        resource_type: &str,
        f: impl FnOnce(&mut TypeTable) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.tables.lock().expect("simqvarn lock poisoned");
        let table = tables
            .get_mut(resource_type)
            .ok_or_else(|| StoreError::NotFound(format!("no such resource type: {resource_type}")))?;
        f(table)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl TypeTable {
    fn doc(&self, id: &str) -> Result<&Resource> {
        self.docs
            .iter()
            .find(|doc| doc.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))
    }

    fn doc_mut(&mut self, id: &str) -> Result<&mut Resource> {
        self.docs
            .iter_mut()
            .find(|doc| doc.get("id").and_then(Value::as_str) == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("resource {id}")))
    }

    fn notify(&mut self, resource_type: &str, resource_id: &str, change: &str) {
        for listener in &self.listeners {
            let listen_on_all = listener
                .get("listen_on_all")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let notify_of_new = listener
                .get("notify_of_new")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !(listen_on_all || (notify_of_new && change == "created")) {
                continue;
            }
            let listener_id = listener
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut notification = Resource::new();
            notification.insert("id".to_string(), Value::String(new_id()));
            notification.insert("type".to_string(), Value::String("notification".to_string()));
            notification.insert("listener_id".to_string(), Value::String(listener_id));
            notification.insert(
                "resource_id".to_string(),
                Value::String(resource_id.to_string()),
            );
            notification.insert(
                "resource_change".to_string(),
                Value::String(change.to_string()),
            );
            notification.insert(
                "resource_type".to_string(),
                Value::String(resource_type.to_string()),
            );
            self.notifications.push(notification);
        }
    }
}

/// Loose scalar equality: exact JSON equality, or equality of the string
/// renderings (the store indexes values textually).
fn scalar_matches(doc_value: &Value, wanted: &Value) -> bool {
    if doc_value == wanted {
        return true;
    }
    render(doc_value) == render(wanted)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_matches(doc: &Resource, condition: &Condition) -> Result<bool> {
    if condition.method != "exact" {
        return Err(StoreError::Api {
            status: 400,
            message: format!("unsupported search method: {}", condition.method),
        });
    }
    let field_value = doc.get(&condition.field).unwrap_or(&Value::Null);
    // Every wanted value must be matched by some occurrence of the field.
    Ok(condition.values.iter().all(|wanted| match field_value {
        Value::Array(items) => items.iter().any(|item| scalar_matches(item, wanted)),
        scalar => scalar_matches(scalar, wanted),
    }))
}

fn matching_docs<'t>(table: &'t TypeTable, query: &SearchQuery) -> Result<Vec<&'t Resource>> {
    let conditions = query.ordered_conditions();
    let mut matched = Vec::new();
    for doc in &table.docs {
        let mut all = true;
        for condition in &conditions {
            if !field_matches(doc, condition)? {
                all = false;
                break;
            }
        }
        if all {
            matched.push(doc);
        }
    }
    Ok(matched)
}

fn project(doc: &Resource, query: &SearchQuery) -> Resource {
    if query.shows_all() {
        return doc.clone();
    }
    let mut out = Resource::new();
    out.insert(
        "id".to_string(),
        doc.get("id").cloned().unwrap_or(Value::Null),
    );
    for field in query.shown_fields() {
        out.insert(
            field.clone(),
            doc.get(field).cloned().unwrap_or(Value::Null),
        );
    }
    out
}

#[async_trait]
impl Store for SimQvarn {
    async fn get(&self, resource_type: &str, id: &str) -> Result<Resource> {
        self.with_table(resource_type, |table| Ok(table.doc(id)?.clone()))
    }

    async fn get_list(&self, resource_type: &str) -> Result<Vec<String>> {
        self.with_table(resource_type, |table| {
            Ok(table
                .docs
                .iter()
                .filter_map(|doc| doc.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect())
        })
    }

    async fn get_multiple(&self, resource_type: &str, ids: &[String]) -> Result<Vec<Resource>> {
        self.with_table(resource_type, |table| {
            ids.iter().map(|id| table.doc(id).cloned()).collect()
        })
    }

    async fn create(&self, resource_type: &str, payload: Resource) -> Result<Resource> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.with_table(resource_type, |table| {
            let mut doc = payload;
            let id = new_id();
            doc.insert("id".to_string(), Value::String(id.clone()));
            doc.insert("type".to_string(), Value::String(resource_type.to_string()));
            doc.insert("revision".to_string(), Value::String(new_id()));
            table.docs.push(doc.clone());
            table.notify(resource_type, &id, "created");
            Ok(doc)
        })
    }

    async fn update(&self, resource_type: &str, id: &str, payload: Resource) -> Result<Resource> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.with_table(resource_type, |table| {
            let current_revision = table.doc(id)?.get("revision").cloned();
            if let Some(given) = payload.get("revision").filter(|r| !r.is_null()) {
                if Some(given) != current_revision.as_ref() {
                    return Err(StoreError::Conflict(format!(
                        "stale revision for {resource_type} {id}"
                    )));
                }
            }
            let mut doc = payload;
            doc.insert("id".to_string(), Value::String(id.to_string()));
            doc.insert("type".to_string(), Value::String(resource_type.to_string()));
            doc.insert("revision".to_string(), Value::String(new_id()));
            *table.doc_mut(id)? = doc.clone();
            table.notify(resource_type, id, "updated");
            Ok(doc)
        })
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.with_table(resource_type, |table| {
            let before = table.docs.len();
            table
                .docs
                .retain(|doc| doc.get("id").and_then(Value::as_str) != Some(id));
            if table.docs.len() == before {
                return Err(StoreError::NotFound(format!("resource {id}")));
            }
            table.notify(resource_type, id, "deleted");
            Ok(())
        })
    }

    async fn search_ids(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<String>> {
        self.with_table(resource_type, |table| {
            Ok(matching_docs(table, &query)?
                .into_iter()
                .filter_map(|doc| doc.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect())
        })
    }

    async fn search(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<Resource>> {
        self.with_table(resource_type, |table| {
            Ok(matching_docs(table, &query)?
                .into_iter()
                .map(|doc| project(doc, &query))
                .collect())
        })
    }

    async fn create_listener(&self, resource_type: &str, payload: Resource) -> Result<Resource> {
        self.with_table(resource_type, |table| {
            let mut doc = payload;
            doc.insert("id".to_string(), Value::String(new_id()));
            doc.insert("type".to_string(), Value::String("listener".to_string()));
            doc.insert("revision".to_string(), Value::String(new_id()));
            table.listeners.push(doc.clone());
            Ok(doc)
        })
    }

    async fn get_listener(&self, resource_type: &str, listener_id: &str) -> Result<Resource> {
        self.with_table(resource_type, |table| {
            table
                .listeners
                .iter()
                .find(|l| l.get("id").and_then(Value::as_str) == Some(listener_id))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("listener {listener_id}")))
        })
    }

    async fn notification_ids(
        &self,
        resource_type: &str,
        listener_id: &str,
    ) -> Result<Vec<String>> {
        self.with_table(resource_type, |table| {
            Ok(table
                .notifications
                .iter()
                .filter(|n| n.get("listener_id").and_then(Value::as_str) == Some(listener_id))
                .filter_map(|n| n.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect())
        })
    }

    async fn get_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<Resource> {
        self.with_table(resource_type, |table| {
            table
                .notifications
                .iter()
                .find(|n| {
                    n.get("listener_id").and_then(Value::as_str) == Some(listener_id)
                        && n.get("id").and_then(Value::as_str) == Some(notification_id)
                })
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("notification {notification_id}")))
        })
    }

    async fn delete_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<()> {
        self.with_table(resource_type, |table| {
            let before = table.notifications.len();
            table.notifications.retain(|n| {
                !(n.get("listener_id").and_then(Value::as_str) == Some(listener_id)
                    && n.get("id").and_then(Value::as_str) == Some(notification_id))
            });
            if table.notifications.len() == before {
                return Err(StoreError::NotFound(format!(
                    "notification {notification_id}"
                )));
            }
            Ok(())
        })
    }
}
