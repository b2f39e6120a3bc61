//! Reading and acknowledging change notifications from the store.

use std::fmt;

use serde_json::Value;
use tracing::{debug, warn};

use qvarn_client::{Resource, Store, StoreError};

use crate::error::{Error, Result};
use crate::listeners::Listener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceChange {
    Created,
    Updated,
    Deleted,
}

impl ResourceChange {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceChange::Created => "created",
            ResourceChange::Updated => "updated",
            ResourceChange::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(ResourceChange::Created),
            "updated" => Ok(ResourceChange::Updated),
            "deleted" => Ok(ResourceChange::Deleted),
            other => Err(Error::Store(StoreError::Parse(format!(
                "unknown resource change: {other:?}"
            )))),
        }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource change to process. `generated` marks synthetic records
/// manufactured by the resync driver; those are never acked against the
/// store.
#[derive(Debug, Clone)]
pub struct Notification {
    pub resource_type: String,
    pub resource_change: ResourceChange,
    pub resource_id: String,
    pub notification_id: Option<String>,
    pub listener_id: Option<String>,
    pub generated: bool,
}

impl Notification {
    pub fn synthetic(resource_type: &str, change: ResourceChange, resource_id: &str) -> Self {
        Notification {
            resource_type: resource_type.to_string(),
            resource_change: change,
            resource_id: resource_id.to_string(),
            notification_id: None,
            listener_id: None,
            generated: true,
        }
    }
}

fn str_field(doc: &Resource, name: &str) -> Result<String> {
    doc.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Store(StoreError::Parse(format!(
                "notification without a {name} field"
            )))
        })
}

/// Pull all pending notifications for the given listeners. Notifications
/// already deleted in the store (for example after retries were given up
/// by a previous worker) are skipped silently.
pub async fn get_changes(store: &dyn Store, listeners: &[Listener]) -> Result<Vec<Notification>> {
    let mut changes = Vec::new();
    for listener in listeners {
        let listener_id = listener.listener_id()?.to_string();
        let resource_type = listener.source_resource_type.clone();
        for notification_id in store.notification_ids(&resource_type, &listener_id).await? {
            let doc = match store
                .get_notification(&resource_type, &listener_id, &notification_id)
                .await
            {
                Ok(doc) => doc,
                Err(StoreError::NotFound(_)) => {
                    warn!(
                        notification = %notification_id,
                        resource_type = %resource_type,
                        "notification has been deleted (probably after giving up retries)"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            changes.push(Notification {
                resource_change: ResourceChange::parse(&str_field(&doc, "resource_change")?)?,
                resource_id: str_field(&doc, "resource_id")?,
                resource_type: resource_type.clone(),
                notification_id: Some(notification_id),
                listener_id: Some(listener_id.clone()),
                generated: false,
            });
        }
    }
    Ok(changes)
}

/// Acknowledge a notification by deleting it from its listener. Synthetic
/// notifications have nothing to delete.
pub async fn ack(store: &dyn Store, notification: &Notification) -> Result<()> {
    if notification.generated {
        return Ok(());
    }
    let (Some(listener_id), Some(notification_id)) = (
        notification.listener_id.as_deref(),
        notification.notification_id.as_deref(),
    ) else {
        return Ok(());
    };
    debug!(
        resource_type = %notification.resource_type,
        change = %notification.resource_change,
        resource = %notification.resource_id,
        "deleting notification"
    );
    store
        .delete_notification(&notification.resource_type, listener_id, notification_id)
        .await?;
    Ok(())
}
