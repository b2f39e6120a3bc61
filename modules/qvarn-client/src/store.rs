use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::search::SearchQuery;

/// A schemaless store document. Persisted documents carry `id`, `type`
/// and `revision` alongside their own fields.
pub type Resource = serde_json::Map<String, Value>;

/// Sentinel id used by `status_check`; the store treats it as a cheap
/// liveness probe per resource type.
pub const STATUS_CHECK_ID: &str = "*statuscheck*";

/// The store contract the engine consumes: typed resources with CRUD,
/// Django-ORM-style search, and change-notification listeners.
///
/// Implemented by [`QvarnClient`](crate::QvarnClient) over HTTP and by the
/// in-memory `simqvarn` fake for tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Retrieve one resource.
    async fn get(&self, resource_type: &str, id: &str) -> Result<Resource>;

    /// List all resource ids of a type.
    async fn get_list(&self, resource_type: &str) -> Result<Vec<String>>;

    /// Retrieve several resources. Results follow the input id order.
    async fn get_multiple(&self, resource_type: &str, ids: &[String]) -> Result<Vec<Resource>>;

    /// Create a resource; the store assigns `id` and `revision`.
    async fn create(&self, resource_type: &str, payload: Resource) -> Result<Resource>;

    /// Update a resource. When the payload carries a `revision` it must be
    /// the current one or the store fails with [`StoreError::Conflict`];
    /// when it carries none, the current revision is fetched first.
    async fn update(&self, resource_type: &str, id: &str, payload: Resource) -> Result<Resource>;

    /// Delete one resource.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<()>;

    /// Delete several resources.
    async fn delete_multiple(&self, resource_type: &str, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete(resource_type, id).await?;
        }
        Ok(())
    }

    /// Search returning matching ids (no projection).
    async fn search_ids(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<String>>;

    /// Search returning projected or full records; the query must carry
    /// `show` fields or `show_all`.
    async fn search(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<Resource>>;

    /// Search asserting at most one result. Zero results fail with
    /// [`StoreError::NotFound`] (use [`crate::optional`] for a default),
    /// more than one with [`StoreError::MultipleFound`]. Without a
    /// projection the full resource is fetched.
    async fn search_one(&self, resource_type: &str, query: SearchQuery) -> Result<Resource> {
        let described = query.describe();
        if query.has_projection() {
            let mut found = self.search(resource_type, query).await?;
            match found.len() {
                1 => Ok(found.remove(0)),
                0 => Err(StoreError::NotFound(format!(
                    "{resource_type} matching {described}"
                ))),
                _ => Err(StoreError::MultipleFound {
                    resource_type: resource_type.to_string(),
                    query: described,
                }),
            }
        } else {
            let ids = self.search_ids(resource_type, query).await?;
            match ids.len() {
                1 => self.get(resource_type, &ids[0]).await,
                0 => Err(StoreError::NotFound(format!(
                    "{resource_type} matching {described}"
                ))),
                _ => Err(StoreError::MultipleFound {
                    resource_type: resource_type.to_string(),
                    query: described,
                }),
            }
        }
    }

    /// Liveness probe: touch each resource type with a sentinel search.
    async fn status_check(&self, resource_types: &[&str]) -> Result<()> {
        for resource_type in resource_types {
            self.search_ids(resource_type, SearchQuery::new().exact("id", STATUS_CHECK_ID))
                .await?;
        }
        Ok(())
    }

    /// Create a change-notification listener for a resource type.
    async fn create_listener(&self, resource_type: &str, payload: Resource) -> Result<Resource>;

    /// Retrieve a listener resource.
    async fn get_listener(&self, resource_type: &str, listener_id: &str) -> Result<Resource>;

    /// List pending notification ids for a listener, oldest first.
    async fn notification_ids(&self, resource_type: &str, listener_id: &str)
        -> Result<Vec<String>>;

    /// Retrieve one notification record.
    async fn get_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<Resource>;

    /// Acknowledge (delete) a notification.
    async fn delete_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<()>;
}
