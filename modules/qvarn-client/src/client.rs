use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{Result, StoreError};
use crate::search::SearchQuery;
use crate::store::{Resource, Store};

/// Refresh the access token this long before its reported expiry.
const TOKEN_EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

/// Connection settings for the store.
#[derive(Debug, Clone)]
pub struct QvarnClientConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub verify_requests: bool,
    pub scopes: Vec<String>,
    /// Width of the parallel request fan-out for multi-operations.
    pub threads: usize,
}

/// HTTP client for the Qvarn document store.
///
/// Authenticates with OAuth2 client credentials; the access token is cached
/// and refreshed ahead of expiry (and once more on an unexpected 401).
pub struct QvarnClient {
    http: reqwest::Client,
    base_url: Url,
    config: QvarnClientConfig,
    token: RwLock<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl QvarnClient {
    pub fn new(config: QvarnClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| StoreError::Parse(format!("invalid base_url: {err}")))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_requests)
            .build()?;
        Ok(Self {
            http,
            base_url,
            config,
            token: RwLock::new(None),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                StoreError::Parse(format!("base_url cannot be a base: {}", self.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<String> {
        let mut cached = self.token.write().await;
        let url = self.url(&["auth", "token"])?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "client_credentials".to_string()),
                ("scope", self.config.scopes.join(" ")),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Unauthorized(format!(
                "token request failed with status {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!(expires_in = token.expires_in, "access token refreshed");
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in)
            - TOKEN_EXPIRY_LEEWAY.min(Duration::from_secs(token.expires_in));
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value> {
        let mut unauthorized_retry = true;
        loop {
            let token = self.access_token().await?;
            let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && unauthorized_retry {
                // The cached token may have been revoked server-side.
                unauthorized_retry = false;
                self.token.write().await.take();
                continue;
            }

            if status.is_success() {
                let is_json = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_ascii_lowercase().contains("application/json"))
                    .unwrap_or(false);
                if is_json {
                    return Ok(response.json().await?);
                }
                return Ok(Value::Null);
            }

            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => StoreError::Unauthorized(body),
                404 => StoreError::NotFound(body),
                409 => StoreError::Conflict(body),
                status => StoreError::Api {
                    status,
                    message: body,
                },
            });
        }
    }

    fn fan_out(&self) -> usize {
        self.config.threads.max(1)
    }
}

fn as_resource(value: Value) -> Result<Resource> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Parse(format!(
            "expected a JSON object, got: {other}"
        ))),
    }
}

/// Extract `id`s from a `{"resources": [{"id": …}, …]}` listing.
fn resource_ids(value: Value) -> Result<Vec<String>> {
    resource_entries(value)?
        .into_iter()
        .map(|entry| {
            entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::Parse("resource listing entry without id".to_string()))
        })
        .collect()
}

fn resource_entries(value: Value) -> Result<Vec<Resource>> {
    let mut map = as_resource(value)?;
    match map.remove("resources") {
        Some(Value::Array(entries)) => entries.into_iter().map(as_resource).collect(),
        _ => Err(StoreError::Parse(
            "resource listing without a resources array".to_string(),
        )),
    }
}

#[async_trait]
impl Store for QvarnClient {
    async fn get(&self, resource_type: &str, id: &str) -> Result<Resource> {
        let url = self.url(&[resource_type, id])?;
        as_resource(self.send(Method::GET, url, None).await?)
    }

    async fn get_list(&self, resource_type: &str) -> Result<Vec<String>> {
        let url = self.url(&[resource_type])?;
        resource_ids(self.send(Method::GET, url, None).await?)
    }

    async fn get_multiple(&self, resource_type: &str, ids: &[String]) -> Result<Vec<Resource>> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move { self.get(resource_type, &id).await })
            .buffered(self.fan_out())
            .try_collect()
            .await
    }

    async fn create(&self, resource_type: &str, payload: Resource) -> Result<Resource> {
        let url = self.url(&[resource_type])?;
        let created = as_resource(
            self.send(Method::POST, url, Some(&Value::Object(payload)))
                .await?,
        )?;
        let created_id = created.get("id").and_then(Value::as_str);
        tracing::debug!(
            resource_type,
            id = created_id,
            "resource created"
        );
        Ok(created)
    }

    async fn update(&self, resource_type: &str, id: &str, payload: Resource) -> Result<Resource> {
        let mut payload = payload;
        if !payload.get("revision").is_some_and(|r| !r.is_null()) {
            let current = self.get(resource_type, id).await?;
            let revision = current.get("revision").cloned().unwrap_or(Value::Null);
            payload.insert("revision".to_string(), revision);
        }
        let url = self.url(&[resource_type, id])?;
        as_resource(
            self.send(Method::PUT, url, Some(&Value::Object(payload)))
                .await?,
        )
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<()> {
        let url = self.url(&[resource_type, id])?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn delete_multiple(&self, resource_type: &str, ids: &[String]) -> Result<()> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move { self.delete(resource_type, &id).await })
            .buffered(self.fan_out())
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn search_ids(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<String>> {
        let segments = query.path_segments();
        let mut all: Vec<&str> = vec![resource_type];
        all.extend(segments.iter().map(String::as_str));
        let url = self.url(&all)?;
        resource_ids(self.send(Method::GET, url, None).await?)
    }

    async fn search(&self, resource_type: &str, query: SearchQuery) -> Result<Vec<Resource>> {
        let segments = query.path_segments();
        let mut all: Vec<&str> = vec![resource_type];
        all.extend(segments.iter().map(String::as_str));
        let url = self.url(&all)?;
        resource_entries(self.send(Method::GET, url, None).await?)
    }

    async fn create_listener(&self, resource_type: &str, payload: Resource) -> Result<Resource> {
        let url = self.url(&[resource_type, "listeners"])?;
        as_resource(
            self.send(Method::POST, url, Some(&Value::Object(payload)))
                .await?,
        )
    }

    async fn get_listener(&self, resource_type: &str, listener_id: &str) -> Result<Resource> {
        let url = self.url(&[resource_type, "listeners", listener_id])?;
        as_resource(self.send(Method::GET, url, None).await?)
    }

    async fn notification_ids(
        &self,
        resource_type: &str,
        listener_id: &str,
    ) -> Result<Vec<String>> {
        let url = self.url(&[resource_type, "listeners", listener_id, "notifications"])?;
        resource_ids(self.send(Method::GET, url, None).await?)
    }

    async fn get_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<Resource> {
        let url = self.url(&[
            resource_type,
            "listeners",
            listener_id,
            "notifications",
            notification_id,
        ])?;
        as_resource(self.send(Method::GET, url, None).await?)
    }

    async fn delete_notification(
        &self,
        resource_type: &str,
        listener_id: &str,
        notification_id: &str,
    ) -> Result<()> {
        let url = self.url(&[
            resource_type,
            "listeners",
            listener_id,
            "notifications",
            notification_id,
        ])?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }
}
