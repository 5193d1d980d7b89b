use crate::error::{ControllerError, Result};
use crate::traits::{ListParams, ObjectStore};
use async_trait::async_trait;
use nodesim_core::{GroupVersionKind, JsonPatch, ResourceKey};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Connection settings for [`ApiClient`]
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// API server base URL, e.g. `https://127.0.0.1:6443`
    pub base_url: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            insecure: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for a Kubernetes-compatible API server
///
/// Implements [`ObjectStore`] by mapping keys onto REST paths. It has no change
/// feed, so controllers driven by it rely on their periodic resync.
pub struct ApiClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
        }
    }

    /// Build a client with authentication and TLS settings
    pub fn with_config(config: &ApiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| {
                ControllerError::internal_error(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode the JSON body; `key` names the object in errors
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<(Vec<u8>, &str)>,
        key: &str,
    ) -> Result<Value> {
        debug!("{} {}", method, url);

        let mut request = self.client.request(method.clone(), url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some((bytes, content_type)) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ControllerError::transport(url, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => ControllerError::not_found(key),
                StatusCode::CONFLICT if method == Method::POST => {
                    ControllerError::already_exists(key)
                }
                StatusCode::CONFLICT => ControllerError::conflict(key, body),
                _ => ControllerError::api_request_failed(
                    method.as_str(),
                    url,
                    status.as_u16(),
                    body,
                ),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ControllerError::transport(url, e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ControllerError::serialization(format!("Failed to parse response from {}: {}", url, e))
        })
    }

    fn encode(object: &impl serde::Serialize) -> Result<Vec<u8>> {
        serde_json::to_vec(object)
            .map_err(|e| ControllerError::serialization(format!("Failed to encode body: {}", e)))
    }
}

/// Query parameters for a list call
fn list_query(params: &ListParams) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(labels) = params.label_selector_query() {
        query.push(("labelSelector", labels));
    }
    if let Some(fields) = params.field_selector_query() {
        query.push(("fieldSelector", fields));
    }
    query
}

/// Path a patch is sent to: the status subresource when it only touches status
fn patch_path(key: &ResourceKey, patch: &JsonPatch) -> String {
    if patch.targets_status() {
        format!("{}/status", key.api_path())
    } else {
        key.api_path()
    }
}

#[async_trait]
impl ObjectStore for ApiClient {
    async fn get(&self, key: &ResourceKey) -> Result<Value> {
        let url = self.url(&key.api_path());
        self.send(Method::GET, &url, &[], None, &key.to_string())
            .await
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Value>> {
        let url = self.url(&gvk.collection_path(namespace));
        let list = self
            .send(Method::GET, &url, &list_query(params), None, &gvk.to_string())
            .await?;

        let Value::Object(mut list) = list else {
            return Err(ControllerError::serialization(format!(
                "List response from {} is not an object",
                url
            )));
        };
        let items = match list.remove("items") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(ControllerError::serialization(format!(
                    "List response from {} has malformed items",
                    url
                )))
            }
        };

        // List items usually omit their type meta
        Ok(items
            .into_iter()
            .map(|mut item| {
                if let Some(object) = item.as_object_mut() {
                    object
                        .entry("apiVersion")
                        .or_insert_with(|| Value::from(gvk.api_version()));
                    object
                        .entry("kind")
                        .or_insert_with(|| Value::from(gvk.kind.clone()));
                }
                item
            })
            .collect())
    }

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        let url = self.url(&key.gvk.collection_path(key.namespace()));
        let body = Self::encode(&object)?;
        self.send(
            Method::POST,
            &url,
            &[],
            Some((body, "application/json")),
            &key.to_string(),
        )
        .await
    }

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        let url = self.url(&key.api_path());
        let body = Self::encode(&object)?;
        self.send(
            Method::PUT,
            &url,
            &[],
            Some((body, "application/json")),
            &key.to_string(),
        )
        .await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let url = self.url(&key.api_path());
        self.send(Method::DELETE, &url, &[], None, &key.to_string())
            .await?;
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, patch: &JsonPatch) -> Result<Value> {
        let url = self.url(&patch_path(key, patch));
        let body = Self::encode(patch)?;
        self.send(
            Method::PATCH,
            &url,
            &[],
            Some((body, JSON_PATCH_CONTENT_TYPE)),
            &key.to_string(),
        )
        .await
    }
}
