use crate::error::Result;
use async_trait::async_trait;
use nodesim_core::{GroupVersionKind, JsonPatch, ResourceEvent, ResourceKey};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Filters applied to a list call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Equality label selector; every pair must match
    pub label_selector: BTreeMap<String, String>,
    /// `spec.nodeName` field selector (workloads only)
    pub node_name: Option<String>,
}

impl ListParams {
    /// List everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Select objects carrying every given label
    pub fn labels(selector: BTreeMap<String, String>) -> Self {
        Self {
            label_selector: selector,
            node_name: None,
        }
    }

    /// Restrict to workloads bound to `node_name`
    pub fn bound_to(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// `labelSelector` query value (`k1=v1,k2=v2`)
    pub fn label_selector_query(&self) -> Option<String> {
        if self.label_selector.is_empty() {
            return None;
        }
        Some(
            self.label_selector
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// `fieldSelector` query value
    pub fn field_selector_query(&self) -> Option<String> {
        self.node_name
            .as_ref()
            .map(|node| format!("spec.nodeName={}", node))
    }

    /// Whether a stored object passes both selectors
    pub fn matches(&self, object: &Value) -> bool {
        let labels = &object["metadata"]["labels"];
        let labels_match = self
            .label_selector
            .iter()
            .all(|(k, v)| labels[k].as_str() == Some(v.as_str()));

        let node_matches = match &self.node_name {
            Some(node) => object["spec"]["nodeName"].as_str() == Some(node.as_str()),
            None => true,
        };

        labels_match && node_matches
    }
}

/// Access to the orchestration API's object store
///
/// Every component reads and writes cluster objects through this trait, as
/// untyped JSON so the trait stays object-safe. The typed helpers in
/// [`crate::store`] convert to and from `nodesim_core` resources.
///
/// Implementations follow Kubernetes semantics: `create` fails with
/// `AlreadyExists`, `get`/`update`/`delete`/`patch` fail with `NotFound`, and
/// `delete` only marks an object with a `deletionTimestamp` while it still has
/// finalizers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object
    async fn get(&self, key: &ResourceKey) -> Result<Value>;

    /// List objects of a kind, optionally within one namespace
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Value>>;

    /// Create an object, returning it as stored
    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    /// Replace an object, returning it as stored
    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    /// Request deletion of an object
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    /// Apply a JSON patch, returning the patched object
    async fn patch(&self, key: &ResourceKey, patch: &JsonPatch) -> Result<Value>;

    /// Change feed, when the store can provide one
    fn subscribe(&self) -> Option<broadcast::Receiver<ResourceEvent>> {
        None
    }
}
