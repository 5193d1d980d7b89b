//! Typed helpers over [`ObjectStore`]

use crate::error::{ControllerError, Result};
use crate::traits::{ListParams, ObjectStore};
use nodesim_core::{JsonPatch, Resource, ResourceKey};
use serde_json::Value;
use tracing::debug;

fn decode<T: Resource>(key: &ResourceKey, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ControllerError::serialization(format!("Failed to decode {}: {}", key, e)))
}

fn key_of<T: Resource>(resource: &T) -> Result<ResourceKey> {
    resource
        .resource_key()
        .map_err(|e| ControllerError::internal_error(e.to_string()))
}

/// Get a resource from the store
pub async fn get_resource<T: Resource>(store: &dyn ObjectStore, key: &ResourceKey) -> Result<T> {
    debug!("Getting resource: {}", key);
    let value = store.get(key).await?;
    decode(key, value)
}

/// Get a resource, mapping not-found to `None`
pub async fn find_resource<T: Resource>(
    store: &dyn ObjectStore,
    key: &ResourceKey,
) -> Result<Option<T>> {
    match get_resource(store, key).await {
        Ok(resource) => Ok(Some(resource)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// List resources of one kind
pub async fn list_resources<T: Resource>(
    store: &dyn ObjectStore,
    namespace: Option<&str>,
    params: &ListParams,
) -> Result<Vec<T>> {
    let gvk = T::gvk();
    let values = store.list(&gvk, namespace, params).await?;
    debug!("Listed {} {} objects", values.len(), gvk.kind);

    values
        .into_iter()
        .map(|value| {
            serde_json::from_value(value).map_err(|e| {
                ControllerError::serialization(format!("Failed to decode {}: {}", gvk, e))
            })
        })
        .collect()
}

/// Create a resource in the store
pub async fn create_resource<T: Resource>(store: &dyn ObjectStore, resource: &T) -> Result<T> {
    let key = key_of(resource)?;
    debug!("Creating resource: {}", key);
    let value = store.create(&key, nodesim_core::to_value(resource)?).await?;
    decode(&key, value)
}

/// Replace a resource in the store
pub async fn update_resource<T: Resource>(store: &dyn ObjectStore, resource: &T) -> Result<T> {
    let key = key_of(resource)?;
    debug!("Updating resource: {}", key);
    let value = store.update(&key, nodesim_core::to_value(resource)?).await?;
    decode(&key, value)
}

/// Patch a resource and return the result
pub async fn patch_resource<T: Resource>(
    store: &dyn ObjectStore,
    key: &ResourceKey,
    patch: &JsonPatch,
) -> Result<T> {
    debug!("Patching resource: {} ({} ops)", key, patch.ops().len());
    let value = store.patch(key, patch).await?;
    decode(key, value)
}

/// Delete a resource; not-found counts as success. Returns whether the object existed.
pub async fn delete_if_exists(store: &dyn ObjectStore, key: &ResourceKey) -> Result<bool> {
    match store.delete(key).await {
        Ok(()) => {
            debug!("Deleted resource: {}", key);
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
