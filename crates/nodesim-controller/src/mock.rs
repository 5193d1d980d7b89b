use crate::error::{ControllerError, Result};
use crate::traits::{ListParams, ObjectStore};
use async_trait::async_trait;
use nodesim_core::{GroupVersionKind, JsonPatch, ResourceEvent, ResourceKey, WatchEventType};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Metadata fields owned by the store; writers cannot change them
const SERVER_FIELDS: [&str; 4] = [
    "uid",
    "creationTimestamp",
    "deletionTimestamp",
    "resourceVersion",
];

/// Failures queued up by tests
#[derive(Debug, Default)]
struct FailureInjection {
    lists: usize,
    deletes: HashSet<String>,
}

/// In-memory object store for tests and the `simulate` command
///
/// Keeps JSON objects keyed by their storage key and reproduces the API
/// server behavior the controllers rely on: server-assigned uid, resource
/// version and creation timestamp, finalizer-gated deletion, JSON patches,
/// label and `spec.nodeName` selectors, and a broadcast change feed. Writes
/// that leave an object unchanged are not counted and do not bump its
/// resource version.
pub struct MockObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Value>>>,
    events: broadcast::Sender<ResourceEvent>,
    version: AtomicU64,
    mutations: AtomicU64,
    failures: Mutex<FailureInjection>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            events,
            version: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
            failures: Mutex::new(FailureInjection::default()),
        }
    }

    /// Number of effective writes (create, update, patch, delete) so far
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Make the next `count` list calls fail with a transport error
    pub fn fail_next_lists(&self, count: usize) {
        self.failures.lock().lists = count;
    }

    /// Make every delete of `key` fail until cleared
    pub fn fail_deletes_of(&self, key: &ResourceKey) {
        self.failures.lock().deletes.insert(key.storage_key());
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = FailureInjection::default();
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event_type: WatchEventType, key: &ResourceKey, object: &Value) {
        let version = object["metadata"]["resourceVersion"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        // No subscribers is fine
        let _ = self
            .events
            .send(ResourceEvent::new(event_type, key.clone(), object.clone(), version));
    }

    /// Store `next` as the new state of `key`, keeping server-owned metadata
    /// from `previous` and removing the object once deletion can complete
    fn commit(
        &self,
        objects: &mut BTreeMap<String, Value>,
        key: &ResourceKey,
        previous: &Value,
        mut next: Value,
    ) -> Result<Value> {
        {
            let meta = metadata_mut(&mut next, key)?;
            for field in SERVER_FIELDS {
                match previous["metadata"].get(field) {
                    Some(value) => meta.insert(field.to_string(), value.clone()),
                    None => meta.remove(field),
                };
            }
        }

        if next == *previous {
            debug!("Mock: no-op write to {}", key);
            return Ok(next);
        }

        let version = self.next_version();
        metadata_mut(&mut next, key)?.insert("resourceVersion".to_string(), Value::from(version));
        self.mutations.fetch_add(1, Ordering::SeqCst);

        let storage_key = key.storage_key();
        if is_being_deleted(&next) && !has_finalizers(&next) {
            objects.remove(&storage_key);
            debug!("Mock: finalizers cleared, removed {}", key);
            self.publish(WatchEventType::Deleted, key, &next);
        } else {
            objects.insert(storage_key, next.clone());
            self.publish(WatchEventType::Modified, key, &next);
        }
        Ok(next)
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_mut<'a>(object: &'a mut Value, key: &ResourceKey) -> Result<&'a mut Map<String, Value>> {
    object
        .as_object_mut()
        .ok_or_else(|| ControllerError::serialization(format!("{} is not a JSON object", key)))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| ControllerError::serialization(format!("{} has malformed metadata", key)))
}

fn has_finalizers(object: &Value) -> bool {
    object["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_being_deleted(object: &Value) -> bool {
    !object["metadata"]["deletionTimestamp"].is_null()
}

fn now() -> Value {
    Value::from(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn get(&self, key: &ResourceKey) -> Result<Value> {
        self.objects
            .read()
            .await
            .get(&key.storage_key())
            .cloned()
            .ok_or_else(|| ControllerError::not_found(key))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Value>> {
        {
            let mut failures = self.failures.lock();
            if failures.lists > 0 {
                failures.lists -= 1;
                return Err(ControllerError::transport(
                    gvk.collection_path(namespace),
                    "injected list failure",
                ));
            }
        }

        let prefix = ResourceKey::storage_prefix(gvk, namespace);
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
            .filter(|v| params.matches(v))
            .cloned()
            .collect())
    }

    async fn create(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        let storage_key = key.storage_key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&storage_key) {
            return Err(ControllerError::already_exists(key));
        }

        let version = self.next_version();
        {
            let meta = metadata_mut(&mut object, key)?;
            meta.insert("name".to_string(), Value::from(key.name.clone()));
            match key.namespace() {
                Some(ns) => meta.insert("namespace".to_string(), Value::from(ns)),
                None => meta.remove("namespace"),
            };
            meta.insert(
                "uid".to_string(),
                Value::from(uuid::Uuid::new_v4().to_string()),
            );
            meta.insert("resourceVersion".to_string(), Value::from(version));
            meta.insert("creationTimestamp".to_string(), now());
            meta.remove("deletionTimestamp");
        }

        objects.insert(storage_key, object.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!("Mock: created {}", key);
        self.publish(WatchEventType::Added, key, &object);
        Ok(object)
    }

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        let mut objects = self.objects.write().await;
        let previous = objects
            .get(&key.storage_key())
            .cloned()
            .ok_or_else(|| ControllerError::not_found(key))?;

        let expected = object["metadata"]["resourceVersion"].as_str();
        let current = previous["metadata"]["resourceVersion"].as_str();
        if expected.is_some() && expected != current {
            return Err(ControllerError::conflict(
                key,
                format!(
                    "resourceVersion {} does not match stored {}",
                    expected.unwrap_or_default(),
                    current.unwrap_or_default()
                ),
            ));
        }

        self.commit(&mut objects, key, &previous, object)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let storage_key = key.storage_key();
        if self.failures.lock().deletes.contains(&storage_key) {
            return Err(ControllerError::transport(key.api_path(), "injected delete failure"));
        }

        let mut objects = self.objects.write().await;
        let previous = objects
            .get(&storage_key)
            .cloned()
            .ok_or_else(|| ControllerError::not_found(key))?;

        if !has_finalizers(&previous) {
            objects.remove(&storage_key);
            self.mutations.fetch_add(1, Ordering::SeqCst);
            debug!("Mock: deleted {}", key);
            self.publish(WatchEventType::Deleted, key, &previous);
            return Ok(());
        }

        if is_being_deleted(&previous) {
            return Ok(());
        }

        // Finalizers pending: only mark for deletion
        let mut marked = previous.clone();
        metadata_mut(&mut marked, key)?.insert("deletionTimestamp".to_string(), now());
        let version = self.next_version();
        metadata_mut(&mut marked, key)?.insert("resourceVersion".to_string(), Value::from(version));
        objects.insert(storage_key, marked.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!("Mock: marked {} for deletion", key);
        self.publish(WatchEventType::Modified, key, &marked);
        Ok(())
    }

    async fn patch(&self, key: &ResourceKey, patch: &JsonPatch) -> Result<Value> {
        let operations: json_patch::Patch = serde_json::to_value(patch)
            .and_then(serde_json::from_value)
            .map_err(|e| ControllerError::serialization(format!("Invalid patch: {}", e)))?;

        let mut objects = self.objects.write().await;
        let previous = objects
            .get(&key.storage_key())
            .cloned()
            .ok_or_else(|| ControllerError::not_found(key))?;

        let mut next = previous.clone();
        json_patch::patch(&mut next, &operations.0).map_err(|e| {
            ControllerError::api_request_failed("PATCH", key.api_path(), 422, e.to_string())
        })?;

        self.commit(&mut objects, key, &previous, next)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ResourceEvent>> {
        Some(self.events.subscribe())
    }
}
