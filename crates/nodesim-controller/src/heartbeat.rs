use crate::allocator::AcceleratorAllocator;
use crate::error::{ControllerError, Result};
use crate::fleet_controller::MIN_INTERVAL;
use crate::node_status::{canonical_conditions, compute_allocatable, lease_spec, new_lease};
use crate::store::{create_resource, find_resource, list_resources, patch_resource};
use crate::template::{generate, AcceleratorTemplate};
use crate::traits::{ListParams, ObjectStore};
use crate::workqueue::WorkQueue;
use chrono::Utc;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use nodesim_core::{
    FleetKey, JsonPatch, Lease, Node, NodeFleet, ObjectMeta, Pod, Resource, ResourceKey, SimConfig,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Heartbeat updater configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often every managed node is queued for a heartbeat
    pub interval: Duration,
    /// Nodes updated concurrently
    pub workers: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            workers: 5,
        }
    }
}

/// Keeps the status and lease of every managed node fresh
///
/// Only writes node status (conditions and allocatable), leases and
/// accelerator inventories. Node specs belong to the fleet controller.
#[derive(Clone)]
pub struct HeartbeatUpdater {
    store: Arc<dyn ObjectStore>,
    config: HeartbeatConfig,
    sim: Arc<SimConfig>,
    allocator: Arc<AcceleratorAllocator>,
    queue: WorkQueue<String>,
}

impl HeartbeatUpdater {
    pub fn new(store: Arc<dyn ObjectStore>, config: HeartbeatConfig, sim: SimConfig) -> Self {
        let sim = Arc::new(sim);
        Self {
            allocator: Arc::new(AcceleratorAllocator::new(store.clone(), sim.clone())),
            store,
            config,
            sim,
            queue: WorkQueue::new(),
        }
    }

    /// Run the updater until the token is cancelled
    ///
    /// Nodes already queued when the token fires are still processed.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting heartbeat updater (interval: {:?}, workers: {})",
            self.config.interval, self.config.workers
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let this = self.clone();
            workers.spawn(async move { this.worker(id).await });
        }

        let mut interval = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Heartbeat updater shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.enqueue_nodes().await {
                        error!("Failed to list managed nodes: {}", e);
                    }
                }
            }
        }

        self.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Heartbeat worker failed: {}", e);
            }
        }
        info!("Heartbeat updater stopped");
        Ok(())
    }

    async fn enqueue_nodes(&self) -> Result<()> {
        let nodes: Vec<Node> = list_resources(
            &*self.store,
            None,
            &ListParams::labels(self.sim.managed_selector()),
        )
        .await?;
        debug!("Queueing heartbeats for {} nodes", nodes.len());
        for name in nodes.iter().filter_map(|node| node.name()) {
            self.queue.add(name.to_string());
        }
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!("Heartbeat worker {} started", id);
        while let Some(name) = self.queue.get().await {
            match self.sync_node(&name).await {
                Ok(()) => self.queue.forget(&name),
                Err(e) if e.is_retryable() => {
                    warn!(node = %name, "Heartbeat failed, retrying: {}", e);
                    self.queue.add_rate_limited(name.clone());
                }
                Err(e) => {
                    error!(node = %name, "Heartbeat failed: {}", e);
                    self.queue.forget(&name);
                }
            }
            self.queue.done(&name);
        }
        debug!("Heartbeat worker {} stopped", id);
    }

    /// Refresh conditions, allocatable, lease and accelerators of one node
    pub async fn sync_node(&self, name: &str) -> Result<()> {
        let key = Node::key("", name);
        let Some(node) = find_resource::<Node>(&*self.store, &key).await? else {
            debug!(node = name, "Node disappeared, skipping heartbeat");
            return Ok(());
        };
        let now = Utc::now();
        let mut has_status = node.status.is_some();
        let status = node.status.unwrap_or_default();

        let conditions = status_patch(
            has_status,
            "conditions",
            nodesim_core::to_value(&canonical_conditions(now))?,
            status.conditions.is_some(),
        );
        match patch_resource::<Node>(&*self.store, &key, &conditions).await {
            Ok(_) => has_status = true,
            Err(e) => warn!(node = name, "Failed to update conditions: {}", e),
        }

        let capacity = status.capacity.clone().unwrap_or_default();
        let accounting = self
            .update_allocatable(&key, &status, has_status, &capacity)
            .await;

        // Liveness does not depend on accounting
        self.renew_lease(name).await?;

        if let Some(accelerator) = self.accelerator_template(&node.metadata, &capacity).await {
            if let Err(e) = self.allocator.sync_node(name, &accelerator).await {
                warn!(node = name, "Accelerator sync failed: {}", e);
            }
        }

        accounting
    }

    async fn update_allocatable(
        &self,
        key: &ResourceKey,
        status: &NodeStatus,
        has_status: bool,
        capacity: &BTreeMap<String, Quantity>,
    ) -> Result<()> {
        let name = key.name.as_str();
        let workloads: Vec<Pod> =
            list_resources(&*self.store, None, &ListParams::all().bound_to(name)).await?;
        let allocatable = compute_allocatable(name, capacity, &workloads);
        if status.allocatable.as_ref() == Some(&allocatable) {
            return Ok(());
        }

        let patch = status_patch(
            has_status,
            "allocatable",
            nodesim_core::to_value(&allocatable)?,
            status.allocatable.is_some(),
        );
        patch_resource::<Node>(&*self.store, key, &patch).await?;
        debug!(node = name, workloads = workloads.len(), "Updated allocatable");
        Ok(())
    }

    /// Accelerator shape of a node, taken from its owning fleet
    ///
    /// Nodes whose fleet is gone, unreadable or invalid fall back to the resources
    /// they advertise.
    async fn accelerator_template(
        &self,
        metadata: &ObjectMeta,
        capacity: &BTreeMap<String, Quantity>,
    ) -> Option<AcceleratorTemplate> {
        let owner = metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.sim.fleet_annotation_key))
            .and_then(|value| FleetKey::parse(value).ok());

        if let Some(owner) = owner {
            let fleet_key = NodeFleet::key(&owner.namespace, &owner.name);
            match find_resource::<NodeFleet>(&*self.store, &fleet_key).await {
                Ok(Some(fleet)) => match generate(&fleet, &self.sim) {
                    Ok(template) => return template.accelerator().cloned(),
                    Err(e) => debug!(fleet = %owner, "Fleet has an invalid template: {}", e),
                },
                Ok(None) => {}
                Err(e) => debug!(fleet = %owner, "Failed to read owning fleet: {}", e),
            }
        }
        AcceleratorTemplate::from_capacity(capacity, &self.sim)
    }

    async fn renew_lease(&self, name: &str) -> Result<()> {
        let key: ResourceKey = Lease::key(&self.sim.lease_namespace, name);
        let now = Utc::now();

        match find_resource::<Lease>(&*self.store, &key).await? {
            Some(lease) => {
                let spec = nodesim_core::to_value(&lease_spec(name, &self.sim, now))?;
                let patch = JsonPatch::new().set("/spec", spec, lease.spec.is_some());
                patch_resource::<Lease>(&*self.store, &key, &patch).await?;
            }
            None => match create_resource(&*self.store, &new_lease(name, &self.sim, now)).await {
                Ok(_) => debug!(node = name, "Created lease"),
                Err(ControllerError::AlreadyExists { .. }) => {
                    debug!(node = name, "Lease created concurrently")
                }
                Err(e) => return Err(e),
            },
        }
        Ok(())
    }
}

/// Patch one status field, creating `/status` first when the node has none
fn status_patch(
    has_status: bool,
    field: &str,
    value: serde_json::Value,
    field_exists: bool,
) -> JsonPatch {
    if !has_status {
        return JsonPatch::new().add("/status", json!({ field: value }));
    }
    JsonPatch::new().set(format!("/status/{}", field), value, field_exists)
}
