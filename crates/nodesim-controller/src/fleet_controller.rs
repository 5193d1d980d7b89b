use crate::allocator::AcceleratorAllocator;
use crate::error::{ControllerError, Result};
use crate::node_status::canonical_conditions;
use crate::parallel::parallelize;
use crate::store::{
    create_resource, delete_if_exists, find_resource, list_resources, patch_resource,
    update_resource,
};
use crate::template::{generate, NodeTemplate};
use crate::traits::{ListParams, ObjectStore};
use crate::workqueue::WorkQueue;
use chrono::Utc;
use nodesim_core::{
    AcceleratorInventory, FleetKey, JsonPatch, Lease, Node, NodeFleet, Resource, ResourceEvent,
    SimConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest tick any loop runs at; `tokio::time::interval` rejects zero
pub(crate) const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Fleet controller configuration
#[derive(Debug, Clone)]
pub struct FleetControllerConfig {
    /// Fleets reconciled concurrently
    pub reconcile_workers: usize,
    /// Nodes synchronized concurrently within one fleet
    pub fan_out_workers: usize,
    /// How often every fleet is re-queued regardless of change events
    pub resync_interval: Duration,
}

impl Default for FleetControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_workers: 2,
            fan_out_workers: 5,
            resync_interval: Duration::from_secs(30),
        }
    }
}

/// Drives the virtual nodes of every `NodeFleet` towards its spec
///
/// Ownership is label based: the nodes of a fleet are whatever the store
/// returns for the fleet's identity label, so the controller keeps no state
/// of its own between passes.
#[derive(Clone)]
pub struct FleetController {
    store: Arc<dyn ObjectStore>,
    config: FleetControllerConfig,
    sim: Arc<SimConfig>,
    allocator: Arc<AcceleratorAllocator>,
    queue: WorkQueue<FleetKey>,
}

impl FleetController {
    pub fn new(store: Arc<dyn ObjectStore>, config: FleetControllerConfig, sim: SimConfig) -> Self {
        let sim = Arc::new(sim);
        Self {
            allocator: Arc::new(AcceleratorAllocator::new(store.clone(), sim.clone())),
            store,
            config,
            sim,
            queue: WorkQueue::new(),
        }
    }

    /// Queue a fleet for reconciliation
    pub fn enqueue(&self, key: FleetKey) {
        self.queue.add(key);
    }

    /// Run the controller until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting fleet controller (workers: {}, fan-out: {}, resync: {:?})",
            self.config.reconcile_workers, self.config.fan_out_workers, self.config.resync_interval
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.reconcile_workers.max(1) {
            let this = self.clone();
            workers.spawn(async move { this.worker(id).await });
        }

        let mut feed = self.store.subscribe();
        if feed.is_none() {
            info!("Store has no change feed, relying on periodic resync");
        }
        let mut resync = tokio::time::interval(self.config.resync_interval.max(MIN_INTERVAL));

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Fleet controller shutting down");
                    break;
                }
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        error!("Fleet resync failed: {}", e);
                    }
                }
                event = next_event(&mut feed) => match event {
                    Ok(event) => self.route_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Change feed lagged by {} events, resyncing", missed);
                        if let Err(e) = self.resync().await {
                            error!("Fleet resync failed: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Change feed closed, relying on periodic resync");
                        feed = None;
                    }
                },
            }
        }

        self.queue.shutdown();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Fleet worker failed: {}", e);
            }
        }
        info!("Fleet controller stopped");
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!("Fleet worker {} started", id);
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is_retryable() => {
                    warn!(
                        fleet = %key,
                        attempt = self.queue.num_requeues(&key) + 1,
                        "Reconcile failed, retrying: {}", e
                    );
                    self.queue.add_rate_limited(key.clone());
                }
                Err(e) => {
                    error!(fleet = %key, "Reconcile failed: {}", e);
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!("Fleet worker {} stopped", id);
    }

    /// Queue every fleet in the store
    async fn resync(&self) -> Result<()> {
        let fleets: Vec<NodeFleet> =
            list_resources(&*self.store, None, &ListParams::all()).await?;
        debug!("Resyncing {} fleets", fleets.len());
        for fleet in &fleets {
            self.queue.add(fleet.fleet_key());
        }
        Ok(())
    }

    /// Map a change event to the fleet it concerns
    fn route_event(&self, event: &ResourceEvent) {
        let gvk = &event.resource_key.gvk;
        if gvk == &NodeFleet::gvk() {
            if let Some(namespace) = event.resource_key.namespace() {
                self.queue
                    .add(FleetKey::new(namespace, event.resource_key.name.clone()));
            }
        } else if gvk == &Node::gvk()
            && event.label(&self.sim.managed_label_key) == Some(self.sim.managed_label_value.as_str())
        {
            match event.annotation(&self.sim.fleet_annotation_key).map(FleetKey::parse) {
                Some(Ok(key)) => self.queue.add(key),
                Some(Err(e)) => debug!(node = %event.resource_key.name, "Unowned node: {}", e),
                None => {}
            }
        }
    }

    /// Run one reconciliation pass for a fleet
    pub async fn reconcile(&self, key: &FleetKey) -> Result<()> {
        let fleet_key = NodeFleet::key(&key.namespace, &key.name);
        let Some(mut fleet) = find_resource::<NodeFleet>(&*self.store, &fleet_key).await? else {
            debug!(fleet = %key, "Fleet no longer exists");
            return Ok(());
        };

        if !fleet.is_being_deleted() && !fleet.has_finalizer(&self.sim.finalizer) {
            fleet
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(self.sim.finalizer.clone());
            fleet = update_resource(&*self.store, &fleet).await?;
            debug!(fleet = %key, "Added finalizer");
        }

        let owned: Vec<Node> = list_resources(
            &*self.store,
            None,
            &ListParams::labels(self.sim.fleet_selector(&fleet)),
        )
        .await?;

        if fleet.is_being_deleted() {
            return self.teardown(fleet, owned).await;
        }

        let template = generate(&fleet, &self.sim)
            .map_err(|e| ControllerError::invalid_fleet(key, e))?;
        let desired = fleet.desired_replicas();

        self.scale_down(&fleet, &owned, desired).await;

        let names: Vec<String> = (0..desired).map(|i| fleet.node_name(i)).collect();
        self.converge(&template, names.clone()).await;

        if let Some(accelerator) = template.accelerator() {
            let accelerator = Arc::new(accelerator.clone());
            let allocator = self.allocator.clone();
            parallelize(names, self.config.fan_out_workers, move |name: String| {
                let allocator = allocator.clone();
                let accelerator = accelerator.clone();
                async move {
                    if let Err(e) = allocator.sync_node(&name, &accelerator).await {
                        warn!(node = %name, "Accelerator sync failed: {}", e);
                    }
                }
            })
            .await;
        }

        debug!(fleet = %key, replicas = desired, "Reconciled fleet");
        Ok(())
    }

    /// Delete owned nodes beyond the desired count, and strays whose names do
    /// not follow the fleet's naming pattern
    async fn scale_down(&self, fleet: &NodeFleet, owned: &[Node], desired: usize) {
        let surplus: Vec<String> = owned
            .iter()
            .filter_map(|node| node.name())
            .filter(|name| fleet.node_index(name).is_none_or(|index| index >= desired))
            .map(str::to_string)
            .collect();
        if surplus.is_empty() {
            return;
        }

        info!(fleet = %fleet.fleet_key(), nodes = surplus.len(), "Scaling down");
        let store = self.store.clone();
        let sim = self.sim.clone();
        parallelize(surplus, self.config.fan_out_workers, move |name: String| {
            let store = store.clone();
            let sim = sim.clone();
            async move {
                for e in delete_node_objects(&*store, &sim, &name).await {
                    warn!(node = %name, "Scale-down delete failed: {}", e);
                }
            }
        })
        .await;
    }

    /// Create missing nodes and bring existing ones to the template's spec
    async fn converge(&self, template: &NodeTemplate, names: Vec<String>) {
        let template = Arc::new(template.clone());
        let store = self.store.clone();
        parallelize(names, self.config.fan_out_workers, move |name: String| {
            let store = store.clone();
            let template = template.clone();
            async move {
                if let Err(e) = sync_node(&*store, &template, &name).await {
                    warn!(node = %name, "Node sync failed: {}", e);
                }
            }
        })
        .await;
    }

    /// Remove everything a deleted fleet owns, then release its finalizer
    async fn teardown(&self, mut fleet: NodeFleet, owned: Vec<Node>) -> Result<()> {
        let key = fleet.fleet_key();
        if !fleet.has_finalizer(&self.sim.finalizer) {
            debug!(fleet = %key, "Fleet deleting without finalizer, nothing to do");
            return Ok(());
        }

        info!(fleet = %key, nodes = owned.len(), "Tearing down fleet");
        let mut failed = 0;
        for name in owned.iter().filter_map(|node| node.name()) {
            for e in delete_node_objects(&*self.store, &self.sim, name).await {
                warn!(node = name, "Teardown delete failed: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(ControllerError::internal_error(format!(
                "{} deletes failed while tearing down fleet {}",
                failed, key
            )));
        }

        if let Some(finalizers) = fleet.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != &self.sim.finalizer);
        }
        update_resource(&*self.store, &fleet).await?;
        info!(fleet = %key, "Fleet torn down");
        Ok(())
    }
}

/// Wait for the next change event, forever when there is no feed
async fn next_event(
    feed: &mut Option<broadcast::Receiver<ResourceEvent>>,
) -> std::result::Result<ResourceEvent, broadcast::error::RecvError> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Delete a node together with its lease and accelerator inventory
///
/// The node goes last and only once the others are gone: it is what makes
/// the leftovers discoverable on the next pass. Missing objects are fine;
/// every other failure is returned.
async fn delete_node_objects(
    store: &dyn ObjectStore,
    sim: &SimConfig,
    name: &str,
) -> Vec<ControllerError> {
    let dependents = [
        Lease::key(&sim.lease_namespace, name),
        AcceleratorInventory::key("", name),
    ];

    let mut errors = Vec::new();
    for key in &dependents {
        match delete_if_exists(store, key).await {
            Ok(true) => debug!("Deleted {}", key),
            Ok(false) => {}
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    let node = Node::key("", name);
    match delete_if_exists(store, &node).await {
        Ok(true) => debug!("Deleted {}", node),
        Ok(false) => {}
        Err(e) => errors.push(e),
    }
    errors
}

/// Create one node of the fleet, or bring its spec and capacity back in line
async fn sync_node(store: &dyn ObjectStore, template: &NodeTemplate, name: &str) -> Result<()> {
    let key = Node::key("", name);
    let Some(live) = find_resource::<Node>(store, &key).await? else {
        let mut node = template.materialize(name);
        if let Some(status) = node.status.as_mut() {
            status.conditions = Some(canonical_conditions(Utc::now()));
        }
        return match create_resource(store, &node).await {
            Ok(_) => {
                info!(node = name, "Created node");
                Ok(())
            }
            Err(ControllerError::AlreadyExists { .. }) => {
                debug!(node = name, "Node created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        };
    };

    if live.spec.as_ref() != template.spec() {
        let spec = nodesim_core::to_value(&template.spec())?;
        let patch = JsonPatch::new().set("/spec", spec, live.spec.is_some());
        patch_resource::<Node>(store, &key, &patch).await?;
        debug!(node = name, "Replaced node spec");
    }

    // Capacity is the only status field owned here; allocatable follows on
    // the next heartbeat
    let live_capacity = live.status.as_ref().and_then(|s| s.capacity.as_ref());
    if let Some(capacity) = template.capacity().filter(|c| live_capacity != Some(*c)) {
        let value = nodesim_core::to_value(capacity)?;
        let patch = match &live.status {
            Some(_) => JsonPatch::new().set("/status/capacity", value, live_capacity.is_some()),
            None => JsonPatch::new().add("/status", json!({ "capacity": value })),
        };
        patch_resource::<Node>(store, &key, &patch).await?;
        info!(node = name, "Republished node capacity");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{HeartbeatConfig, HeartbeatUpdater};
    use crate::mock::MockObjectStore;
    use crate::node_status::new_lease;
    use crate::store::get_resource;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use nodesim_core::{AcceleratorSpec, NodeFleetSpec, Pod};

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn small(replicas: i32) -> NodeFleet {
        NodeFleet::new(
            "default",
            "small",
            NodeFleetSpec {
                replicas,
                cpu: q("4"),
                memory: q("8Gi"),
                pods: q("20"),
                ..Default::default()
            },
        )
    }

    fn setup() -> (Arc<MockObjectStore>, FleetController) {
        let store = Arc::new(MockObjectStore::new());
        let controller = FleetController::new(
            store.clone(),
            FleetControllerConfig::default(),
            SimConfig::default(),
        );
        (store, controller)
    }

    fn key() -> FleetKey {
        FleetKey::new("default", "small")
    }

    async fn node_names(store: &MockObjectStore) -> Vec<String> {
        let nodes: Vec<Node> = list_resources(store, None, &ListParams::all()).await.unwrap();
        nodes
            .iter()
            .filter_map(|n| n.name().map(str::to_string))
            .collect()
    }

    async fn set_replicas(store: &MockObjectStore, replicas: i32) {
        let mut fleet: NodeFleet = get_resource(store, &NodeFleet::key("default", "small"))
            .await
            .unwrap();
        fleet.spec.replicas = replicas;
        update_resource(store, &fleet).await.unwrap();
    }

    async fn lease_exists(store: &MockObjectStore, name: &str) -> bool {
        find_resource::<Lease>(store, &Lease::key("kube-node-lease", name))
            .await
            .unwrap()
            .is_some()
    }

    async fn inventory_exists(store: &MockObjectStore, name: &str) -> bool {
        find_resource::<AcceleratorInventory>(store, &AcceleratorInventory::key("", name))
            .await
            .unwrap()
            .is_some()
    }

    fn with_accelerators(mut fleet: NodeFleet, count: i32) -> NodeFleet {
        fleet.spec.accelerator = Some(AcceleratorSpec {
            count,
            memory: q("16Gi"),
            compute: q("100"),
            bandwidth: q("900"),
            model: None,
        });
        fleet
    }

    #[tokio::test]
    async fn test_creates_nodes_with_capacity() {
        let (store, controller) = setup();
        create_resource(&*store, &small(3)).await.unwrap();

        controller.reconcile(&key()).await.unwrap();

        assert_eq!(
            node_names(&store).await,
            vec!["default-small-0", "default-small-1", "default-small-2"]
        );
        let node: Node = get_resource(&*store, &Node::key("", "default-small-1"))
            .await
            .unwrap();
        let status = node.status.unwrap();
        let capacity = status.capacity.unwrap();
        assert_eq!(capacity["cpu"], q("4"));
        assert_eq!(capacity["memory"], q("8Gi"));
        assert_eq!(capacity["pods"], q("20"));
        assert_eq!(status.allocatable.unwrap(), capacity);
        assert_eq!(status.conditions.unwrap().len(), 5);

        let fleet: NodeFleet = get_resource(&*store, &NodeFleet::key("default", "small"))
            .await
            .unwrap();
        assert!(fleet.has_finalizer("sim.k8s.io/node-fleet"));
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (store, controller) = setup();
        create_resource(&*store, &small(3)).await.unwrap();

        controller.reconcile(&key()).await.unwrap();
        let before = store.mutation_count();
        controller.reconcile(&key()).await.unwrap();
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_missing_fleet_is_not_an_error() {
        let (store, controller) = setup();
        controller.reconcile(&key()).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_scale_down_removes_nodes_and_leases() {
        let (store, controller) = setup();
        let sim = SimConfig::default();
        create_resource(&*store, &small(3)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();
        for i in 0..3 {
            let name = format!("default-small-{}", i);
            create_resource(&*store, &new_lease(&name, &sim, Utc::now()))
                .await
                .unwrap();
        }

        set_replicas(&store, 1).await;
        controller.reconcile(&key()).await.unwrap();

        assert_eq!(node_names(&store).await, vec!["default-small-0"]);
        assert!(lease_exists(&store, "default-small-0").await);
        assert!(!lease_exists(&store, "default-small-1").await);
        assert!(!lease_exists(&store, "default-small-2").await);
    }

    #[tokio::test]
    async fn test_scale_down_removes_accelerator_inventories() {
        let (store, controller) = setup();
        create_resource(&*store, &with_accelerators(small(2), 2))
            .await
            .unwrap();
        controller.reconcile(&key()).await.unwrap();
        assert!(inventory_exists(&store, "default-small-1").await);

        set_replicas(&store, 1).await;
        controller.reconcile(&key()).await.unwrap();

        assert_eq!(node_names(&store).await, vec!["default-small-0"]);
        assert!(inventory_exists(&store, "default-small-0").await);
        assert!(!inventory_exists(&store, "default-small-1").await);
    }

    #[tokio::test]
    async fn test_failed_lease_delete_keeps_node_for_retry() {
        let (store, controller) = setup();
        let sim = SimConfig::default();
        create_resource(&*store, &small(2)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();
        let lease_key = Lease::key("kube-node-lease", "default-small-1");
        create_resource(&*store, &new_lease("default-small-1", &sim, Utc::now()))
            .await
            .unwrap();

        store.fail_deletes_of(&lease_key);
        set_replicas(&store, 1).await;
        controller.reconcile(&key()).await.unwrap();
        assert_eq!(node_names(&store).await.len(), 2);

        store.clear_failures();
        controller.reconcile(&key()).await.unwrap();
        assert_eq!(node_names(&store).await, vec!["default-small-0"]);
        assert!(!lease_exists(&store, "default-small-1").await);
    }

    #[tokio::test]
    async fn test_scale_to_zero_and_back() {
        let (store, controller) = setup();
        create_resource(&*store, &small(2)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        set_replicas(&store, 0).await;
        controller.reconcile(&key()).await.unwrap();
        assert!(node_names(&store).await.is_empty());

        set_replicas(&store, 2).await;
        controller.reconcile(&key()).await.unwrap();
        assert_eq!(node_names(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_stray_owned_node_is_removed() {
        let (store, controller) = setup();
        create_resource(&*store, &small(1)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        let mut stray: Node = get_resource(&*store, &Node::key("", "default-small-0"))
            .await
            .unwrap();
        stray.metadata = nodesim_core::ObjectMeta {
            name: Some("default-small-007".to_string()),
            labels: stray.metadata.labels.clone(),
            ..Default::default()
        };
        create_resource(&*store, &stray).await.unwrap();

        controller.reconcile(&key()).await.unwrap();
        assert_eq!(node_names(&store).await, vec!["default-small-0"]);
    }

    #[tokio::test]
    async fn test_spec_drift_is_replaced() {
        let (store, controller) = setup();
        create_resource(&*store, &small(1)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        let mut fleet: NodeFleet = get_resource(&*store, &NodeFleet::key("default", "small"))
            .await
            .unwrap();
        fleet.spec.pod_cidrs = vec!["10.244.1.0/24".to_string()];
        update_resource(&*store, &fleet).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        let node: Node = get_resource(&*store, &Node::key("", "default-small-0"))
            .await
            .unwrap();
        assert_eq!(
            node.spec.unwrap().pod_cidr.as_deref(),
            Some("10.244.1.0/24")
        );
    }

    #[tokio::test]
    async fn test_deletion_tears_down_and_releases_fleet() {
        let (store, controller) = setup();
        let sim = SimConfig::default();
        create_resource(&*store, &small(2)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();
        for i in 0..2 {
            let name = format!("default-small-{}", i);
            create_resource(&*store, &new_lease(&name, &sim, Utc::now()))
                .await
                .unwrap();
        }

        let fleet_key = NodeFleet::key("default", "small");
        store.delete(&fleet_key).await.unwrap();
        // Finalizer holds the fleet until teardown
        assert!(find_resource::<NodeFleet>(&*store, &fleet_key)
            .await
            .unwrap()
            .is_some());

        controller.reconcile(&key()).await.unwrap();

        assert!(node_names(&store).await.is_empty());
        assert!(!lease_exists(&store, "default-small-0").await);
        assert!(!lease_exists(&store, "default-small-1").await);
        assert!(find_resource::<NodeFleet>(&*store, &fleet_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_finalizer() {
        let (store, controller) = setup();
        create_resource(&*store, &small(2)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        let fleet_key = NodeFleet::key("default", "small");
        store.fail_deletes_of(&Node::key("", "default-small-1"));
        store.delete(&fleet_key).await.unwrap();

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert!(err.is_retryable());
        let fleet: NodeFleet = get_resource(&*store, &fleet_key).await.unwrap();
        assert!(fleet.has_finalizer("sim.k8s.io/node-fleet"));
        assert_eq!(node_names(&store).await, vec!["default-small-1"]);

        store.clear_failures();
        controller.reconcile(&key()).await.unwrap();
        assert!(node_names(&store).await.is_empty());
        assert!(find_resource::<NodeFleet>(&*store, &fleet_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_lease_delete_during_teardown_is_retried() {
        let (store, controller) = setup();
        let sim = SimConfig::default();
        create_resource(&*store, &small(1)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();
        let lease_key = Lease::key("kube-node-lease", "default-small-0");
        create_resource(&*store, &new_lease("default-small-0", &sim, Utc::now()))
            .await
            .unwrap();

        let fleet_key = NodeFleet::key("default", "small");
        store.fail_deletes_of(&lease_key);
        store.delete(&fleet_key).await.unwrap();

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(node_names(&store).await, vec!["default-small-0"]);
        let fleet: NodeFleet = get_resource(&*store, &fleet_key).await.unwrap();
        assert!(fleet.has_finalizer("sim.k8s.io/node-fleet"));

        store.clear_failures();
        controller.reconcile(&key()).await.unwrap();
        assert!(node_names(&store).await.is_empty());
        assert!(!lease_exists(&store, "default-small-0").await);
        assert!(find_resource::<NodeFleet>(&*store, &fleet_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deletion_removes_accelerator_inventories() {
        let (store, controller) = setup();
        create_resource(&*store, &with_accelerators(small(2), 2))
            .await
            .unwrap();
        controller.reconcile(&key()).await.unwrap();
        assert!(inventory_exists(&store, "default-small-0").await);
        assert!(inventory_exists(&store, "default-small-1").await);

        store
            .delete(&NodeFleet::key("default", "small"))
            .await
            .unwrap();
        controller.reconcile(&key()).await.unwrap();

        assert!(node_names(&store).await.is_empty());
        assert!(!inventory_exists(&store, "default-small-0").await);
        assert!(!inventory_exists(&store, "default-small-1").await);
    }

    #[tokio::test]
    async fn test_accelerator_change_reaches_existing_nodes() {
        let (store, controller) = setup();
        let heartbeat = HeartbeatUpdater::new(
            store.clone(),
            HeartbeatConfig::default(),
            SimConfig::default(),
        );
        let node = "default-small-0";
        create_resource(&*store, &with_accelerators(small(1), 2))
            .await
            .unwrap();
        controller.reconcile(&key()).await.unwrap();
        heartbeat.sync_node(node).await.unwrap();

        let mut fleet: NodeFleet = get_resource(&*store, &NodeFleet::key("default", "small"))
            .await
            .unwrap();
        fleet.spec.cpu = q("8");
        if let Some(accelerator) = fleet.spec.accelerator.as_mut() {
            accelerator.count = 4;
        }
        update_resource(&*store, &fleet).await.unwrap();

        let mut versions = Vec::new();
        for _ in 0..2 {
            controller.reconcile(&key()).await.unwrap();
            heartbeat.sync_node(node).await.unwrap();

            let inventory: AcceleratorInventory =
                get_resource(&*store, &AcceleratorInventory::key("", node))
                    .await
                    .unwrap();
            assert_eq!(inventory.status.as_ref().unwrap().card_count, 4);
            versions.push(inventory.metadata.resource_version.clone());

            let live: Node = get_resource(&*store, &Node::key("", node)).await.unwrap();
            let status = live.status.unwrap();
            let capacity = status.capacity.unwrap();
            assert_eq!(capacity["cpu"], q("8"));
            assert_eq!(capacity["sim.k8s.io/accelerator-count"], q("4"));
            assert_eq!(status.allocatable.unwrap()["cpu"], q("8"));
        }
        // Settled after the first round
        assert_eq!(versions[0], versions[1]);
    }

    #[tokio::test]
    async fn test_invalid_spec_leaves_nodes_untouched() {
        let (store, controller) = setup();
        create_resource(&*store, &small(2)).await.unwrap();
        controller.reconcile(&key()).await.unwrap();

        let mut fleet: NodeFleet = get_resource(&*store, &NodeFleet::key("default", "small"))
            .await
            .unwrap();
        fleet.spec.replicas = 0;
        fleet.spec.cpu = q("lots");
        update_resource(&*store, &fleet).await.unwrap();

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidFleet { .. }));
        assert!(!err.is_retryable());
        assert_eq!(node_names(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_list_failure_aborts_pass() {
        let (store, controller) = setup();
        create_resource(&*store, &small(2)).await.unwrap();
        // The first pass adds the finalizer before listing
        store.fail_next_lists(1);

        let err = controller.reconcile(&key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(node_names(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_accelerator_fleet_gets_inventories() {
        let (store, controller) = setup();
        let mut fleet = small(2);
        fleet.metadata.name = Some("gpu".to_string());
        fleet.spec.accelerator = Some(AcceleratorSpec {
            count: 2,
            memory: q("16Gi"),
            compute: q("100"),
            bandwidth: q("900"),
            model: None,
        });
        create_resource(&*store, &fleet).await.unwrap();

        let mut pod = Pod::default();
        pod.metadata.name = Some("trainer".to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.labels = Some(
            [(
                "sim.k8s.io/accelerator-memory".to_string(),
                "10Gi".to_string(),
            )]
            .into(),
        );
        pod.spec = Some(PodSpec {
            node_name: Some("default-gpu-0".to_string()),
            ..Default::default()
        });
        create_resource(&*store, &pod).await.unwrap();

        let gpu = FleetKey::new("default", "gpu");
        controller.reconcile(&gpu).await.unwrap();

        let busy: AcceleratorInventory =
            get_resource(&*store, &AcceleratorInventory::key("", "default-gpu-0"))
                .await
                .unwrap();
        let idle: AcceleratorInventory =
            get_resource(&*store, &AcceleratorInventory::key("", "default-gpu-1"))
                .await
                .unwrap();
        const GI: i64 = 1 << 30;
        assert_eq!(busy.status.as_ref().unwrap().free_memory, 22 * GI);
        assert_eq!(idle.status.as_ref().unwrap().free_memory, 32 * GI);

        let node: Node = get_resource(&*store, &Node::key("", "default-gpu-0"))
            .await
            .unwrap();
        let capacity = node.status.unwrap().capacity.unwrap();
        assert_eq!(capacity["sim.k8s.io/accelerator-count"], q("2"));

        let before = store.mutation_count();
        controller.reconcile(&gpu).await.unwrap();
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_run_follows_change_feed() {
        let store = Arc::new(MockObjectStore::new());
        let controller = FleetController::new(
            store.clone(),
            FleetControllerConfig {
                resync_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            SimConfig::default(),
        );
        let token = CancellationToken::new();
        let handle = {
            let controller = controller.clone();
            let token = token.clone();
            tokio::spawn(async move { controller.run(token).await })
        };

        // Let the first resync tick pass so only events drive the work
        tokio::time::sleep(Duration::from_millis(50)).await;
        create_resource(&*store, &small(2)).await.unwrap();
        wait_for_nodes(&store, 2).await;

        set_replicas(&store, 1).await;
        wait_for_nodes(&store, 1).await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_with_zero_resync_interval() {
        let (store, _) = setup();
        let controller = FleetController::new(
            store.clone(),
            FleetControllerConfig {
                resync_interval: Duration::ZERO,
                ..Default::default()
            },
            SimConfig::default(),
        );
        create_resource(&*store, &small(1)).await.unwrap();

        let token = CancellationToken::new();
        let handle = {
            let controller = controller.clone();
            let token = token.clone();
            tokio::spawn(async move { controller.run(token).await })
        };
        wait_for_nodes(&store, 1).await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    async fn wait_for_nodes(store: &MockObjectStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while node_names(store).await.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
