//! Simulated accelerator memory allocation
//!
//! Each pass rebuilds card state from scratch: every card starts with all of
//! its memory free and each workload bound to the node takes its requested
//! memory from the card with the most free memory. There is no admission
//! control, so free memory can go negative.

use crate::error::Result;
use crate::store::{create_resource, find_resource, list_resources, patch_resource};
use crate::template::AcceleratorTemplate;
use crate::traits::{ListParams, ObjectStore};
use nodesim_core::{
    AcceleratorCard, AcceleratorInventory, AcceleratorInventoryStatus, JsonPatch, Pod, Resource,
    ResourceQuantity, SimConfig,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Accelerator memory a workload asks for, in bytes
///
/// Read from the accelerator-memory label as a quantity (a bare integer is
/// bytes). Missing, malformed or negative values request nothing.
pub fn requested_memory(pod: &Pod, config: &SimConfig) -> i64 {
    let Some(value) = pod.label(&config.accelerator_memory_label) else {
        return 0;
    };
    let name = pod.name().unwrap_or_default();

    match ResourceQuantity::parse(value) {
        Ok(q) if !q.is_negative() => q.to_i64().unwrap_or_else(|| {
            warn!(pod = name, "Accelerator memory request {} is out of range", value);
            0
        }),
        Ok(_) => {
            warn!(pod = name, "Ignoring negative accelerator memory request {}", value);
            0
        }
        Err(e) => {
            warn!(pod = name, "Ignoring accelerator memory request {}: {}", value, e);
            0
        }
    }
}

/// Fresh cards for a template, ids `0..count`
pub fn build_cards(template: &AcceleratorTemplate) -> Vec<AcceleratorCard> {
    (0..template.count.max(0))
        .map(|id| {
            AcceleratorCard::new(
                id,
                template.model.clone(),
                template.memory,
                template.compute,
                template.bandwidth,
            )
        })
        .collect()
}

/// Whether existing cards still have the template's count, model and
/// per-card memory
fn matches_template(cards: &[AcceleratorCard], template: &AcceleratorTemplate) -> bool {
    usize::try_from(template.count).is_ok_and(|count| count == cards.len())
        && cards
            .iter()
            .all(|c| c.total_memory == template.memory && c.model == template.model)
}

/// Reset every card and place each request on the card with the most free
/// memory, lowest id first on ties
pub fn allocate(cards: &mut [AcceleratorCard], requests: &[i64]) {
    for card in cards.iter_mut() {
        card.free_memory = card.total_memory;
    }

    for &request in requests {
        let target = cards
            .iter_mut()
            .max_by(|a, b| a.free_memory.cmp(&b.free_memory).then(b.id.cmp(&a.id)));
        if let Some(card) = target {
            card.free_memory = card.free_memory.saturating_sub(request);
        }
    }
}

/// Keeps `AcceleratorInventory` objects in line with the workloads on each node
pub struct AcceleratorAllocator {
    store: Arc<dyn ObjectStore>,
    config: Arc<SimConfig>,
}

impl AcceleratorAllocator {
    pub fn new(store: Arc<dyn ObjectStore>, config: Arc<SimConfig>) -> Self {
        Self { store, config }
    }

    /// Recompute the inventory of one node, creating it if needed
    ///
    /// Nothing is written when the recomputed status equals the stored one.
    pub async fn sync_node(
        &self,
        node_name: &str,
        template: &AcceleratorTemplate,
    ) -> Result<AcceleratorInventoryStatus> {
        let key = AcceleratorInventory::key("", node_name);
        let existing: Option<AcceleratorInventory> = find_resource(&*self.store, &key).await?;

        let workloads: Vec<Pod> = list_resources(
            &*self.store,
            None,
            &ListParams::all().bound_to(node_name),
        )
        .await?;
        let requests: Vec<i64> = workloads
            .iter()
            .map(|pod| requested_memory(pod, &self.config))
            .collect();

        let mut cards = match &existing {
            Some(inventory) if matches_template(inventory.cards(), template) => {
                inventory.cards().to_vec()
            }
            Some(_) => {
                info!(node = node_name, "Accelerator template changed, rebuilding cards");
                build_cards(template)
            }
            None => build_cards(template),
        };
        allocate(&mut cards, &requests);
        let status = AcceleratorInventoryStatus::from_cards(cards);

        let Some(inventory) = existing else {
            let created =
                create_resource(&*self.store, &AcceleratorInventory::new(node_name, status.clone()))
                    .await?;
            info!(node = node_name, cards = status.card_count, "Created accelerator inventory");
            // Servers with a status subresource drop status on create
            if created.status.as_ref() != Some(&status) {
                self.write_status(&key, &status, created.status.is_some())
                    .await?;
            }
            return Ok(status);
        };

        if inventory.status.as_ref() == Some(&status) {
            debug!(node = node_name, "Accelerator inventory unchanged");
            return Ok(status);
        }

        self.write_status(&key, &status, inventory.status.is_some())
            .await?;
        debug!(
            node = node_name,
            free = status.free_memory,
            total = status.total_memory,
            "Updated accelerator inventory"
        );
        Ok(status)
    }

    async fn write_status(
        &self,
        key: &nodesim_core::ResourceKey,
        status: &AcceleratorInventoryStatus,
        exists: bool,
    ) -> Result<()> {
        let patch = JsonPatch::new().set("/status", nodesim_core::to_value(status)?, exists);
        patch_resource::<AcceleratorInventory>(&*self.store, key, &patch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockObjectStore;
    use crate::store::get_resource;
    use proptest::prelude::*;

    const GI: i64 = 1024 * 1024 * 1024;

    fn template(count: i32, memory: i64) -> AcceleratorTemplate {
        AcceleratorTemplate {
            count,
            memory,
            compute: 100,
            bandwidth: 900,
            model: "sim-accelerator".to_string(),
        }
    }

    fn workload(name: &str, node: &str, memory: Option<&str>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        if let Some(memory) = memory {
            pod.metadata.labels = Some(
                [(
                    "sim.k8s.io/accelerator-memory".to_string(),
                    memory.to_string(),
                )]
                .into(),
            );
        }
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_greedy_max_free_with_lowest_id_ties() {
        let mut cards = build_cards(&template(2, 16 * GI));
        allocate(&mut cards, &[10 * GI, 4 * GI]);
        assert_eq!(cards[0].free_memory, 6 * GI);
        assert_eq!(cards[1].free_memory, 12 * GI);

        let status = AcceleratorInventoryStatus::from_cards(cards);
        assert_eq!(status.free_memory, 18 * GI);
        assert_eq!(status.total_memory, 32 * GI);
    }

    #[test]
    fn test_overcommit_goes_negative() {
        let mut cards = build_cards(&template(1, 4 * GI));
        allocate(&mut cards, &[3 * GI, 3 * GI]);
        assert_eq!(cards[0].free_memory, -2 * GI);
    }

    #[test]
    fn test_allocation_restarts_from_total() {
        let mut cards = build_cards(&template(2, 8 * GI));
        allocate(&mut cards, &[GI]);
        allocate(&mut cards, &[GI]);
        assert_eq!(cards[0].free_memory, 7 * GI);
        assert_eq!(cards[1].free_memory, 8 * GI);
    }

    #[test]
    fn test_requested_memory_parsing() {
        let config = SimConfig::default();
        assert_eq!(requested_memory(&workload("a", "n0", Some("10Gi")), &config), 10 * GI);
        assert_eq!(requested_memory(&workload("b", "n0", Some("1024")), &config), 1024);
        assert_eq!(requested_memory(&workload("c", "n0", None), &config), 0);
        assert_eq!(requested_memory(&workload("d", "n0", Some("lots")), &config), 0);
        assert_eq!(requested_memory(&workload("e", "n0", Some("-1Gi")), &config), 0);
    }

    #[tokio::test]
    async fn test_sync_node_creates_then_updates_inventory() {
        let store = Arc::new(MockObjectStore::new());
        let allocator = AcceleratorAllocator::new(store.clone(), Arc::new(SimConfig::default()));

        for pod in [
            workload("a", "n0", Some("10Gi")),
            workload("b", "n0", Some("4Gi")),
            workload("other", "n1", Some("16Gi")),
        ] {
            create_resource(&*store, &pod).await.unwrap();
        }

        let status = allocator.sync_node("n0", &template(2, 16 * GI)).await.unwrap();
        assert_eq!(status.free_memory, 18 * GI);

        let stored: AcceleratorInventory =
            get_resource(&*store, &AcceleratorInventory::key("", "n0"))
                .await
                .unwrap();
        let frees: Vec<i64> = stored.cards().iter().map(|c| c.free_memory).collect();
        assert_eq!(frees, vec![6 * GI, 12 * GI]);

        // Same snapshot: nothing written
        let before = store.mutation_count();
        allocator.sync_node("n0", &template(2, 16 * GI)).await.unwrap();
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_template_change_rebuilds_cards() {
        let store = Arc::new(MockObjectStore::new());
        let allocator = AcceleratorAllocator::new(store.clone(), Arc::new(SimConfig::default()));

        allocator.sync_node("n0", &template(2, 16 * GI)).await.unwrap();
        let status = allocator.sync_node("n0", &template(4, 8 * GI)).await.unwrap();

        assert_eq!(status.card_count, 4);
        assert_eq!(status.total_memory, 32 * GI);
        assert_eq!(status.free_memory, 32 * GI);
    }

    #[tokio::test]
    async fn test_model_change_rebuilds_cards() {
        let store = Arc::new(MockObjectStore::new());
        let allocator = AcceleratorAllocator::new(store.clone(), Arc::new(SimConfig::default()));

        allocator.sync_node("n0", &template(2, 16 * GI)).await.unwrap();
        let renamed = AcceleratorTemplate {
            model: "sim-h100".to_string(),
            ..template(2, 16 * GI)
        };
        allocator.sync_node("n0", &renamed).await.unwrap();

        let stored: AcceleratorInventory =
            get_resource(&*store, &AcceleratorInventory::key("", "n0"))
                .await
                .unwrap();
        assert!(stored.cards().iter().all(|c| c.model == "sim-h100"));

        let before = store.mutation_count();
        allocator.sync_node("n0", &renamed).await.unwrap();
        assert_eq!(store.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let store = Arc::new(MockObjectStore::new());
        let allocator = AcceleratorAllocator::new(store.clone(), Arc::new(SimConfig::default()));
        store.fail_next_lists(1);
        assert!(allocator.sync_node("n0", &template(1, GI)).await.is_err());
        assert!(store.is_empty().await);
    }

    proptest! {
        #[test]
        fn free_memory_sum_matches_requests(
            count in 1i32..8,
            memory in 1i64..(64 * GI),
            requests in prop::collection::vec(0i64..(64 * GI), 0..8),
        ) {
            let mut cards = build_cards(&template(count, memory));
            allocate(&mut cards, &requests);
            let status = AcceleratorInventoryStatus::from_cards(cards);

            let requested: i64 = requests.iter().sum();
            prop_assert_eq!(status.free_memory, i64::from(count) * memory - requested);
            prop_assert!(status.free_memory <= status.total_memory);
        }
    }
}
