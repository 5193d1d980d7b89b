//! Node template generation from a fleet spec
//!
//! Everything here is pure: the same fleet and config always produce the same
//! node. Timestamps (conditions, leases) are stamped by the callers that write
//! to the store.

use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use nodesim_core::{
    Node, NodeFleet, NodesimError, ObjectMeta, QuantityFormat, Resource, ResourceQuantity,
    SimConfig,
};
use std::collections::BTreeMap;

/// Well-known hostname label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Per-card accelerator shape, in whole units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorTemplate {
    pub count: i32,
    /// Bytes per card
    pub memory: i64,
    pub compute: i64,
    pub bandwidth: i64,
    pub model: String,
}

impl AcceleratorTemplate {
    /// Rebuild the template from the accelerator resources a node advertises
    ///
    /// Returns `None` when the node advertises no cards.
    pub fn from_capacity(
        capacity: &BTreeMap<String, Quantity>,
        config: &SimConfig,
    ) -> Option<Self> {
        let units = |name: &str| -> Option<i64> {
            capacity
                .get(name)
                .and_then(|q| ResourceQuantity::try_from(q).ok())
                .and_then(|q| q.to_i64())
        };

        let count = i32::try_from(units(&config.accelerator_count_resource)?).ok()?;
        if count <= 0 {
            return None;
        }

        Some(Self {
            count,
            memory: units(&config.accelerator_memory_resource).unwrap_or(0),
            compute: units(&config.accelerator_compute_resource).unwrap_or(0),
            bandwidth: units(&config.accelerator_bandwidth_resource).unwrap_or(0),
            model: config.default_accelerator_model.clone(),
        })
    }
}

/// A validated node descriptor shared by every replica of a fleet
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    node: Node,
    accelerator: Option<AcceleratorTemplate>,
}

impl NodeTemplate {
    /// The unnamed node descriptor
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn accelerator(&self) -> Option<&AcceleratorTemplate> {
        self.accelerator.as_ref()
    }

    /// Desired `spec` of every node of the fleet
    pub fn spec(&self) -> Option<&NodeSpec> {
        self.node.spec.as_ref()
    }

    /// Capacity advertised by every node of the fleet
    pub fn capacity(&self) -> Option<&BTreeMap<String, Quantity>> {
        self.node.status.as_ref().and_then(|s| s.capacity.as_ref())
    }

    /// Produce the node with the given name
    pub fn materialize(&self, name: &str) -> Node {
        let mut node = self.node.clone();
        node.metadata.name = Some(name.to_string());
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(HOSTNAME_LABEL.to_string(), name.to_string());

        if let Some(status) = node.status.as_mut() {
            status
                .addresses
                .get_or_insert_with(Vec::new)
                .push(NodeAddress {
                    type_: "Hostname".to_string(),
                    address: name.to_string(),
                });
        }
        node
    }
}

fn parse_quantity(field: &str, quantity: &Quantity) -> nodesim_core::Result<ResourceQuantity> {
    let parsed = ResourceQuantity::try_from(quantity)
        .map_err(|e| NodesimError::invalid_quantity(field, e))?;
    if parsed.is_negative() {
        return Err(NodesimError::validation_failed(
            NodeFleet::KIND,
            format!("{} must not be negative, got {}", field, quantity.0),
            format!("Set {} to zero or a positive quantity", field),
        ));
    }
    Ok(parsed)
}

fn whole_units(field: &str, quantity: &ResourceQuantity) -> nodesim_core::Result<i64> {
    quantity.to_i64().ok_or_else(|| {
        NodesimError::validation_failed(
            NodeFleet::KIND,
            format!("{} is out of range: {}", field, quantity),
            "Use a smaller quantity",
        )
    })
}

/// Turn a fleet spec into the node template shared by all of its replicas
///
/// Fails when the fleet is structurally invalid or any quantity does not
/// parse, before anything is written to the store.
pub fn generate(fleet: &NodeFleet, config: &SimConfig) -> nodesim_core::Result<NodeTemplate> {
    fleet.validate().map_err(|e| {
        NodesimError::validation_failed(
            NodeFleet::KIND,
            e.to_string(),
            "Fleets need a namespace, a DNS-compatible name and non-negative counts",
        )
    })?;

    let spec = &fleet.spec;
    let cpu = parse_quantity("spec.cpu", &spec.cpu)?;
    let memory = parse_quantity("spec.memory", &spec.memory)?;
    let pods = parse_quantity("spec.pods", &spec.pods)?;

    let mut capacity = BTreeMap::from([
        ("cpu".to_string(), cpu.to_quantity()),
        ("memory".to_string(), memory.to_quantity()),
        ("pods".to_string(), pods.to_quantity()),
    ]);

    let accelerator = match fleet.accelerator() {
        Some(acc) => {
            let memory = parse_quantity("spec.accelerator.memory", &acc.memory)?;
            let compute = parse_quantity("spec.accelerator.compute", &acc.compute)?;
            let bandwidth = parse_quantity("spec.accelerator.bandwidth", &acc.bandwidth)?;

            capacity.insert(
                config.accelerator_count_resource.clone(),
                ResourceQuantity::from_units(i64::from(acc.count), QuantityFormat::DecimalSI)
                    .to_quantity(),
            );
            capacity.insert(config.accelerator_memory_resource.clone(), memory.to_quantity());
            capacity.insert(config.accelerator_compute_resource.clone(), compute.to_quantity());
            capacity.insert(
                config.accelerator_bandwidth_resource.clone(),
                bandwidth.to_quantity(),
            );

            Some(AcceleratorTemplate {
                count: acc.count,
                memory: whole_units("spec.accelerator.memory", &memory)?,
                compute: whole_units("spec.accelerator.compute", &compute)?,
                bandwidth: whole_units("spec.accelerator.bandwidth", &bandwidth)?,
                model: acc
                    .model
                    .clone()
                    .unwrap_or_else(|| config.default_accelerator_model.clone()),
            })
        }
        None => None,
    };

    // Fleet labels first; the management labels always win
    let mut labels = spec.labels.clone();
    labels.insert(
        config.managed_label_key.clone(),
        config.managed_label_value.clone(),
    );
    labels.insert(config.fleet_label_key.clone(), fleet.identity());

    let annotations = BTreeMap::from([(
        config.fleet_annotation_key.clone(),
        fleet.fleet_key().to_string(),
    )]);

    let node = Node {
        metadata: ObjectMeta {
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            pod_cidr: spec.pod_cidrs.first().cloned(),
            pod_cidrs: (!spec.pod_cidrs.is_empty()).then(|| spec.pod_cidrs.clone()),
            taints: (!spec.taints.is_empty()).then(|| spec.taints.clone()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            allocatable: Some(capacity.clone()),
            capacity: Some(capacity),
            node_info: Some(config.node_info.to_node_system_info()),
            addresses: Some(spec.addresses.clone()),
            ..Default::default()
        }),
    };

    Ok(NodeTemplate { node, accelerator })
}
