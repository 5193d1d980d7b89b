//! Simulation constants shared by every component

use crate::fleet::NodeFleet;
use k8s_openapi::api::core::v1::NodeSystemInfo;
use std::collections::BTreeMap;

/// Labels, keys and fixed values used throughout the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Label marking nodes and workloads managed by the simulator
    pub managed_label_key: String,
    pub managed_label_value: String,
    /// Label carrying `{namespace}-{name}` of the owning fleet
    pub fleet_label_key: String,
    /// Annotation carrying `{namespace}/{name}` of the owning fleet
    pub fleet_annotation_key: String,
    /// Finalizer placed on fleets while they own nodes
    pub finalizer: String,
    /// Namespace holding node leases
    pub lease_namespace: String,
    pub lease_duration_secs: i32,
    /// Workload label holding the requested accelerator memory
    pub accelerator_memory_label: String,
    pub accelerator_count_resource: String,
    pub accelerator_memory_resource: String,
    pub accelerator_compute_resource: String,
    pub accelerator_bandwidth_resource: String,
    /// Model used when a fleet does not name one
    pub default_accelerator_model: String,
    pub node_info: NodeSystemInfoConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            managed_label_key: "sim.k8s.io/managed".to_string(),
            managed_label_value: "true".to_string(),
            fleet_label_key: "sim.k8s.io/id".to_string(),
            fleet_annotation_key: "sim.k8s.io/fleet".to_string(),
            finalizer: "sim.k8s.io/node-fleet".to_string(),
            lease_namespace: "kube-node-lease".to_string(),
            lease_duration_secs: 40,
            accelerator_memory_label: "sim.k8s.io/accelerator-memory".to_string(),
            accelerator_count_resource: "sim.k8s.io/accelerator-count".to_string(),
            accelerator_memory_resource: "sim.k8s.io/accelerator-memory".to_string(),
            accelerator_compute_resource: "sim.k8s.io/accelerator-compute".to_string(),
            accelerator_bandwidth_resource: "sim.k8s.io/accelerator-bandwidth".to_string(),
            default_accelerator_model: "sim-accelerator".to_string(),
            node_info: NodeSystemInfoConfig::default(),
        }
    }
}

impl SimConfig {
    /// Selector matching every managed object
    pub fn managed_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            self.managed_label_key.clone(),
            self.managed_label_value.clone(),
        )])
    }

    /// Selector matching the nodes owned by `fleet`
    pub fn fleet_selector(&self, fleet: &NodeFleet) -> BTreeMap<String, String> {
        let mut selector = self.managed_selector();
        selector.insert(self.fleet_label_key.clone(), fleet.identity());
        selector
    }

    /// Whether a label set carries the management label
    pub fn is_managed(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        labels
            .and_then(|l| l.get(&self.managed_label_key))
            .is_some_and(|v| *v == self.managed_label_value)
    }

    /// The four accelerator resource names, in count/memory/compute/bandwidth order
    pub fn accelerator_resources(&self) -> [&str; 4] {
        [
            self.accelerator_count_resource.as_str(),
            self.accelerator_memory_resource.as_str(),
            self.accelerator_compute_resource.as_str(),
            self.accelerator_bandwidth_resource.as_str(),
        ]
    }
}

/// System information reported by every virtual node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSystemInfoConfig {
    pub operating_system: String,
    pub architecture: String,
    pub os_image: String,
    pub kernel_version: String,
    pub kubelet_version: String,
    pub container_runtime_version: String,
}

impl Default for NodeSystemInfoConfig {
    fn default() -> Self {
        Self {
            operating_system: "linux".to_string(),
            architecture: "amd64".to_string(),
            os_image: "CentOS Linux 7 (Core)".to_string(),
            kernel_version: "3.10.0.el7.x86_64".to_string(),
            kubelet_version: "v1.19.1".to_string(),
            container_runtime_version: "docker://18.6.3".to_string(),
        }
    }
}

impl NodeSystemInfoConfig {
    /// Render as the Node status field; kube-proxy reports the kubelet version
    pub fn to_node_system_info(&self) -> NodeSystemInfo {
        NodeSystemInfo {
            operating_system: self.operating_system.clone(),
            architecture: self.architecture.clone(),
            os_image: self.os_image.clone(),
            kernel_version: self.kernel_version.clone(),
            kubelet_version: self.kubelet_version.clone(),
            kube_proxy_version: self.kubelet_version.clone(),
            container_runtime_version: self.container_runtime_version.clone(),
            ..Default::default()
        }
    }
}
