//! The `NodeFleet` custom resource

use crate::{NodesimError, Result};
use k8s_openapi::api::core::v1::{NodeAddress, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const API_VERSION: &str = "sim.k8s.io/v1";
pub const KIND: &str = "NodeFleet";

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Declarative description of a set of identical virtual nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFleet {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeFleetSpec,
}

/// Desired shape of a fleet
///
/// Quantities are kept in their textual form and only parsed when the node
/// template is generated, so a malformed value is reported against the fleet
/// instead of failing deserialization of the whole object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFleetSpec {
    /// Number of virtual nodes
    #[serde(default)]
    pub replicas: i32,
    /// CPU capacity of each node
    pub cpu: Quantity,
    /// Memory capacity of each node
    pub memory: Quantity,
    /// Pod slots of each node
    pub pods: Quantity,
    /// Optional accelerator template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<AcceleratorSpec>,
    /// Pod CIDR blocks; the first one becomes `spec.podCIDR`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_cidrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    /// Extra addresses advertised by every node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
    /// Extra labels applied to every node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Per-node accelerator template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorSpec {
    /// Number of cards
    #[serde(default)]
    pub count: i32,
    /// Memory per card
    pub memory: Quantity,
    /// Compute units per card
    pub compute: Quantity,
    /// Bandwidth per card
    pub bandwidth: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl NodeFleet {
    /// Create a fleet with the given namespace, name and spec
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: NodeFleetSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn fleet_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn fleet_key(&self) -> FleetKey {
        FleetKey::new(self.namespace(), self.fleet_name())
    }

    /// Value of the fleet-identity label: `{namespace}-{name}`
    pub fn identity(&self) -> String {
        format!("{}-{}", self.namespace(), self.fleet_name())
    }

    /// Name of the node at `index`: `{namespace}-{name}-{index}`
    pub fn node_name(&self, index: usize) -> String {
        format!("{}-{}", self.identity(), index)
    }

    /// Index of a node name produced by [`NodeFleet::node_name`], if it is one
    pub fn node_index(&self, node_name: &str) -> Option<usize> {
        let index = node_name
            .strip_prefix(&self.identity())?
            .strip_prefix('-')?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Reject "01" and friends so the name round-trips through node_name
        if index.len() > 1 && index.starts_with('0') {
            return None;
        }
        index.parse().ok()
    }

    /// Desired node count, with negative values treated as zero
    pub fn desired_replicas(&self) -> usize {
        usize::try_from(self.spec.replicas).unwrap_or(0)
    }

    /// Accelerator template, only when at least one card is declared
    pub fn accelerator(&self) -> Option<&AcceleratorSpec> {
        self.spec.accelerator.as_ref().filter(|a| a.count > 0)
    }
}

/// Work-queue key of a fleet: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FleetKey {
    pub namespace: String,
    pub name: String,
}

impl FleetKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(NodesimError::invalid_key(key)),
        }
    }
}

impl fmt::Display for FleetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
