//! Nodesim Core - Resource model for the virtual node fleet simulator
//!
//! This crate provides:
//! - The `NodeFleet` and `AcceleratorInventory` custom resources
//! - Type-safe resource keys and the `Resource` trait over k8s-openapi types
//! - Exact resource quantity arithmetic
//! - Simulation constants (`SimConfig`) and JSON patch building
//! - Error types with miette diagnostics

pub mod accelerator;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod patch;
pub mod resources;
pub mod types;

use serde::Deserialize;

// Re-export commonly used types
pub use accelerator::{
    AcceleratorCard, AcceleratorInventory, AcceleratorInventorySpec, AcceleratorInventoryStatus,
};
pub use config::{NodeSystemInfoConfig, SimConfig};
pub use error::{NodesimError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use fleet::{AcceleratorSpec, FleetKey, NodeFleet, NodeFleetSpec};
pub use patch::{JsonPatch, PatchOp};
pub use resources::{
    is_valid_name, QuantityError, QuantityFormat, Resource, ResourceError, ResourceQuantity,
};
pub use types::{GroupVersionKind, ResourceKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::coordination::v1::Lease;
pub use k8s_openapi::api::core::v1::{Node, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a resource to a JSON value
pub fn to_value<T: serde::Serialize>(resource: &T) -> Result<serde_json::Value> {
    serde_json::to_value(resource).map_err(|e| {
        NodesimError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from a JSON value
pub fn from_value<T: for<'de> serde::Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        NodesimError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize every resource in a (possibly multi-document) YAML string
pub fn from_yaml_documents<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            NodesimError::serialization_error(
                format!("Failed to parse YAML document: {}", e),
                Some(Box::new(e)),
            )
        })?;
        if value.is_null() {
            continue;
        }
        let resource = serde_yaml::from_value(value).map_err(|e| {
            NodesimError::serialization_error(
                format!("Failed to deserialize from YAML: {}", e),
                Some(Box::new(e)),
            )
        })?;
        out.push(resource);
    }
    Ok(out)
}
