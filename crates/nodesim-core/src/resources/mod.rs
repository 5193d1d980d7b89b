pub mod quantities;

pub use quantities::{QuantityError, QuantityFormat, ResourceQuantity};

use crate::accelerator::AcceleratorInventory;
use crate::fleet::NodeFleet;
use crate::{GroupVersionKind, ResourceKey};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

    if !is_valid_name(name) {
        return Err(ResourceError::InvalidName(name.clone()));
    }

    Ok(())
}

/// Trait for the Kubernetes resources the simulator reads and writes
pub trait Resource: Serialize + for<'de> Deserialize<'de> + Send + Sync {
    /// apiVersion of this resource type
    const API_VERSION: &'static str;

    /// kind of this resource type
    const KIND: &'static str;

    /// Whether objects of this type live in a namespace
    const NAMESPACED: bool;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Get the GroupVersionKind of this resource type
    fn gvk() -> GroupVersionKind
    where
        Self: Sized,
    {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Build the key of an object of this type. `namespace` is ignored for
    /// cluster-scoped types.
    fn key(namespace: &str, name: &str) -> ResourceKey
    where
        Self: Sized,
    {
        if Self::NAMESPACED {
            ResourceKey::new(Self::gvk(), namespace, name)
        } else {
            ResourceKey::cluster_scoped(Self::gvk(), name)
        }
    }

    /// Get the ResourceKey of this object
    fn resource_key(&self) -> Result<ResourceKey, ResourceError>
    where
        Self: Sized,
    {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

        if Self::NAMESPACED {
            let namespace = metadata
                .namespace
                .as_ref()
                .ok_or_else(|| ResourceError::InvalidNamespace(name.clone()))?;
            Ok(ResourceKey::new(Self::gvk(), namespace, name))
        } else {
            Ok(ResourceKey::cluster_scoped(Self::gvk(), name))
        }
    }

    /// Object name, if set
    fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    /// Value of a label, if present
    fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Value of an annotation, if present
    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Whether the object carries the given finalizer
    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == finalizer))
    }

    /// Whether deletion has been requested (deletionTimestamp is set)
    fn is_being_deleted(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Namespaced resource {0} has no namespace")]
    InvalidNamespace(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a Kubernetes resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    // Must contain only lowercase alphanumeric, '-', or '.'
    // Must start and end with alphanumeric
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|&b| alnum(b) || b == b'-' || b == b'.')
}

macro_rules! impl_resource {
    ($ty:ty, $api_version:expr, $kind:expr, $namespaced:expr) => {
        impl Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;
            const NAMESPACED: bool = $namespaced;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Node, "v1", "Node", false);
impl_resource!(Pod, "v1", "Pod", true);
impl_resource!(Lease, "coordination.k8s.io/v1", "Lease", true);
impl_resource!(
    AcceleratorInventory,
    crate::accelerator::API_VERSION,
    crate::accelerator::KIND,
    false
);

impl Resource for NodeFleet {
    const API_VERSION: &'static str = crate::fleet::API_VERSION;
    const KIND: &'static str = crate::fleet::KIND;
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata)?;

        if self.metadata.namespace.is_none() {
            return Err(ResourceError::MissingField("metadata.namespace".to_string()));
        }

        if self.spec.replicas < 0 {
            return Err(ResourceError::ValidationFailed(format!(
                "spec.replicas must not be negative, got {}",
                self.spec.replicas
            )));
        }

        if let Some(accelerator) = &self.spec.accelerator {
            if accelerator.count < 0 {
                return Err(ResourceError::ValidationFailed(format!(
                    "spec.accelerator.count must not be negative, got {}",
                    accelerator.count
                )));
            }
        }

        Ok(())
    }
}
