// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod allocator;
pub mod api_client;
pub mod error;
pub mod fleet_controller;
pub mod heartbeat;
pub mod mock;
pub mod node_status;
pub mod parallel;
pub mod pod_status;
pub mod store;
pub mod template;
pub mod traits;
pub mod workqueue;

// Re-export primary types
pub use error::{ControllerError, Result};
pub use mock::MockObjectStore;
pub use traits::{ListParams, ObjectStore};

// Re-export store backends and helpers
pub use api_client::{ApiClient, ApiClientConfig};
pub use store::{
    create_resource, delete_if_exists, find_resource, get_resource, list_resources,
    patch_resource, update_resource,
};

// Re-export the simulation building blocks
pub use allocator::{allocate, AcceleratorAllocator};
pub use parallel::parallelize;
pub use template::{generate, AcceleratorTemplate, NodeTemplate};
pub use workqueue::WorkQueue;

// Re-export the control loops
pub use fleet_controller::{FleetController, FleetControllerConfig};
pub use heartbeat::{HeartbeatConfig, HeartbeatUpdater};
pub use pod_status::{PodStatusFaker, PodStatusFakerConfig};
