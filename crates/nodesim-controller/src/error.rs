use miette::Diagnostic;
use thiserror::Error;

/// Controller error type for object store access and reconciliation
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Object not found
    #[error("Resource not found: {resource_key}")]
    #[diagnostic(
        code(nodesim::controller::not_found),
        help("The object may have been deleted concurrently. Not-found is treated as a terminal, benign outcome")
    )]
    NotFound {
        #[allow(unused)]
        resource_key: String,
    },

    /// Object already exists
    #[error("Resource already exists: {resource_key}")]
    #[diagnostic(
        code(nodesim::controller::already_exists),
        help("Another writer created the object first. The next reconciliation pass will patch it instead")
    )]
    AlreadyExists {
        #[allow(unused)]
        resource_key: String,
    },

    /// Optimistic concurrency conflict
    #[error("Conflict updating {resource_key}: {message}")]
    #[diagnostic(
        code(nodesim::controller::conflict),
        help("The object changed since it was read. The work item is re-queued with backoff")
    )]
    Conflict {
        #[allow(unused)]
        resource_key: String,
        #[allow(unused)]
        message: String,
    },

    /// The API server answered with a non-success status
    #[error("API request {method} {url} failed with status {status}: {body}")]
    #[diagnostic(
        code(nodesim::controller::api_request_failed),
        help("Check that the NodeFleet and AcceleratorInventory CRDs are installed and that the token has RBAC access to nodes, pods, leases and sim.k8s.io resources")
    )]
    ApiRequestFailed {
        #[allow(unused)]
        method: String,
        #[allow(unused)]
        url: String,
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        body: String,
    },

    /// The request never produced a response
    #[error("Transport error talking to {url}: {message}")]
    #[diagnostic(
        code(nodesim::controller::transport),
        help("Verify --api-url is reachable. Use --insecure for API servers with self-signed certificates")
    )]
    Transport {
        #[allow(unused)]
        url: String,
        #[allow(unused)]
        message: String,
    },

    /// Fleet spec cannot be turned into a node template
    #[error("Invalid fleet {fleet}: {source}")]
    #[diagnostic(
        code(nodesim::controller::invalid_fleet),
        help("Fix the NodeFleet spec. Existing nodes are left untouched until the spec becomes valid")
    )]
    InvalidFleet {
        #[allow(unused)]
        fleet: String,
        #[source]
        source: nodesim_core::NodesimError,
    },

    /// Object could not be converted between JSON and its typed form
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(nodesim::controller::serialization),
        help("The stored object does not match the expected schema")
    )]
    Serialization {
        #[allow(unused)]
        message: String,
    },

    /// Internal error
    #[error("Internal controller error: {message}")]
    #[diagnostic(
        code(nodesim::controller::internal_error),
        help("This is likely a bug in nodesim-controller. Please report it with the full error details")
    )]
    Internal {
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] nodesim_core::NodesimError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn not_found(resource_key: impl ToString) -> Self {
        Self::NotFound {
            resource_key: resource_key.to_string(),
        }
    }

    pub fn already_exists(resource_key: impl ToString) -> Self {
        Self::AlreadyExists {
            resource_key: resource_key.to_string(),
        }
    }

    pub fn conflict(resource_key: impl ToString, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource_key: resource_key.to_string(),
            message: message.into(),
        }
    }

    pub fn api_request_failed(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::ApiRequestFailed {
            method: method.into(),
            url: url.into(),
            status,
            body: body.into(),
        }
    }

    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn invalid_fleet(fleet: impl ToString, source: nodesim_core::NodesimError) -> Self {
        Self::InvalidFleet {
            fleet: fleet.to_string(),
            source,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is the benign not-found case
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying the same work later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::InvalidFleet { .. } => false,
            Self::CoreError(
                nodesim_core::NodesimError::ValidationFailed { .. }
                | nodesim_core::NodesimError::InvalidQuantity { .. }
                | nodesim_core::NodesimError::InvalidKey { .. },
            ) => false,
            _ => true,
        }
    }
}
