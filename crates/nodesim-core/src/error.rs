// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use crate::resources::QuantityError;
use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Nodesim resource handling
#[derive(Error, Debug, Diagnostic)]
pub enum NodesimError {
    /// Invalid resource key
    #[error("Invalid resource key: {key}")]
    #[diagnostic(
        code(nodesim::invalid_key),
        help("Fleet keys have the form '<namespace>/<name>'")
    )]
    InvalidKey {
        #[allow(unused)]
        key: String,
    },

    /// Validation failed
    #[error("Validation failed for {resource_type}: {details}")]
    #[diagnostic(code(nodesim::validation_failed), help("{help_text}"))]
    ValidationFailed {
        #[allow(unused)]
        resource_type: String,
        #[allow(unused)]
        details: String,
        #[allow(unused)]
        help_text: String,
    },

    /// A resource quantity field could not be parsed
    #[error("Invalid quantity in field '{field}': {source}")]
    #[diagnostic(
        code(nodesim::invalid_quantity),
        help("Use Kubernetes quantity syntax, e.g. '4', '500m', '8Gi' or '1e3'")
    )]
    InvalidQuantity {
        #[allow(unused)]
        field: String,
        #[source]
        source: QuantityError,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(nodesim::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for Nodesim core operations
pub type Result<T> = std::result::Result<T, NodesimError>;

impl NodesimError {
    /// Create an InvalidKey error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create a ValidationFailed error
    pub fn validation_failed(
        resource_type: impl Into<String>,
        details: impl Into<String>,
        help_text: impl Into<String>,
    ) -> Self {
        Self::ValidationFailed {
            resource_type: resource_type.into(),
            details: details.into(),
            help_text: help_text.into(),
        }
    }

    /// Create an InvalidQuantity error
    pub fn invalid_quantity(field: impl Into<String>, source: QuantityError) -> Self {
        Self::InvalidQuantity {
            field: field.into(),
            source,
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = NodesimError::invalid_key("no-slash");
        assert!(matches!(err, NodesimError::InvalidKey { .. }));

        let err = NodesimError::validation_failed(
            "NodeFleet",
            "replicas must not be negative",
            "Set spec.replicas to 0 or more",
        );
        assert!(matches!(err, NodesimError::ValidationFailed { .. }));
    }

    #[test]
    fn test_invalid_quantity_names_field() {
        let err = NodesimError::invalid_quantity("spec.cpu", QuantityError::Empty);
        assert!(err.to_string().contains("spec.cpu"));
    }
}
