//! RFC 6902 JSON patch documents, built as partial sub-resource updates

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSON patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

/// An ordered list of patch operations, serialized as a JSON array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(pub Vec<PatchOp>);

impl JsonPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an `add` operation
    pub fn add(mut self, path: impl Into<String>, value: Value) -> Self {
        self.0.push(PatchOp::Add {
            path: path.into(),
            value,
        });
        self
    }

    /// Append a `replace` operation
    pub fn replace(mut self, path: impl Into<String>, value: Value) -> Self {
        self.0.push(PatchOp::Replace {
            path: path.into(),
            value,
        });
        self
    }

    /// Append a `remove` operation
    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.0.push(PatchOp::Remove { path: path.into() });
        self
    }

    /// `replace` when the target exists, `add` otherwise (replace fails on a missing member)
    pub fn set(self, path: impl Into<String>, value: Value, exists: bool) -> Self {
        if exists {
            self.replace(path, value)
        } else {
            self.add(path, value)
        }
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every operation stays inside `/status`
    pub fn targets_status(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|op| op.path() == "/status" || op.path().starts_with("/status/"))
    }
}
