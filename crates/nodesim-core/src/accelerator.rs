//! The `AcceleratorInventory` custom resource

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "sim.k8s.io/v1";
pub const KIND: &str = "AcceleratorInventory";

/// Health reported for every simulated card
pub const HEALTHY: &str = "Healthy";

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Simulated accelerator cards of one virtual node (named after the node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInventory {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: AcceleratorInventorySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AcceleratorInventoryStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInventorySpec {
    /// Node the cards belong to
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInventoryStatus {
    #[serde(default)]
    pub cards: Vec<AcceleratorCard>,
    #[serde(default)]
    pub card_count: i32,
    /// Sum of card total memory, in bytes
    #[serde(default)]
    pub total_memory: i64,
    /// Sum of card free memory, in bytes (negative when over-committed)
    #[serde(default)]
    pub free_memory: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorCard {
    pub id: i32,
    pub health: String,
    pub model: String,
    /// Bytes
    pub total_memory: i64,
    /// Bytes, may go negative
    pub free_memory: i64,
    pub compute_units: i64,
    pub bandwidth: i64,
}

impl AcceleratorCard {
    /// A healthy card with all of its memory free
    pub fn new(
        id: i32,
        model: impl Into<String>,
        total_memory: i64,
        compute_units: i64,
        bandwidth: i64,
    ) -> Self {
        Self {
            id,
            health: HEALTHY.to_string(),
            model: model.into(),
            total_memory,
            free_memory: total_memory,
            compute_units,
            bandwidth,
        }
    }
}

impl AcceleratorInventoryStatus {
    /// Build a status from a card list, deriving the aggregate sums
    pub fn from_cards(cards: Vec<AcceleratorCard>) -> Self {
        let mut status = Self {
            cards,
            ..Default::default()
        };
        status.recompute_totals();
        status
    }

    /// Re-derive card count and memory sums from the card list
    pub fn recompute_totals(&mut self) {
        self.card_count = i32::try_from(self.cards.len()).unwrap_or(i32::MAX);
        self.total_memory = self
            .cards
            .iter()
            .fold(0i64, |sum, c| sum.saturating_add(c.total_memory));
        self.free_memory = self
            .cards
            .iter()
            .fold(0i64, |sum, c| sum.saturating_add(c.free_memory));
    }
}

impl AcceleratorInventory {
    /// Create the inventory of `node_name`
    pub fn new(node_name: impl Into<String>, status: AcceleratorInventoryStatus) -> Self {
        let node_name = node_name.into();
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(node_name.clone()),
                ..Default::default()
            },
            spec: AcceleratorInventorySpec { node_name },
            status: Some(status),
        }
    }

    /// Cards currently recorded, empty when no status has been written
    pub fn cards(&self) -> &[AcceleratorCard] {
        self.status.as_ref().map(|s| s.cards.as_slice()).unwrap_or_default()
    }
}
