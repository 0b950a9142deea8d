//! Node presence record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

const ADDRESS_FIELD: &str = "address";
const REGISTERED_AT_FIELD: &str = "registered_at";
const LAST_HEARTBEAT_FIELD: &str = "last_heartbeat";

/// A node's presence claim, as stored under `nodes:{node_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node identifier
    pub node_id: String,
    /// Address the node serves requests on
    pub address: String,
    /// When the node first registered, in ms since the epoch
    pub registered_at_ms: u64,
    /// When the record was last renewed, in ms since the epoch
    pub last_heartbeat_ms: u64,
}

impl NodeRecord {
    /// A freshly registered record.
    pub fn new(node_id: &str, address: &str, now_ms: u64) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            registered_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
        }
    }

    /// The same record renewed at `now_ms`.
    pub fn renewed(&self, now_ms: u64) -> Self {
        Self {
            last_heartbeat_ms: now_ms,
            ..self.clone()
        }
    }

    /// Hash fields written to the store.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (ADDRESS_FIELD, self.address.clone()),
            (REGISTERED_AT_FIELD, self.registered_at_ms.to_string()),
            (LAST_HEARTBEAT_FIELD, self.last_heartbeat_ms.to_string()),
        ]
    }

    /// Rebuild a record from stored hash fields.
    ///
    /// Returns `None` when the hash is empty or the address is missing.
    /// Unparseable timestamps read as 0.
    pub fn from_fields(node_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let address = fields.get(ADDRESS_FIELD)?;
        let millis = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Some(Self {
            node_id: node_id.to_string(),
            address: address.clone(),
            registered_at_ms: millis(REGISTERED_AT_FIELD),
            last_heartbeat_ms: millis(LAST_HEARTBEAT_FIELD),
        })
    }
}
