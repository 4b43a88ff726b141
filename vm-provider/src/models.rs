//! Wire-neutral data exchanged with the remote gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable reference to an inventory object (VM, datacenter).
///
/// `id` is the managed object id (e.g. `vm-101`); `name` is the display name
/// at resolution time and may go stale after a rename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryRef {
    pub id: String,
    pub name: String,
}

impl InventoryRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InventoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// One snapshot as reported by a remote tree read.
///
/// Reads are flat; the core rebuilds and validates the forest
/// itself instead of trusting a nested remote structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub includes_memory: bool,
    #[serde(default)]
    pub quiesced: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_current: bool,
}

/// Parameters of a remote snapshot creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
    pub include_memory: bool,
    pub quiesce: bool,
}

/// Result of a remote disk consolidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub did_work: bool,
}
