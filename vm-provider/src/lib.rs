//! Remote gateway abstraction.
//!
//! The `Gateway` trait is the only seam through which the snapshot core
//! performs network I/O against a vCenter/ESXi host. Session handling and the
//! wire protocol live behind it; callers treat every method as fallible,
//! latency-bearing and (for reads) retryable.

// Standard library
use std::collections::HashSet;

// External crates
use async_trait::async_trait;
use vm_core::error::Result;

pub mod call;
pub mod context;
pub mod models;

// When the `test-helpers` feature is enabled, include the in-memory gateway.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

// Re-export common types for convenience
pub use context::{CallContext, CancelHandle};
pub use models::{ConsolidationReport, InventoryRef, RawSnapshot, SnapshotSpec};
pub use vm_core::error::{Result as VmResult, VmError};

/// The remote operations the snapshot core needs from the hypervisor.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Name of the gateway implementation (e.g. "vsphere", "memory").
    fn name(&self) -> &'static str;

    /// All VMs named `name` inside `datacenter`; empty when there are none.
    async fn find_vm_by_name(&self, datacenter: &str, name: &str) -> Result<Vec<InventoryRef>>;

    /// Full snapshot listing of a VM, one record per snapshot.
    async fn read_snapshot_tree(&self, vm: &InventoryRef) -> Result<Vec<RawSnapshot>>;

    /// Take a snapshot and return its id. The new snapshot becomes current.
    async fn create_snapshot(&self, vm: &InventoryRef, spec: &SnapshotSpec) -> Result<String>;

    /// Remove one snapshot, or the snapshot and its subtree.
    async fn remove_snapshot(
        &self,
        vm: &InventoryRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<()>;

    /// Make `snapshot_id` the VM's current snapshot.
    async fn revert_to_snapshot(&self, vm: &InventoryRef, snapshot_id: &str) -> Result<()>;

    /// Merge orphaned delta disks back into their base.
    async fn consolidate_disks(&self, vm: &InventoryRef) -> Result<ConsolidationReport>;

    /// Create a VM whose disks are deltas on top of `snapshot_id`.
    async fn create_linked_clone(
        &self,
        vm: &InventoryRef,
        snapshot_id: &str,
        clone_name: &str,
    ) -> Result<InventoryRef>;

    /// Destroy a cloned VM. Never touches the backing snapshot.
    async fn remove_clone(&self, clone: &InventoryRef) -> Result<()>;

    /// Privileges `principal` effectively holds on `entity`, directly or via
    /// inherited roles. `None` when the gateway knows nothing about the principal.
    async fn effective_grants(
        &self,
        principal: &str,
        entity: &InventoryRef,
    ) -> Result<Option<HashSet<String>>>;

    /// Whether the guest integration channel (VMware Tools) can quiesce the guest.
    async fn guest_integration_ready(&self, vm: &InventoryRef) -> Result<bool>;
}
