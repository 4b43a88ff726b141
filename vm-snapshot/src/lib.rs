//! vSphere snapshot and linked clone management
//!
//! Resolves VMs by name, gates every mutation behind a privilege check, keeps
//! a validated in-memory model of each VM's snapshot forest, and creates or
//! removes linked clones bound to a specific snapshot. All remote work goes
//! through the `vm_provider::Gateway` trait.

pub mod clone;
pub mod consolidate;
pub mod create;
pub mod delete;
pub mod inventory;
pub mod manager;
pub mod privilege;
pub mod request;
pub mod restore;
pub mod tree;

// Re-export key types
pub use clone::LinkedCloneRecord;
pub use consolidate::ConsolidateOutcome;
pub use create::default_snapshot_name;
pub use inventory::InventoryResolver;
pub use manager::SnapshotManager;
pub use privilege::{PrivilegeSet, PrivilegeValidator, ValidationResult};
pub use request::{Confirmation, CreateSnapshotRequest, RequestContext};
pub use tree::{NodeShape, SnapshotNode, SnapshotTree, TreeEntry};
pub use vm_provider::{CallContext, CancelHandle, Gateway, InventoryRef};
