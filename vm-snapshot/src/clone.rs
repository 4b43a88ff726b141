//! Linked clones bound to a source snapshot.
//!
//! A record is kept for every clone this manager creates so that snapshot
//! deletion can refuse to pull the backing disks out from under a clone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::call::mutate;
use vm_provider::InventoryRef;

use crate::manager::{SnapshotManager, VmState};
use crate::privilege::PrivilegeSet;
use crate::request::{Confirmation, RequestContext};

/// Binding between a clone VM and the snapshot its disks are deltas of.
/// Immutable for the clone's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedCloneRecord {
    pub id: Uuid,
    pub clone_name: String,
    pub clone_vm: InventoryRef,
    pub source_vm: InventoryRef,
    pub source_snapshot_id: String,
    pub created_at: DateTime<Utc>,
}

impl SnapshotManager {
    /// Create a linked clone of `source_vm` at `snapshot_id`.
    ///
    /// A blank or missing `clone_name` becomes the configured prefix plus the
    /// source VM name. The snapshot is checked against the cached tree and
    /// then against a fresh remote read while the source VM is held
    /// exclusively, right before the remote call. If it is gone by then the
    /// call fails with `SnapshotVanished` and nothing is created.
    #[instrument(skip(self, ctx), fields(source = %source_vm))]
    pub async fn create_linked_clone(
        &self,
        ctx: &RequestContext,
        source_vm: &InventoryRef,
        snapshot_id: &str,
        clone_name: Option<&str>,
    ) -> Result<LinkedCloneRecord> {
        let clone_name = match clone_name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.config.defaults.clone_name_for(&source_vm.name),
        };

        let call = self.call_context(ctx);
        self.authorize(ctx, &call, source_vm, &PrivilegeSet::create_linked_clone())
            .await?;

        let lock = self.vm_lock(source_vm);
        let mut state = lock.write().await;
        let cached = self.loaded(&call, source_vm, &mut state).await?;
        if !cached.contains(snapshot_id) {
            return Err(if state.vanished.contains(snapshot_id) {
                self.vanished(source_vm, snapshot_id)
            } else {
                VmError::not_found(ObjectKind::Snapshot, snapshot_id)
            });
        }

        let fresh = match self.read_tree(&call, source_vm).await {
            Ok(fresh) => fresh,
            Err(err) => {
                if matches!(err, VmError::CorruptTree { .. }) {
                    state.drop_tree();
                }
                return Err(err);
            }
        };
        let present = fresh.contains(snapshot_id);
        state.install(fresh);
        if !present {
            return Err(self.vanished(source_vm, snapshot_id));
        }

        let creation = self
            .gateway
            .create_linked_clone(source_vm, snapshot_id, &clone_name);
        let clone = match mutate(&call, "createLinkedClone", creation).await {
            Ok(clone) => clone,
            Err(VmError::NotFound {
                kind: ObjectKind::Snapshot,
                ..
            }) => {
                state.drop_tree();
                return Err(self.vanished(source_vm, snapshot_id));
            }
            Err(err) => return Err(err),
        };

        let record = LinkedCloneRecord {
            id: Uuid::new_v4(),
            clone_name,
            clone_vm: clone,
            source_vm: source_vm.clone(),
            source_snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
        };
        self.resolver.invalidate_ref(&record.clone_vm);
        self.lock_clones()
            .insert(record.clone_vm.id.clone(), record.clone());

        info!(
            clone = %record.clone_vm,
            source = %source_vm,
            snapshot = snapshot_id,
            record = %record.id,
            "linked clone created"
        );
        Ok(record)
    }

    /// Destroy a linked clone. Requires a confirmation naming the clone.
    ///
    /// The backing snapshot is never touched, even when no other clone
    /// depends on it. Returns the dropped record when this manager created
    /// the clone.
    #[instrument(skip(self, ctx, confirmation), fields(clone = %clone))]
    pub async fn remove_linked_clone(
        &self,
        ctx: &RequestContext,
        clone: &InventoryRef,
        confirmation: &Confirmation,
    ) -> Result<Option<LinkedCloneRecord>> {
        if !confirmation.confirms(clone) {
            return Err(VmError::ConfirmationRequired {
                operation: "remove linked clone".into(),
                target: clone.name.clone(),
            });
        }

        let call = self.call_context(ctx);
        self.authorize(ctx, &call, clone, &PrivilegeSet::remove_linked_clone())
            .await?;

        let source = self.lock_clones().get(&clone.id).map(|r| r.source_vm.clone());
        let source_lock = source.as_ref().map(|vm| self.vm_lock(vm));
        let _source_guard = match &source_lock {
            Some(lock) => Some(lock.write().await),
            None => None,
        };
        // Operations already running against the clone VM finish first
        let clone_lock = self.vm_lock(clone);
        let mut clone_state = clone_lock.write().await;

        mutate(&call, "removeClone", self.gateway.remove_clone(clone)).await?;

        let record = self.lock_clones().shift_remove(&clone.id);
        if record.is_none() {
            warn!(clone = %clone, "removed a clone this manager has no record of");
        }
        self.resolver.invalidate_ref(clone);
        *clone_state = VmState::default();

        info!(clone = %clone, "linked clone removed");
        Ok(record)
    }

    /// Clone records known to this manager, oldest first, optionally limited
    /// to one source VM.
    pub fn linked_clones(&self, source: Option<&InventoryRef>) -> Vec<LinkedCloneRecord> {
        self.lock_clones()
            .values()
            .filter(|r| match source {
                Some(vm) => r.source_vm.id == vm.id,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn vanished(&self, vm: &InventoryRef, snapshot_id: &str) -> VmError {
        warn!(vm = %vm, snapshot = snapshot_id, "source snapshot disappeared before clone creation");
        VmError::SnapshotVanished {
            vm: vm.id.clone(),
            snapshot_id: snapshot_id.to_string(),
        }
    }
}
