//! Snapshot removal: single node, subtree, or everything.

use tracing::{info, instrument, warn};
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::call::mutate;
use vm_provider::InventoryRef;

use crate::manager::SnapshotManager;
use crate::privilege::PrivilegeSet;
use crate::request::{Confirmation, RequestContext};
use crate::tree::SnapshotNode;

impl SnapshotManager {
    /// Remove one snapshot, or with `cascade` its whole subtree.
    ///
    /// Cascading removal needs a confirmation naming the VM. Children of a
    /// node removed without cascade move up to its former parent. Returns
    /// the removed nodes.
    #[instrument(skip(self, ctx, confirmation), fields(vm = %vm))]
    pub async fn delete_snapshot(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
        snapshot_id: &str,
        cascade: bool,
        confirmation: &Confirmation,
    ) -> Result<Vec<SnapshotNode>> {
        if cascade && !confirmation.confirms(vm) {
            return Err(VmError::ConfirmationRequired {
                operation: "cascading snapshot delete".into(),
                target: vm.name.clone(),
            });
        }

        let call = self.call_context(ctx);
        self.authorize(ctx, &call, vm, &PrivilegeSet::delete_snapshot())
            .await?;

        let lock = self.vm_lock(vm);
        let mut state = lock.write().await;
        let tree = self.loaded(&call, vm, &mut state).await?.clone();

        if !tree.contains(snapshot_id) {
            return Err(VmError::not_found(ObjectKind::Snapshot, snapshot_id));
        }
        let doomed = if cascade {
            tree.subtree_ids(snapshot_id)
        } else {
            vec![snapshot_id.to_string()]
        };
        if let Some(err) = self.dependent_clones(vm, &doomed) {
            return Err(err);
        }

        let removal = self.gateway.remove_snapshot(vm, snapshot_id, cascade);
        if let Err(err) = mutate(&call, "removeSnapshot", removal).await {
            self.note_remote_failure(vm, &mut state, &err);
            return Err(err);
        }

        let mut expected = tree;
        let (removed, expected) = match expected.apply_delete(snapshot_id, cascade) {
            Ok(removed) => (removed, Ok(expected)),
            Err(err) => (Vec::new(), Err(err)),
        };
        state.forget(removed.iter().map(|n| n.id.clone()));
        self.commit(&call, vm, &mut state, expected, "removeSnapshot")
            .await;

        info!(
            vm = %vm,
            snapshot = snapshot_id,
            cascade,
            removed = removed.len(),
            "snapshot deleted"
        );
        Ok(removed)
    }

    /// Remove every snapshot of the VM. Requires a confirmation naming the
    /// VM. Afterwards the tree is empty and no snapshot is current.
    ///
    /// There is no remote "remove all" transaction: roots are removed one by
    /// one with their subtrees. If a removal fails partway the error is
    /// returned and the cached tree is dropped, since some roots are already
    /// gone.
    #[instrument(skip(self, ctx, confirmation), fields(vm = %vm))]
    pub async fn delete_all(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
        confirmation: &Confirmation,
    ) -> Result<Vec<SnapshotNode>> {
        if !confirmation.confirms(vm) {
            return Err(VmError::ConfirmationRequired {
                operation: "delete all snapshots".into(),
                target: vm.name.clone(),
            });
        }

        let call = self.call_context(ctx);
        self.authorize(ctx, &call, vm, &PrivilegeSet::delete_snapshot())
            .await?;

        let lock = self.vm_lock(vm);
        let mut state = lock.write().await;
        let tree = self.loaded(&call, vm, &mut state).await?.clone();

        let everything: Vec<String> = tree.ids().map(str::to_string).collect();
        if let Some(err) = self.dependent_clones(vm, &everything) {
            return Err(err);
        }
        if tree.is_empty() {
            info!(vm = %vm, "no snapshots to delete");
            return Ok(Vec::new());
        }

        let roots: Vec<String> = tree.roots().map(|n| n.id.clone()).collect();
        for (done, root) in roots.iter().enumerate() {
            let removal = self.gateway.remove_snapshot(vm, root, true);
            if let Err(err) = mutate(&call, "removeSnapshot", removal).await {
                if done > 0 {
                    warn!(
                        vm = %vm,
                        removed_roots = done,
                        total_roots = roots.len(),
                        error = %err,
                        "delete-all stopped partway; cached tree dropped"
                    );
                    let gone = roots[..done].iter().flat_map(|id| tree.subtree_ids(id));
                    state.forget(gone);
                    state.drop_tree();
                } else {
                    self.note_remote_failure(vm, &mut state, &err);
                }
                return Err(err);
            }
        }

        let mut expected = tree;
        let removed = expected.clear();
        state.forget(removed.iter().map(|n| n.id.clone()));
        self.commit(&call, vm, &mut state, Ok(expected), "removeAllSnapshots")
            .await;

        info!(vm = %vm, removed = removed.len(), "all snapshots deleted");
        Ok(removed)
    }
}
