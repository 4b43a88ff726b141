//! Revert a VM to one of its snapshots

use tracing::{info, instrument};
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::call::mutate;
use vm_provider::InventoryRef;

use crate::manager::SnapshotManager;
use crate::privilege::PrivilegeSet;
use crate::request::RequestContext;
use crate::tree::SnapshotNode;

impl SnapshotManager {
    /// Make `snapshot_id` current. The tree shape does not change.
    ///
    /// The id must be in the loaded tree; otherwise this fails with
    /// `NotFound` and the caller should reload.
    #[instrument(skip(self, ctx), fields(vm = %vm))]
    pub async fn revert_to(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
        snapshot_id: &str,
    ) -> Result<SnapshotNode> {
        let call = self.call_context(ctx);
        self.authorize(ctx, &call, vm, &PrivilegeSet::revert_snapshot())
            .await?;

        let lock = self.vm_lock(vm);
        let mut state = lock.write().await;
        let tree = self.loaded(&call, vm, &mut state).await?.clone();
        let target = tree
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, snapshot_id))?;

        let revert = self.gateway.revert_to_snapshot(vm, snapshot_id);
        if let Err(err) = mutate(&call, "revertToSnapshot", revert).await {
            self.note_remote_failure(vm, &mut state, &err);
            return Err(err);
        }

        let mut expected = tree;
        let reverted = expected.apply_revert(snapshot_id).map(|_| ());
        let expected = reverted.map(|()| expected);
        self.commit(&call, vm, &mut state, expected, "revertToSnapshot")
            .await;

        let node = state
            .tree
            .as_ref()
            .and_then(|t| t.get(snapshot_id))
            .cloned()
            .unwrap_or(SnapshotNode {
                is_current: true,
                ..target
            });
        info!(vm = %vm, snapshot = %node.name, id = snapshot_id, "reverted to snapshot");
        Ok(node)
    }
}
