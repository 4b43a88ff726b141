//! Snapshot creation

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use vm_core::error::{Result, VmError};
use vm_provider::call::{mutate, read_with_retry};
use vm_provider::{InventoryRef, SnapshotSpec};

use crate::manager::SnapshotManager;
use crate::privilege::PrivilegeSet;
use crate::request::{CreateSnapshotRequest, RequestContext};
use crate::tree::SnapshotNode;

/// Name used when the caller supplies none: `snapshot-YYYY-MM-DD-HHMMSS` (UTC).
pub fn default_snapshot_name(now: DateTime<Utc>) -> String {
    now.format("snapshot-%Y-%m-%d-%H%M%S").to_string()
}

impl SnapshotManager {
    /// Take a snapshot. The new node becomes current, as a child of the
    /// previous current node or as a new root.
    #[instrument(skip(self, ctx, request), fields(vm = %vm, quiesce = request.quiesce))]
    pub async fn create_snapshot(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
        request: CreateSnapshotRequest,
    ) -> Result<SnapshotNode> {
        let call = self.call_context(ctx);
        self.authorize(ctx, &call, vm, &PrivilegeSet::create_snapshot())
            .await?;

        let name = match request.name.trim() {
            "" => default_snapshot_name(Utc::now()),
            given => given.to_string(),
        };

        let lock = self.vm_lock(vm);
        let mut state = lock.write().await;
        let tree = self.loaded(&call, vm, &mut state).await?.clone();

        if request.quiesce {
            let ready = read_with_retry(&call, &self.config.policy.retry, "guestIntegrationReady", || {
                self.gateway.guest_integration_ready(vm)
            })
            .await?;
            if !ready {
                return Err(VmError::QuiesceUnavailable { vm: vm.name.clone() });
            }
        }

        let spec = SnapshotSpec {
            name: name.clone(),
            description: request.description.clone(),
            include_memory: request.include_memory,
            quiesce: request.quiesce,
        };
        let id = match mutate(&call, "createSnapshot", self.gateway.create_snapshot(vm, &spec)).await {
            Ok(id) => id,
            Err(err) => {
                self.note_remote_failure(vm, &mut state, &err);
                return Err(err);
            }
        };

        let local = SnapshotNode {
            id: id.clone(),
            name,
            description: request.description,
            created_at: Utc::now(),
            includes_memory: request.include_memory,
            quiesced: request.quiesce,
            owner_vm: vm.clone(),
            parent_id: None,
            child_ids: Vec::new(),
            is_current: true,
        };
        let mut expected = tree;
        let patched = expected.apply_create(local.clone()).map(|n| n.clone());
        let (local, expected) = match patched {
            Ok(node) => (node, Ok(expected)),
            Err(err) => (local, Err(err)),
        };
        self.commit(&call, vm, &mut state, expected, "createSnapshot")
            .await;

        let node = state
            .tree
            .as_ref()
            .and_then(|t| t.get(&id))
            .cloned()
            .unwrap_or(local);
        info!(vm = %vm, snapshot = %node.name, id = %node.id, "snapshot created");
        Ok(node)
    }
}
