//! Snapshot manager facade.
//!
//! Owns the gateway, the resolver, the validator, the per-VM snapshot trees
//! and the linked clone records. Operations live in their own modules
//! (`create`, `delete`, `restore`, `consolidate`, `clone`) as further
//! `impl SnapshotManager` blocks.

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use vm_config::VsphereConfig;
use vm_core::error::{ObjectKind, Result, VmError};
use vm_provider::call::read_with_retry;
use vm_provider::{CallContext, Gateway, InventoryRef};

use crate::clone::LinkedCloneRecord;
use crate::inventory::InventoryResolver;
use crate::privilege::{PrivilegeSet, PrivilegeValidator};
use crate::request::RequestContext;
use crate::tree::{SnapshotNode, SnapshotTree};

/// Cached state of one VM, guarded by that VM's lock.
#[derive(Debug, Default)]
pub(crate) struct VmState {
    /// `None` until first access, and again after drift or corruption
    pub(crate) tree: Option<SnapshotTree>,
    /// Ids of the last tree installed; survives `drop_tree`
    known: HashSet<String>,
    /// Snapshot ids seen in an earlier tree that are now gone
    pub(crate) vanished: HashSet<String>,
}

impl VmState {
    /// Install a freshly read or patched tree, remembering which previously
    /// known snapshots are missing from it.
    pub(crate) fn install(&mut self, tree: SnapshotTree) -> &mut SnapshotTree {
        self.vanished
            .extend(self.known.iter().filter(|id| !tree.contains(id)).cloned());
        self.vanished.retain(|id| !tree.contains(id));
        self.known = tree.ids().map(str::to_string).collect();
        self.tree.insert(tree)
    }

    /// Discard the cached tree. Known ids are kept so the next install can
    /// still tell which snapshots went away in between.
    pub(crate) fn drop_tree(&mut self) {
        self.tree = None;
    }

    /// Record ids this manager removed itself.
    pub(crate) fn forget(&mut self, removed: impl IntoIterator<Item = String>) {
        for id in removed {
            self.known.remove(&id);
            self.vanished.insert(id);
        }
    }

    /// Remember ids of a tree that was expected but never installed.
    fn remember(&mut self, tree: &SnapshotTree) {
        self.known.extend(tree.ids().map(str::to_string));
    }

    fn is_empty(&self) -> bool {
        self.tree.is_none() && self.known.is_empty() && self.vanished.is_empty()
    }
}

/// Handle on one VM's lock.
///
/// Dropping the last handle of a VM whose state holds nothing removes the
/// entry from the manager's map, so VMs that were only looked at do not
/// accumulate.
pub(crate) struct VmEntry<'m> {
    manager: &'m SnapshotManager,
    id: String,
    lock: Arc<RwLock<VmState>>,
}

impl Deref for VmEntry<'_> {
    type Target = RwLock<VmState>;

    fn deref(&self) -> &Self::Target {
        &self.lock
    }
}

impl Drop for VmEntry<'_> {
    fn drop(&mut self) {
        self.manager.release_vm(&self.id, &self.lock);
    }
}

/// Entry point for every snapshot and linked clone operation.
///
/// Safe to share across tasks. Mutations on the same VM are serialised by a
/// FIFO-fair per-VM lock; reads of an already loaded tree share it.
pub struct SnapshotManager {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) config: VsphereConfig,
    pub(crate) resolver: InventoryResolver,
    pub(crate) validator: PrivilegeValidator,
    vms: Mutex<HashMap<String, Arc<RwLock<VmState>>>>,
    // Keyed by clone VM id, insertion order is creation order
    pub(crate) clones: Mutex<IndexMap<String, LinkedCloneRecord>>,
}

impl SnapshotManager {
    pub fn new(gateway: Arc<dyn Gateway>, config: VsphereConfig) -> Self {
        let resolver = InventoryResolver::new(
            Arc::clone(&gateway),
            config.defaults.datacenter.clone(),
            config.policy.resolve_cache_ttl(),
            config.policy.retry.clone(),
        );
        let validator = PrivilegeValidator::new(Arc::clone(&gateway), config.policy.retry.clone());

        debug!(gateway = gateway.name(), "snapshot manager ready");
        Self {
            gateway,
            config,
            resolver,
            validator,
            vms: Mutex::new(HashMap::new()),
            clones: Mutex::new(IndexMap::new()),
        }
    }

    pub fn config(&self) -> &VsphereConfig {
        &self.config
    }

    pub fn resolver(&self) -> &InventoryResolver {
        &self.resolver
    }

    pub fn validator(&self) -> &PrivilegeValidator {
        &self.validator
    }

    /// Resolve a VM by name. A blank datacenter means the configured default.
    pub async fn resolve_vm(
        &self,
        ctx: &RequestContext,
        datacenter: &str,
        name: &str,
    ) -> Result<InventoryRef> {
        let call = self.call_context(ctx);
        self.resolver.resolve(&call, datacenter, name).await
    }

    /// The VM's snapshot tree, loading it on first access.
    pub async fn snapshot_tree(&self, ctx: &RequestContext, vm: &InventoryRef) -> Result<SnapshotTree> {
        let lock = self.vm_lock(vm);
        {
            let state = lock.read().await;
            if let Some(tree) = &state.tree {
                return Ok(tree.clone());
            }
        }

        let call = self.call_context(ctx);
        let mut state = lock.write().await;
        let tree = self.loaded(&call, vm, &mut state).await?.clone();
        Ok(tree)
    }

    /// Re-read the tree from the hypervisor, replacing any cached copy.
    #[instrument(skip(self, ctx), fields(vm = %vm))]
    pub async fn load_tree(&self, ctx: &RequestContext, vm: &InventoryRef) -> Result<SnapshotTree> {
        let call = self.call_context(ctx);
        let lock = self.vm_lock(vm);
        let mut state = lock.write().await;

        match self.read_tree(&call, vm).await {
            Ok(tree) => Ok(state.install(tree).clone()),
            Err(err) => {
                if matches!(err, VmError::CorruptTree { .. }) {
                    state.drop_tree();
                }
                Err(err)
            }
        }
    }

    /// Exact-name snapshot lookup.
    pub async fn find_snapshot(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
        name: &str,
    ) -> Result<SnapshotNode> {
        let tree = self.snapshot_tree(ctx, vm).await?;
        let found = tree.find_by_name(name)?.cloned();
        found.ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, name))
    }

    /// Every snapshot of the VM, oldest first.
    pub async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
    ) -> Result<Vec<SnapshotNode>> {
        let tree = self.snapshot_tree(ctx, vm).await?;
        Ok(tree.chronological().into_iter().cloned().collect())
    }

    /// Drop the cached tree so the next access re-reads it.
    pub async fn invalidate(&self, vm: &InventoryRef) {
        let lock = self.vm_lock(vm);
        lock.write().await.drop_tree();
    }

    pub(crate) fn vm_lock(&self, vm: &InventoryRef) -> VmEntry<'_> {
        let lock = Arc::clone(self.lock_vms().entry(vm.id.clone()).or_default());
        VmEntry {
            manager: self,
            id: vm.id.clone(),
            lock,
        }
    }

    /// Drop the map entry for `id` when `held` is its last outside handle
    /// and the state is empty. Handles are only cloned under the map lock,
    /// so the count cannot grow while it is checked.
    fn release_vm(&self, id: &str, held: &Arc<RwLock<VmState>>) {
        let mut vms = self.lock_vms();
        let idle = vms.get(id).is_some_and(|entry| {
            Arc::ptr_eq(entry, held)
                && Arc::strong_count(entry) == 2
                && entry.try_read().is_ok_and(|state| state.is_empty())
        });
        if idle {
            vms.remove(id);
        }
    }

    pub(crate) fn lock_clones(&self) -> MutexGuard<'_, IndexMap<String, LinkedCloneRecord>> {
        self.clones.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_vms(&self) -> MutexGuard<'_, HashMap<String, Arc<RwLock<VmState>>>> {
        self.vms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The caller's context, bounded by the configured operation timeout when
    /// the caller set no deadline.
    pub(crate) fn call_context(&self, ctx: &RequestContext) -> CallContext {
        ctx.call
            .clone()
            .with_default_timeout(self.config.policy.operation_timeout())
    }

    pub(crate) async fn authorize(
        &self,
        ctx: &RequestContext,
        call: &CallContext,
        entity: &InventoryRef,
        required: &PrivilegeSet,
    ) -> Result<()> {
        self.validator
            .ensure(call, &ctx.principal, entity, required)
            .await
    }

    /// One remote read, rebuilt and validated.
    pub(crate) async fn read_tree(&self, call: &CallContext, vm: &InventoryRef) -> Result<SnapshotTree> {
        let raw = read_with_retry(call, &self.config.policy.retry, "readSnapshotTree", || {
            self.gateway.read_snapshot_tree(vm)
        })
        .await?;

        SnapshotTree::from_raw(vm.clone(), raw).inspect_err(|err| {
            error!(vm = %vm, error = %err, "remote snapshot tree rejected");
        })
    }

    /// The cached tree, loading it first when absent.
    pub(crate) async fn loaded<'a>(
        &self,
        call: &CallContext,
        vm: &InventoryRef,
        state: &'a mut VmState,
    ) -> Result<&'a mut SnapshotTree> {
        if let Some(tree) = state.tree.take() {
            return Ok(state.tree.insert(tree));
        }
        let tree = self.read_tree(call, vm).await?;
        debug!(vm = %vm, snapshots = tree.len(), "snapshot tree loaded");
        Ok(state.install(tree))
    }

    /// Store the post-mutation tree.
    ///
    /// `expected` is the cached tree patched with the mutation's result. With
    /// `refresh_after_mutation` the remote tree is re-read and wins; any
    /// difference from `expected` is reported as drift. Otherwise `expected`
    /// is committed once it passes `check_invariants`. When neither yields a
    /// trustworthy tree the cache is dropped and the next access re-reads.
    pub(crate) async fn commit(
        &self,
        call: &CallContext,
        vm: &InventoryRef,
        state: &mut VmState,
        expected: Result<SnapshotTree>,
        operation: &str,
    ) {
        if self.config.policy.refresh_after_mutation {
            match self.read_tree(call, vm).await {
                Ok(remote) => {
                    match &expected {
                        Ok(expected) if expected.same_shape(&remote) => {}
                        Ok(_) => warn!(
                            vm = %vm,
                            operation,
                            "snapshot tree drifted from the expected shape; using remote state"
                        ),
                        Err(err) => warn!(
                            vm = %vm,
                            operation,
                            error = %err,
                            "local patch failed; using remote state"
                        ),
                    }
                    state.install(remote);
                }
                Err(err) => {
                    warn!(
                        vm = %vm,
                        operation,
                        error = %err,
                        "could not re-read snapshot tree after mutation; cached tree dropped"
                    );
                    if let Ok(expected) = &expected {
                        state.remember(expected);
                    }
                    state.drop_tree();
                }
            }
            return;
        }

        match expected.and_then(|tree| tree.check_invariants().map(|()| tree)) {
            Ok(tree) => {
                state.install(tree);
            }
            Err(err) => {
                error!(
                    vm = %vm,
                    operation,
                    error = %err,
                    "patched snapshot tree violates invariants; cached tree dropped"
                );
                state.drop_tree();
            }
        }
    }

    /// A remote `NotFound` for something the cache still holds means the
    /// cache is stale.
    pub(crate) fn note_remote_failure(&self, vm: &InventoryRef, state: &mut VmState, err: &VmError) {
        if matches!(err, VmError::NotFound { .. }) && state.tree.is_some() {
            info!(vm = %vm, error = %err, "remote state diverged; cached tree dropped");
            state.drop_tree();
        }
    }

    /// Clone names recorded against any of `snapshot_ids` of `vm`.
    pub(crate) fn dependent_clones(&self, vm: &InventoryRef, snapshot_ids: &[String]) -> Option<VmError> {
        let clones = self.lock_clones();
        let backing = clones
            .values()
            .filter(|r| r.source_vm.id == vm.id)
            .find(|r| snapshot_ids.contains(&r.source_snapshot_id))?;

        let names = clones
            .values()
            .filter(|r| r.source_vm.id == vm.id && r.source_snapshot_id == backing.source_snapshot_id)
            .map(|r| r.clone_name.clone())
            .collect();
        Some(VmError::DependentClones {
            snapshot_id: backing.source_snapshot_id.clone(),
            clones: names,
        })
    }
}
