//! In-memory hypervisor for tests.
//!
//! Behaves like a small vSphere inventory: datacenters hold VMs, VMs hold a
//! snapshot forest with one current snapshot, linked clones become new VMs.
//! Tests can inject transport failures, remote faults, latency, and
//! "external" mutations that bypass the call log to simulate other actors.

use crate::models::{ConsolidationReport, InventoryRef, RawSnapshot, SnapshotSpec};
use crate::Gateway;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use vm_core::error::{ObjectKind, Result, VmError};

/// Grant key matching every entity, the way a role assigned at the
/// inventory root propagates to all children.
pub const ANY_ENTITY: &str = "*";

#[derive(Debug, Clone)]
enum Injected {
    Pass,
    Unavailable,
    Rejected(String),
}

#[derive(Debug, Clone)]
struct MockVm {
    vm: InventoryRef,
    datacenter: String,
    snapshots: Vec<RawSnapshot>,
    needs_consolidation: bool,
    tools_ready: bool,
    linked_from: Option<(String, String)>,
    // Returned verbatim by `read_snapshot_tree` when set
    raw_override: Option<Vec<RawSnapshot>>,
}

#[derive(Debug, Default)]
struct MockState {
    vms: BTreeMap<String, MockVm>,
    grants: HashMap<(String, String), HashSet<String>>,
    principals: HashSet<String>,
    next_id: u64,
    ticks: i64,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<Injected>>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    // Strictly increasing timestamps keep creation order unambiguous.
    fn tick(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        base + ChronoDuration::seconds(self.ticks)
    }

    fn vm_mut(&mut self, id: &str) -> Result<&mut MockVm> {
        self.vms
            .get_mut(id)
            .ok_or_else(|| VmError::not_found(ObjectKind::Vm, id))
    }

    fn take_failure(&mut self, operation: &str) -> Option<VmError> {
        let queue = self.failures.get_mut(operation)?;
        match queue.pop_front()? {
            Injected::Pass => None,
            Injected::Unavailable => Some(VmError::GatewayUnavailable(format!(
                "{}: connection reset by peer",
                operation
            ))),
            Injected::Rejected(message) => Some(VmError::remote(operation, message)),
        }
    }
}

impl MockVm {
    fn current(&self) -> Option<&RawSnapshot> {
        self.snapshots.iter().find(|s| s.is_current)
    }

    fn find(&self, snapshot_id: &str) -> Option<&RawSnapshot> {
        self.snapshots.iter().find(|s| s.id == snapshot_id)
    }

    fn push_snapshot(&mut self, snapshot: RawSnapshot) {
        for existing in &mut self.snapshots {
            existing.is_current = false;
        }
        self.snapshots.push(snapshot);
    }

    fn subtree(&self, snapshot_id: &str) -> HashSet<String> {
        let mut ids = HashSet::new();
        let mut stack = vec![snapshot_id.to_string()];
        while let Some(id) = stack.pop() {
            if ids.insert(id.clone()) {
                stack.extend(
                    self.snapshots
                        .iter()
                        .filter(|s| s.parent_id.as_deref() == Some(id.as_str()))
                        .map(|s| s.id.clone()),
                );
            }
        }
        ids
    }

    fn remove(&mut self, snapshot_id: &str, remove_children: bool) -> Result<()> {
        let target = self
            .find(snapshot_id)
            .cloned()
            .ok_or_else(|| VmError::not_found(ObjectKind::Snapshot, snapshot_id))?;

        let removed: HashSet<String> = if remove_children {
            self.subtree(snapshot_id)
        } else {
            HashSet::from([snapshot_id.to_string()])
        };

        let current_removed = self
            .current()
            .is_some_and(|current| removed.contains(&current.id));

        self.snapshots.retain(|s| !removed.contains(&s.id));
        if !remove_children {
            for child in &mut self.snapshots {
                if child.parent_id.as_deref() == Some(snapshot_id) {
                    child.parent_id = target.parent_id.clone();
                }
            }
        }

        if current_removed {
            if let Some(parent_id) = &target.parent_id {
                for s in &mut self.snapshots {
                    s.is_current = &s.id == parent_id;
                }
            }
        }

        self.needs_consolidation = true;
        Ok(())
    }
}

/// In-memory `Gateway` implementation.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<MockState>,
    latency: Mutex<Option<Duration>>,
    operation_latency: Mutex<HashMap<String, Duration>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("in-memory gateway state poisoned")
    }

    /// Register a VM and return its reference.
    pub fn add_vm(&self, datacenter: &str, name: &str) -> InventoryRef {
        let mut state = self.state();
        let vm = InventoryRef::new(state.next_id("vm"), name);
        state.vms.insert(
            vm.id.clone(),
            MockVm {
                vm: vm.clone(),
                datacenter: datacenter.to_string(),
                snapshots: Vec::new(),
                needs_consolidation: false,
                tools_ready: true,
                linked_from: None,
                raw_override: None,
            },
        );
        vm
    }

    /// Take a snapshot as another actor would: under the current one, and
    /// without appearing in the call log.
    pub fn add_snapshot(&self, vm_id: &str, name: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("snapshot");
        let created_at = state.tick();
        let vm = state.vm_mut(vm_id).expect("add_snapshot: unknown VM");
        let parent_id = vm.current().map(|s| s.id.clone());
        vm.push_snapshot(RawSnapshot {
            id: id.clone(),
            name: name.to_string(),
            description: String::new(),
            created_at,
            includes_memory: false,
            quiesced: false,
            parent_id,
            is_current: true,
        });
        id
    }

    /// Remove a snapshot as another actor would.
    pub fn external_remove_snapshot(&self, vm_id: &str, snapshot_id: &str, remove_children: bool) {
        let mut state = self.state();
        state
            .vm_mut(vm_id)
            .and_then(|vm| vm.remove(snapshot_id, remove_children))
            .expect("external_remove_snapshot: unknown VM or snapshot");
    }

    /// Revert as another actor would.
    pub fn external_revert(&self, vm_id: &str, snapshot_id: &str) {
        let mut state = self.state();
        let vm = state.vm_mut(vm_id).expect("external_revert: unknown VM");
        for s in &mut vm.snapshots {
            s.is_current = s.id == snapshot_id;
        }
    }

    /// Make `read_snapshot_tree` return exactly `raw` for this VM.
    pub fn set_raw_tree(&self, vm_id: &str, raw: Vec<RawSnapshot>) {
        let mut state = self.state();
        state
            .vm_mut(vm_id)
            .expect("set_raw_tree: unknown VM")
            .raw_override = Some(raw);
    }

    pub fn set_tools_ready(&self, vm_id: &str, ready: bool) {
        let mut state = self.state();
        state
            .vm_mut(vm_id)
            .expect("set_tools_ready: unknown VM")
            .tools_ready = ready;
    }

    pub fn set_needs_consolidation(&self, vm_id: &str, needed: bool) {
        let mut state = self.state();
        state
            .vm_mut(vm_id)
            .expect("set_needs_consolidation: unknown VM")
            .needs_consolidation = needed;
    }

    /// Grant privileges to `principal` on `entity_id` (or `ANY_ENTITY`).
    pub fn grant<I, S>(&self, principal: &str, entity_id: &str, privileges: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        state.principals.insert(principal.to_string());
        state
            .grants
            .entry((principal.to_string(), entity_id.to_string()))
            .or_default()
            .extend(privileges.into_iter().map(Into::into));
    }

    /// Make the next `times` calls of `operation` fail with a transport error.
    pub fn fail_next(&self, operation: &str, times: usize) {
        let mut state = self.state();
        let queue = state.failures.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(Injected::Unavailable);
        }
    }

    /// Make the next call of `operation` fail with a remote fault.
    pub fn reject_next(&self, operation: &str, message: &str) {
        let mut state = self.state();
        state
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(Injected::Rejected(message.to_string()));
    }

    /// Let `successes` calls of `operation` through, then fail the next one
    /// with a remote fault.
    pub fn reject_after(&self, operation: &str, successes: usize, message: &str) {
        let mut state = self.state();
        let queue = state.failures.entry(operation.to_string()).or_default();
        queue.extend((0..successes).map(|_| Injected::Pass));
        queue.push_back(Injected::Rejected(message.to_string()));
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().expect("latency lock poisoned") = latency;
    }

    /// Delay only calls of `operation`, overriding the global latency.
    pub fn set_operation_latency(&self, operation: &str, latency: Option<Duration>) {
        let mut delays = self
            .operation_latency
            .lock()
            .expect("latency lock poisoned");
        match latency {
            Some(latency) => delays.insert(operation.to_string(), latency),
            None => delays.remove(operation),
        };
    }

    /// Names of the gateway operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == operation).count()
    }

    /// Whether a VM with this id currently exists.
    pub fn vm_exists(&self, vm_id: &str) -> bool {
        self.state().vms.contains_key(vm_id)
    }

    /// Snapshot ids currently present on a VM, in creation order.
    pub fn snapshot_ids(&self, vm_id: &str) -> Vec<String> {
        self.state()
            .vms
            .get(vm_id)
            .map(|vm| vm.snapshots.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// `(source vm id, snapshot id)` a clone was linked from.
    pub fn linked_from(&self, vm_id: &str) -> Option<(String, String)> {
        self.state()
            .vms
            .get(vm_id)
            .and_then(|vm| vm.linked_from.clone())
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        let delay = self
            .operation_latency
            .lock()
            .expect("latency lock poisoned")
            .get(operation)
            .copied();
        let latency = delay.or(*self.latency.lock().expect("latency lock poisoned"));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.calls.push(operation.to_string());
        match state.take_failure(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find_vm_by_name(&self, datacenter: &str, name: &str) -> Result<Vec<InventoryRef>> {
        self.enter("findVmByName").await?;
        let state = self.state();
        Ok(state
            .vms
            .values()
            .filter(|vm| vm.datacenter == datacenter && vm.vm.name == name)
            .map(|vm| vm.vm.clone())
            .collect())
    }

    async fn read_snapshot_tree(&self, vm: &InventoryRef) -> Result<Vec<RawSnapshot>> {
        self.enter("readSnapshotTree").await?;
        let mut state = self.state();
        let vm = state.vm_mut(&vm.id)?;
        Ok(vm
            .raw_override
            .clone()
            .unwrap_or_else(|| vm.snapshots.clone()))
    }

    async fn create_snapshot(&self, vm: &InventoryRef, spec: &SnapshotSpec) -> Result<String> {
        self.enter("createSnapshot").await?;
        let mut state = self.state();
        if !state.vms.contains_key(&vm.id) {
            return Err(VmError::not_found(ObjectKind::Vm, &vm.id));
        }
        let id = state.next_id("snapshot");
        let created_at = state.tick();
        let mock_vm = state.vm_mut(&vm.id)?;
        if spec.quiesce && !mock_vm.tools_ready {
            return Err(VmError::remote(
                "createSnapshot",
                "cannot quiesce: VMware Tools is not running",
            ));
        }
        let parent_id = mock_vm.current().map(|s| s.id.clone());
        mock_vm.push_snapshot(RawSnapshot {
            id: id.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            created_at,
            includes_memory: spec.include_memory,
            quiesced: spec.quiesce,
            parent_id,
            is_current: true,
        });
        Ok(id)
    }

    async fn remove_snapshot(
        &self,
        vm: &InventoryRef,
        snapshot_id: &str,
        remove_children: bool,
    ) -> Result<()> {
        self.enter("removeSnapshot").await?;
        let mut state = self.state();
        state.vm_mut(&vm.id)?.remove(snapshot_id, remove_children)
    }

    async fn revert_to_snapshot(&self, vm: &InventoryRef, snapshot_id: &str) -> Result<()> {
        self.enter("revertToSnapshot").await?;
        let mut state = self.state();
        let mock_vm = state.vm_mut(&vm.id)?;
        if mock_vm.find(snapshot_id).is_none() {
            return Err(VmError::not_found(ObjectKind::Snapshot, snapshot_id));
        }
        for s in &mut mock_vm.snapshots {
            s.is_current = s.id == snapshot_id;
        }
        Ok(())
    }

    async fn consolidate_disks(&self, vm: &InventoryRef) -> Result<ConsolidationReport> {
        self.enter("consolidateDisks").await?;
        let mut state = self.state();
        let mock_vm = state.vm_mut(&vm.id)?;
        let did_work = mock_vm.needs_consolidation;
        mock_vm.needs_consolidation = false;
        Ok(ConsolidationReport { did_work })
    }

    async fn create_linked_clone(
        &self,
        vm: &InventoryRef,
        snapshot_id: &str,
        clone_name: &str,
    ) -> Result<InventoryRef> {
        self.enter("createLinkedClone").await?;
        let mut state = self.state();
        let source = state
            .vms
            .get(&vm.id)
            .ok_or_else(|| VmError::not_found(ObjectKind::Vm, &vm.id))?;
        if source.find(snapshot_id).is_none() {
            return Err(VmError::not_found(ObjectKind::Snapshot, snapshot_id));
        }
        let datacenter = source.datacenter.clone();

        let clone = InventoryRef::new(state.next_id("vm"), clone_name);
        state.vms.insert(
            clone.id.clone(),
            MockVm {
                vm: clone.clone(),
                datacenter,
                snapshots: Vec::new(),
                needs_consolidation: false,
                tools_ready: false,
                linked_from: Some((vm.id.clone(), snapshot_id.to_string())),
                raw_override: None,
            },
        );
        Ok(clone)
    }

    async fn remove_clone(&self, clone: &InventoryRef) -> Result<()> {
        self.enter("removeClone").await?;
        let mut state = self.state();
        state
            .vms
            .remove(&clone.id)
            .map(|_| ())
            .ok_or_else(|| VmError::not_found(ObjectKind::Vm, &clone.id))
    }

    async fn effective_grants(
        &self,
        principal: &str,
        entity: &InventoryRef,
    ) -> Result<Option<HashSet<String>>> {
        self.enter("effectiveGrants").await?;
        let state = self.state();
        if !state.principals.contains(principal) {
            return Ok(None);
        }
        let mut grants = HashSet::new();
        for key in [entity.id.as_str(), ANY_ENTITY] {
            if let Some(set) = state.grants.get(&(principal.to_string(), key.to_string())) {
                grants.extend(set.iter().cloned());
            }
        }
        Ok(Some(grants))
    }

    async fn guest_integration_ready(&self, vm: &InventoryRef) -> Result<bool> {
        self.enter("guestIntegrationReady").await?;
        let mut state = self.state();
        Ok(state.vm_mut(&vm.id)?.tools_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshots_chain_under_current() {
        let gateway = InMemoryGateway::new();
        let vm = gateway.add_vm("dc-1", "web-01");
        let first = gateway.add_snapshot(&vm.id, "base");
        let second = gateway.add_snapshot(&vm.id, "patched");

        let raw = gateway.read_snapshot_tree(&vm).await.unwrap();
        assert_eq!(raw.len(), 2);
        let second_raw = raw.iter().find(|s| s.id == second).unwrap();
        assert_eq!(second_raw.parent_id.as_deref(), Some(first.as_str()));
        assert!(second_raw.is_current);
        assert_eq!(raw.iter().filter(|s| s.is_current).count(), 1);
    }

    #[tokio::test]
    async fn test_removing_current_moves_current_to_parent() {
        let gateway = InMemoryGateway::new();
        let vm = gateway.add_vm("dc-1", "web-01");
        let first = gateway.add_snapshot(&vm.id, "base");
        let second = gateway.add_snapshot(&vm.id, "patched");

        gateway.remove_snapshot(&vm, &second, false).await.unwrap();
        let raw = gateway.read_snapshot_tree(&vm).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].id, first);
        assert!(raw[0].is_current);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let gateway = InMemoryGateway::new();
        gateway.fail_next("findVmByName", 1);
        gateway.add_vm("dc-1", "web-01");

        let err = gateway.find_vm_by_name("dc-1", "web-01").await.unwrap_err();
        assert!(err.is_retryable());
        let found = gateway.find_vm_by_name("dc-1", "web-01").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(gateway.call_count("findVmByName"), 2);
    }

    #[tokio::test]
    async fn test_unknown_principal_has_no_grant_information() {
        let gateway = InMemoryGateway::new();
        let vm = gateway.add_vm("dc-1", "web-01");
        gateway.grant("ops", ANY_ENTITY, ["VirtualMachine.State.CreateSnapshot"]);

        assert!(gateway.effective_grants("nobody", &vm).await.unwrap().is_none());
        let grants = gateway.effective_grants("ops", &vm).await.unwrap().unwrap();
        assert!(grants.contains("VirtualMachine.State.CreateSnapshot"));
    }
}
