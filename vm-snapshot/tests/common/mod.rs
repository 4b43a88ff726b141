// Common test fixtures for the snapshot manager
#![allow(dead_code)]

use std::sync::Arc;
use vm_config::{RetryPolicy, VsphereConfig};
use vm_provider::mock::{InMemoryGateway, ANY_ENTITY};
use vm_snapshot::privilege::{
    ALLOCATE_SPACE, ASSIGN_VM_TO_POOL, CONSOLIDATE, CREATE_FROM_EXISTING, CREATE_SNAPSHOT,
    DELETE_VM, PROVISION_CLONE, REMOVE_SNAPSHOT, REVERT_TO_SNAPSHOT,
};
use vm_snapshot::{InventoryRef, RequestContext, SnapshotManager};

pub const OPERATOR: &str = "ops@vsphere.local";
pub const DATACENTER: &str = "dc-1";

pub const ALL_PRIVILEGES: [&str; 9] = [
    CREATE_SNAPSHOT,
    REMOVE_SNAPSHOT,
    REVERT_TO_SNAPSHOT,
    CONSOLIDATE,
    PROVISION_CLONE,
    CREATE_FROM_EXISTING,
    ASSIGN_VM_TO_POOL,
    ALLOCATE_SPACE,
    DELETE_VM,
];

pub struct Fixture {
    pub gateway: Arc<InMemoryGateway>,
    pub manager: SnapshotManager,
    pub vm: InventoryRef,
}

/// Config with millisecond backoff so retry paths stay fast.
pub fn test_config() -> VsphereConfig {
    let mut config = VsphereConfig::default();
    config.defaults.datacenter = DATACENTER.to_string();
    config.policy.retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    };
    config
}

/// One VM `web-01` in `dc-1` and an operator holding every privilege.
pub fn fixture() -> Fixture {
    fixture_with(test_config())
}

pub fn fixture_with(config: VsphereConfig) -> Fixture {
    vm_common::tracing_init::init_for_testing();

    let gateway = Arc::new(InMemoryGateway::new());
    let vm = gateway.add_vm(DATACENTER, "web-01");
    gateway.grant(OPERATOR, ANY_ENTITY, ALL_PRIVILEGES);

    let manager = SnapshotManager::new(gateway.clone(), config);
    Fixture {
        gateway,
        manager,
        vm,
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new(OPERATOR)
}
