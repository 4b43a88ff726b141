//! Pre-flight privilege checks.
//!
//! Every operation declares the privilege ids it needs. The validator reads
//! the principal's effective grants on the target entity and reports the
//! full list of missing ids, never just the first.

use indexmap::IndexSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use vm_config::RetryPolicy;
use vm_core::error::{Result, VmError};
use vm_provider::call::read_with_retry;
use vm_provider::{CallContext, Gateway, InventoryRef};

pub const CREATE_SNAPSHOT: &str = "VirtualMachine.State.CreateSnapshot";
pub const REMOVE_SNAPSHOT: &str = "VirtualMachine.State.RemoveSnapshot";
pub const REVERT_TO_SNAPSHOT: &str = "VirtualMachine.State.RevertToSnapshot";
pub const CONSOLIDATE: &str = "VirtualMachine.Interact.Consolidate";
pub const PROVISION_CLONE: &str = "VirtualMachine.Provisioning.Clone";
pub const CREATE_FROM_EXISTING: &str = "VirtualMachine.Inventory.CreateFromExisting";
pub const ASSIGN_VM_TO_POOL: &str = "Resource.AssignVMToPool";
pub const ALLOCATE_SPACE: &str = "Datastore.AllocateSpace";
pub const DELETE_VM: &str = "VirtualMachine.Inventory.Delete";

/// Ordered, duplicate-free set of privilege ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrivilegeSet(IndexSet<String>);

impl PrivilegeSet {
    pub fn new<I, S>(privileges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(privileges.into_iter().map(Into::into).collect())
    }

    pub fn create_snapshot() -> Self {
        Self::new([CREATE_SNAPSHOT])
    }

    /// Covers single deletes and delete-all.
    pub fn delete_snapshot() -> Self {
        Self::new([REMOVE_SNAPSHOT])
    }

    pub fn revert_snapshot() -> Self {
        Self::new([REVERT_TO_SNAPSHOT])
    }

    pub fn consolidate() -> Self {
        Self::new([CONSOLIDATE])
    }

    pub fn create_linked_clone() -> Self {
        Self::new([
            PROVISION_CLONE,
            CREATE_FROM_EXISTING,
            ASSIGN_VM_TO_POOL,
            ALLOCATE_SPACE,
        ])
    }

    pub fn remove_linked_clone() -> Self {
        Self::new([DELETE_VM])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, privilege: &str) -> bool {
        self.0.contains(privilege)
    }
}

/// Outcome of a privilege check. `missing` keeps the order the privileges
/// were declared in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub missing: Vec<String>,
}

impl ValidationResult {
    /// Turn a failed check into `PermissionDenied`.
    pub fn into_result(self, principal: &str, entity: &InventoryRef) -> Result<()> {
        if self.ok {
            return Ok(());
        }
        Err(VmError::PermissionDenied {
            principal: principal.to_string(),
            entity: entity.id.clone(),
            missing: self.missing,
        })
    }
}

pub struct PrivilegeValidator {
    gateway: Arc<dyn Gateway>,
    retry: RetryPolicy,
}

impl PrivilegeValidator {
    pub fn new(gateway: Arc<dyn Gateway>, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    /// Check `required` against the principal's effective grants on `entity`.
    ///
    /// An empty principal, or one the gateway does not know, holds nothing:
    /// every required privilege is reported missing. Only transport failures
    /// surface as errors.
    pub async fn validate(
        &self,
        ctx: &CallContext,
        principal: &str,
        entity: &InventoryRef,
        required: &PrivilegeSet,
    ) -> Result<ValidationResult> {
        if required.is_empty() {
            return Ok(ValidationResult {
                ok: true,
                missing: Vec::new(),
            });
        }

        let granted = if principal.trim().is_empty() {
            None
        } else {
            read_with_retry(ctx, &self.retry, "effectiveGrants", || {
                self.gateway.effective_grants(principal, entity)
            })
            .await?
        };

        let missing: Vec<String> = match &granted {
            Some(granted) => required
                .iter()
                .filter(|p| !granted.contains(*p))
                .map(str::to_string)
                .collect(),
            None => required.iter().map(str::to_string).collect(),
        };

        if missing.is_empty() {
            debug!(principal, entity = %entity, "privilege check passed");
        } else {
            warn!(
                principal,
                entity = %entity,
                missing = ?missing,
                "principal lacks required privileges"
            );
        }

        Ok(ValidationResult {
            ok: missing.is_empty(),
            missing,
        })
    }

    /// `validate`, failing with `PermissionDenied` when anything is missing.
    pub async fn ensure(
        &self,
        ctx: &CallContext,
        principal: &str,
        entity: &InventoryRef,
        required: &PrivilegeSet,
    ) -> Result<()> {
        self.validate(ctx, principal, entity, required)
            .await?
            .into_result(principal, entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_sets_keep_declaration_order() {
        let clone = PrivilegeSet::create_linked_clone();
        let ids: Vec<&str> = clone.iter().collect();
        assert_eq!(
            ids,
            vec![
                PROVISION_CLONE,
                CREATE_FROM_EXISTING,
                ASSIGN_VM_TO_POOL,
                ALLOCATE_SPACE
            ]
        );
        assert_eq!(PrivilegeSet::new(["a", "b", "a"]).len(), 2);
    }

    #[test]
    fn test_delete_and_delete_all_share_privilege() {
        assert!(PrivilegeSet::delete_snapshot().contains(REMOVE_SNAPSHOT));
        assert!(PrivilegeSet::consolidate().contains(CONSOLIDATE));
        assert!(PrivilegeSet::remove_linked_clone().contains(DELETE_VM));
    }

    #[test]
    fn test_into_result_lists_every_missing_privilege() {
        let entity = InventoryRef::new("vm-7", "db-01");
        let result = ValidationResult {
            ok: false,
            missing: vec![PROVISION_CLONE.into(), ALLOCATE_SPACE.into()],
        };
        match result.into_result("alice@vsphere.local", &entity).unwrap_err() {
            VmError::PermissionDenied {
                principal,
                entity,
                missing,
            } => {
                assert_eq!(principal, "alice@vsphere.local");
                assert_eq!(entity, "vm-7");
                assert_eq!(missing.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
