//! Disk consolidation

use serde::Serialize;
use std::fmt;
use tracing::{info, instrument};
use vm_core::error::Result;
use vm_provider::call::mutate;
use vm_provider::InventoryRef;

use crate::manager::SnapshotManager;
use crate::privilege::PrivilegeSet;
use crate::request::RequestContext;

/// What a consolidation run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsolidateOutcome {
    /// Orphaned delta disks were merged
    Consolidated,
    NothingToDo,
}

impl fmt::Display for ConsolidateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidateOutcome::Consolidated => write!(f, "consolidated"),
            ConsolidateOutcome::NothingToDo => write!(f, "nothing to do"),
        }
    }
}

impl SnapshotManager {
    /// Merge orphaned delta disks. Idempotent: a second run with no snapshot
    /// changes in between reports `NothingToDo`. The tree shape is untouched.
    #[instrument(skip(self, ctx), fields(vm = %vm))]
    pub async fn consolidate(
        &self,
        ctx: &RequestContext,
        vm: &InventoryRef,
    ) -> Result<ConsolidateOutcome> {
        let call = self.call_context(ctx);
        self.authorize(ctx, &call, vm, &PrivilegeSet::consolidate())
            .await?;

        let lock = self.vm_lock(vm);
        let _exclusive = lock.write().await;

        let report = mutate(&call, "consolidateDisks", self.gateway.consolidate_disks(vm)).await?;
        let outcome = if report.did_work {
            ConsolidateOutcome::Consolidated
        } else {
            ConsolidateOutcome::NothingToDo
        };

        info!(vm = %vm, %outcome, "consolidation finished");
        Ok(outcome)
    }
}
