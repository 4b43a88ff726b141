//! Per-request inputs shared by every operation.

use std::time::Duration;
use vm_provider::{CallContext, CancelHandle, InventoryRef};

/// Who is acting, and the deadline/cancellation applied to every remote call
/// made on their behalf.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub principal: String,
    pub call: CallContext,
}

impl RequestContext {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            call: CallContext::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call = self.call.with_timeout(timeout);
        self
    }

    pub fn with_call(mut self, call: CallContext) -> Self {
        self.call = call;
        self
    }

    /// A context the caller can abort through the returned handle.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (call, handle) = self.call.cancellable();
        self.call = call;
        (self, handle)
    }
}

/// Explicit go-ahead for a destructive operation.
///
/// The token must name the object being destroyed, by id or by name. A
/// token naming anything else counts as no confirmation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Confirmation {
    #[default]
    Missing,
    Confirmed(String),
}

impl Confirmation {
    pub fn of(target: impl Into<String>) -> Self {
        Confirmation::Confirmed(target.into())
    }

    pub fn confirms(&self, target: &InventoryRef) -> bool {
        match self {
            Confirmation::Missing => false,
            Confirmation::Confirmed(token) => *token == target.id || *token == target.name,
        }
    }
}

impl From<Option<String>> for Confirmation {
    fn from(token: Option<String>) -> Self {
        token.map(Confirmation::Confirmed).unwrap_or_default()
    }
}

/// Inputs of `SnapshotManager::create_snapshot`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    /// Blank means an auto-generated `snapshot-YYYY-MM-DD-HHMMSS` name
    pub name: String,
    pub description: String,
    pub include_memory: bool,
    pub quiesce: bool,
}

impl CreateSnapshotRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_must_name_target() {
        let vm = InventoryRef::new("vm-42", "build-agent");
        assert!(Confirmation::of("vm-42").confirms(&vm));
        assert!(Confirmation::of("build-agent").confirms(&vm));
        assert!(!Confirmation::of("other").confirms(&vm));
        assert!(!Confirmation::Missing.confirms(&vm));
        assert_eq!(Confirmation::from(None), Confirmation::Missing);
    }
}
