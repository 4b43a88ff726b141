use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Kind of inventory object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Datacenter,
    Vm,
    Snapshot,
    LinkedClone,
    Principal,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ObjectKind::Datacenter => write!(f, "datacenter"),
            ObjectKind::Vm => write!(f, "VM"),
            ObjectKind::Snapshot => write!(f, "snapshot"),
            ObjectKind::LinkedClone => write!(f, "linked clone"),
            ObjectKind::Principal => write!(f, "principal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum VmError {
    NotFound {
        kind: ObjectKind,
        key: String,
    },
    Ambiguous {
        kind: ObjectKind,
        name: String,
        candidates: Vec<String>,
    },
    GatewayUnavailable(String),
    PermissionDenied {
        principal: String,
        entity: String,
        missing: Vec<String>,
    },
    CorruptTree {
        vm: String,
        reason: String,
    },
    SnapshotVanished {
        vm: String,
        snapshot_id: String,
    },
    QuiesceUnavailable {
        vm: String,
    },
    ConfirmationRequired {
        operation: String,
        target: String,
    },
    DependentClones {
        snapshot_id: String,
        clones: Vec<String>,
    },
    Remote {
        operation: String,
        message: String,
    },
    Cancelled {
        operation: String,
    },
    DeadlineExceeded {
        operation: String,
    },
    InvalidInput(String),
    Config(String),
    Serialization(String),
    Io(#[from] std::io::Error),
}

impl VmError {
    pub fn not_found(kind: ObjectKind, key: impl Into<String>) -> Self {
        VmError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn corrupt_tree(vm: impl Into<String>, reason: impl Into<String>) -> Self {
        VmError::CorruptTree {
            vm: vm.into(),
            reason: reason.into(),
        }
    }

    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        VmError::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Only transport failures are safe to retry; everything else is either
    /// final or could double-apply a mutation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VmError::GatewayUnavailable(_))
    }

    /// Whether the caller must re-read remote state before trusting any
    /// cached view of the affected VM.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            VmError::CorruptTree { .. }
                | VmError::SnapshotVanished { .. }
                | VmError::Cancelled { .. }
                | VmError::DeadlineExceeded { .. }
        )
    }

    /// Stable short code for presentation layers and scripting.
    pub fn code(&self) -> &'static str {
        match self {
            VmError::NotFound { .. } => "not_found",
            VmError::Ambiguous { .. } => "ambiguous",
            VmError::GatewayUnavailable(_) => "gateway_unavailable",
            VmError::PermissionDenied { .. } => "permission_denied",
            VmError::CorruptTree { .. } => "corrupt_tree",
            VmError::SnapshotVanished { .. } => "snapshot_vanished",
            VmError::QuiesceUnavailable { .. } => "quiesce_unavailable",
            VmError::ConfirmationRequired { .. } => "confirmation_required",
            VmError::DependentClones { .. } => "dependent_clones",
            VmError::Remote { .. } => "remote",
            VmError::Cancelled { .. } => "cancelled",
            VmError::DeadlineExceeded { .. } => "deadline_exceeded",
            VmError::InvalidInput(_) => "invalid_input",
            VmError::Config(_) => "config",
            VmError::Serialization(_) => "serialization",
            VmError::Io(_) => "io",
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmError::NotFound { kind, key } => write!(f, "{} '{}' not found", kind, key),
            VmError::Ambiguous {
                kind,
                name,
                candidates,
            } => write!(
                f,
                "{} name '{}' is ambiguous, candidates: {}",
                kind,
                name,
                candidates.join(", ")
            ),
            VmError::GatewayUnavailable(s) => write!(f, "Gateway unavailable: {}", s),
            VmError::PermissionDenied {
                principal,
                entity,
                missing,
            } => write!(
                f,
                "Permission denied: '{}' lacks {} on '{}'",
                principal,
                missing.join(", "),
                entity
            ),
            VmError::CorruptTree { vm, reason } => {
                write!(f, "Snapshot tree of '{}' is corrupt: {}", vm, reason)
            }
            VmError::SnapshotVanished { vm, snapshot_id } => write!(
                f,
                "Snapshot '{}' of '{}' disappeared before the operation could run",
                snapshot_id, vm
            ),
            VmError::QuiesceUnavailable { vm } => {
                write!(f, "Cannot quiesce '{}': guest tools are not ready\n\n", vm)?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Start or upgrade VMware Tools in the guest, or\n")?;
                write!(f, "  • Create the snapshot without quiesce")
            }
            VmError::ConfirmationRequired { operation, target } => write!(
                f,
                "{} on '{}' is destructive and requires explicit confirmation",
                operation, target
            ),
            VmError::DependentClones {
                snapshot_id,
                clones,
            } => write!(
                f,
                "Snapshot '{}' backs linked clones: {}",
                snapshot_id,
                clones.join(", ")
            ),
            VmError::Remote { operation, message } => {
                write!(f, "Remote {} failed: {}", operation, message)
            }
            VmError::Cancelled { operation } => write!(
                f,
                "{} was cancelled; reload to learn the remote state",
                operation
            ),
            VmError::DeadlineExceeded { operation } => write!(
                f,
                "{} exceeded its deadline; reload to learn the remote state",
                operation
            ),
            VmError::InvalidInput(s) => write!(f, "Invalid input: {}", s),
            VmError::Config(s) => write!(f, "Configuration error: {}", s),
            VmError::Serialization(s) => write!(f, "Serialization error: {}", s),
            VmError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<serde_yaml_ng::Error> for VmError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VmError {
    fn from(err: serde_json::Error) -> Self {
        VmError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_gateway_unavailable_is_retryable() {
        assert!(VmError::GatewayUnavailable("reset".into()).is_retryable());
        assert!(!VmError::remote("removeSnapshot", "fault").is_retryable());
        assert!(!VmError::not_found(ObjectKind::Vm, "web-01").is_retryable());
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = VmError::Ambiguous {
            kind: ObjectKind::Vm,
            name: "web-01".into(),
            candidates: vec!["vm-1".into(), "vm-2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("vm-1"));
        assert!(msg.contains("vm-2"));
        assert_eq!(err.code(), "ambiguous");
    }

    #[test]
    fn test_permission_denied_names_missing_privileges() {
        let err = VmError::PermissionDenied {
            principal: "ops@vsphere.local".into(),
            entity: "vm-42".into(),
            missing: vec!["VirtualMachine.State.CreateSnapshot".into()],
        };
        assert!(err
            .to_string()
            .contains("VirtualMachine.State.CreateSnapshot"));
    }

    #[test]
    fn test_cancellation_requires_reload() {
        let err = VmError::Cancelled {
            operation: "createSnapshot".into(),
        };
        assert!(err.requires_reload());
        assert!(!VmError::InvalidInput("x".into()).requires_reload());
    }
}
