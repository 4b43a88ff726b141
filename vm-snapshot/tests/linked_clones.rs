// Linked clone creation and removal
mod common;

use common::{ctx, fixture, DATACENTER};
use vm_core::error::{ObjectKind, VmError};
use vm_snapshot::privilege::{
    ALLOCATE_SPACE, ASSIGN_VM_TO_POOL, CREATE_FROM_EXISTING, CREATE_SNAPSHOT, PROVISION_CLONE,
};
use vm_snapshot::{Confirmation, CreateSnapshotRequest, RequestContext};

#[tokio::test]
async fn test_default_clone_name_derives_from_source() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");

    let record = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap();

    assert_eq!(record.clone_name, "clone-web-01");
    assert_eq!(record.clone_vm.name, "clone-web-01");
    assert_eq!(record.source_vm, fx.vm);
    assert_eq!(record.source_snapshot_id, base);
    assert_eq!(
        fx.gateway.linked_from(&record.clone_vm.id),
        Some((fx.vm.id.clone(), base.clone()))
    );
    assert_eq!(fx.manager.linked_clones(Some(&fx.vm)), vec![record]);
}

#[tokio::test]
async fn test_caller_supplied_clone_name_is_used_verbatim() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");

    let record = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, Some("ci-runner-7"))
        .await
        .unwrap();
    assert_eq!(record.clone_name, "ci-runner-7");

    // Blank counts as omitted
    let second = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, Some("  "))
        .await
        .unwrap();
    assert_eq!(second.clone_name, "clone-web-01");
    assert_ne!(record.id, second.id);
}

#[tokio::test]
async fn test_clone_is_resolvable_after_creation() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    let record = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, Some("ci-runner-7"))
        .await
        .unwrap();

    let resolved = fx
        .manager
        .resolve_vm(&ctx(), DATACENTER, "ci-runner-7")
        .await
        .unwrap();
    assert_eq!(resolved, record.clone_vm);
}

#[tokio::test]
async fn test_snapshot_removed_externally_before_clone_vanishes() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    // Looked up while it still existed
    let found = fx
        .manager
        .find_snapshot(&ctx(), &fx.vm, "golden")
        .await
        .unwrap();
    assert_eq!(found.id, base);

    fx.gateway.external_remove_snapshot(&fx.vm.id, &base, false);

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap_err();
    match err {
        VmError::SnapshotVanished { vm, snapshot_id } => {
            assert_eq!(vm, fx.vm.id);
            assert_eq!(snapshot_id, base);
        }
        other => panic!("expected SnapshotVanished, got {other}"),
    }
    assert_eq!(fx.gateway.call_count("createLinkedClone"), 0);
    assert!(fx.manager.linked_clones(None).is_empty());
}

#[tokio::test]
async fn test_snapshot_deleted_by_earlier_operation_vanishes() {
    let fx = fixture();
    let golden = fx
        .manager
        .create_snapshot(&ctx(), &fx.vm, CreateSnapshotRequest::named("golden"))
        .await
        .unwrap();

    fx.manager
        .delete_snapshot(&ctx(), &fx.vm, &golden.id, false, &Confirmation::Missing)
        .await
        .unwrap();

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &golden.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::SnapshotVanished { .. }));
    assert_eq!(fx.gateway.call_count("createLinkedClone"), 0);
}

#[tokio::test]
async fn test_concurrent_delete_and_clone_never_leave_dangling_clone() {
    let fx = fixture();
    let golden = fx
        .manager
        .create_snapshot(&ctx(), &fx.vm, CreateSnapshotRequest::named("golden"))
        .await
        .unwrap();

    let (ctx_delete, ctx_clone) = (ctx(), ctx());
    let (deleted, cloned) = tokio::join!(
        fx.manager
            .delete_snapshot(&ctx_delete, &fx.vm, &golden.id, false, &Confirmation::Missing),
        fx.manager.create_linked_clone(&ctx_clone, &fx.vm, &golden.id, None),
    );

    // Exactly one side wins: either the clone pins the snapshot, or the
    // snapshot is gone and no clone exists.
    match (deleted, cloned) {
        (Ok(_), Err(err)) => {
            assert!(matches!(err, VmError::SnapshotVanished { .. }));
            assert!(fx.manager.linked_clones(None).is_empty());
        }
        (Err(err), Ok(record)) => {
            assert!(matches!(err, VmError::DependentClones { .. }));
            assert!(fx.gateway.snapshot_ids(&fx.vm.id).contains(&record.source_snapshot_id));
        }
        (deleted, cloned) => panic!("unexpected outcome: {deleted:?} / {cloned:?}"),
    }
}

#[tokio::test]
async fn test_unknown_snapshot_is_not_found() {
    let fx = fixture();
    fx.gateway.add_snapshot(&fx.vm.id, "golden");

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, "snapshot-404", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VmError::NotFound {
            kind: ObjectKind::Snapshot,
            ..
        }
    ));
}

#[tokio::test]
async fn test_backing_snapshot_cannot_be_deleted_while_clone_exists() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    let record = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap();

    let err = fx
        .manager
        .delete_snapshot(&ctx(), &fx.vm, &base, false, &Confirmation::Missing)
        .await
        .unwrap_err();
    match err {
        VmError::DependentClones {
            snapshot_id,
            clones,
        } => {
            assert_eq!(snapshot_id, base);
            assert_eq!(clones, vec!["clone-web-01".to_string()]);
        }
        other => panic!("expected DependentClones, got {other}"),
    }

    let err = fx
        .manager
        .delete_all(&ctx(), &fx.vm, &Confirmation::of("web-01"))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::DependentClones { .. }));
    assert_eq!(fx.gateway.call_count("removeSnapshot"), 0);

    fx.manager
        .remove_linked_clone(&ctx(), &record.clone_vm, &Confirmation::of("clone-web-01"))
        .await
        .unwrap();
    fx.manager
        .delete_snapshot(&ctx(), &fx.vm, &base, false, &Confirmation::Missing)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remove_clone_requires_confirmation_and_keeps_snapshot() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    let record = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap();

    let err = fx
        .manager
        .remove_linked_clone(&ctx(), &record.clone_vm, &Confirmation::of("web-01"))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::ConfirmationRequired { .. }));
    assert!(fx.gateway.vm_exists(&record.clone_vm.id));

    let dropped = fx
        .manager
        .remove_linked_clone(
            &ctx(),
            &record.clone_vm,
            &Confirmation::of(record.clone_vm.id.clone()),
        )
        .await
        .unwrap();

    assert_eq!(dropped, Some(record.clone()));
    assert!(!fx.gateway.vm_exists(&record.clone_vm.id));
    assert_eq!(fx.gateway.snapshot_ids(&fx.vm.id), vec![base]);
    assert!(fx.manager.linked_clones(None).is_empty());
    assert_eq!(fx.gateway.call_count("removeSnapshot"), 0);
}

#[tokio::test]
async fn test_clone_privileges_are_reported_together() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    fx.gateway
        .grant("dev@vsphere.local", &fx.vm.id, [CREATE_SNAPSHOT]);

    let err = fx
        .manager
        .create_linked_clone(&RequestContext::new("dev@vsphere.local"), &fx.vm, &base, None)
        .await
        .unwrap_err();

    match err {
        VmError::PermissionDenied { missing, .. } => assert_eq!(
            missing,
            vec![
                PROVISION_CLONE,
                CREATE_FROM_EXISTING,
                ASSIGN_VM_TO_POOL,
                ALLOCATE_SPACE
            ]
        ),
        other => panic!("expected PermissionDenied, got {other}"),
    }
    assert_eq!(fx.gateway.call_count("createLinkedClone"), 0);
}

#[tokio::test]
async fn test_remote_clone_failure_creates_no_record() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    fx.gateway.reject_next("createLinkedClone", "insufficient disk space");

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::Remote { .. }));
    assert_eq!(fx.gateway.call_count("createLinkedClone"), 1);
    assert!(fx.manager.linked_clones(None).is_empty());
}

#[tokio::test]
async fn test_snapshot_removed_after_invalidation_still_vanishes() {
    let fx = fixture();
    let base = fx.gateway.add_snapshot(&fx.vm.id, "golden");
    fx.manager
        .find_snapshot(&ctx(), &fx.vm, "golden")
        .await
        .unwrap();

    fx.manager.invalidate(&fx.vm).await;
    fx.gateway.external_remove_snapshot(&fx.vm.id, &base, false);

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &base, None)
        .await
        .unwrap_err();
    match err {
        VmError::SnapshotVanished { snapshot_id, .. } => assert_eq!(snapshot_id, base),
        other => panic!("expected SnapshotVanished, got {other}"),
    }
    assert_eq!(fx.gateway.call_count("createLinkedClone"), 0);
}

#[tokio::test]
async fn test_root_removed_by_interrupted_delete_all_vanishes() {
    let fx = fixture();
    let first = fx.gateway.add_snapshot(&fx.vm.id, "first");
    // Nothing current, so the next snapshot is a second root
    fx.gateway.external_revert(&fx.vm.id, "");
    let second = fx.gateway.add_snapshot(&fx.vm.id, "second");
    fx.gateway.reject_after("removeSnapshot", 1, "datastore busy");

    let err = fx
        .manager
        .delete_all(&ctx(), &fx.vm, &Confirmation::of("web-01"))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::Remote { .. }));
    assert_eq!(fx.gateway.snapshot_ids(&fx.vm.id), vec![second.clone()]);

    let err = fx
        .manager
        .create_linked_clone(&ctx(), &fx.vm, &first, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::SnapshotVanished { .. }));

    // The surviving root can still be cloned
    fx.manager
        .create_linked_clone(&ctx(), &fx.vm, &second, None)
        .await
        .unwrap();
}
