// tests/integration/promotion_test.rs

//! Integration tests for the promotion state machine

use super::fixtures::{
    DEVICE, DRBDADM_PRIMARY_CONNECTED, DRBDADM_PRIMARY_STANDALONE, DRBDADM_SECONDARY_PEER_PRIMARY,
    DRBDADM_SYNC_TARGET, EXPORT_SERVICE, RPC_SERVICE,
};
use super::test_helpers::{ClusterState, CommandFailure, FakeCluster, TestContext};
use roleswitch::TransitionOutcome;
use roleswitch::core::controller::{PromotionController, TransitionContext};
use roleswitch::core::status::{ConnectionState, DiskState, Role};
use std::path::{Path, PathBuf};

async fn promote(ctx: &TestContext) -> TransitionOutcome {
    PromotionController::new(TransitionContext::new(&ctx.config, ctx.host()))
        .run()
        .await
}

fn assert_aborted(outcome: &TransitionOutcome, needle: &str) {
    match outcome {
        TransitionOutcome::AbortedUnsafe(reason) => assert!(
            reason.contains(needle),
            "reason '{reason}' does not mention '{needle}'"
        ),
        other => panic!("Expected AbortedUnsafe, got {other:?}"),
    }
}

#[tokio::test]
async fn test_promote_healthy_secondary() {
    let ctx = TestContext::new(FakeCluster::secondary());

    let outcome = promote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::Succeeded);
    assert_eq!(
        ctx.cluster.calls(),
        vec![
            "promote r0",
            "mount /dev/drbd0 /srv/nfs ext4",
            "start rpcbind",
            "start nfs-server",
            "exportfs -ra",
        ]
    );
    let state = ctx.cluster.state();
    assert_eq!(state.local_role, Role::Primary);
    assert!(state.is_mounted());
    assert!(state.is_active(EXPORT_SERVICE));
    assert!(state.exported);
}

#[tokio::test]
async fn test_promote_leaves_running_rpc_service_alone() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| {
        s.active.insert(RPC_SERVICE.to_string(), true);
    });
    let ctx = TestContext::new(cluster);

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("start rpcbind"), 0);
    assert_eq!(ctx.cluster.count_calls("start nfs-server"), 1);
}

#[tokio::test]
async fn test_promote_aborts_when_peer_is_primary() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| s.status_text = Some(DRBDADM_SECONDARY_PEER_PRIMARY.to_string()));
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert_aborted(&outcome, "peer of 'r0' is Primary");
    assert!(ctx.cluster.calls().is_empty());
    assert_eq!(outcome.exit_code(), 2);
}

#[tokio::test]
async fn test_promote_aborts_when_disconnected_peer_was_primary() {
    let cluster = FakeCluster::new(ClusterState {
        peer_role: Role::Primary,
        connection: ConnectionState::StandAlone,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "Primary");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_aborts_when_connected_peer_role_unknown() {
    let cluster = FakeCluster::new(ClusterState {
        peer_role: Role::Unknown,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "peer role is Unknown");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_proceeds_when_unreachable_peer_role_unknown() {
    for connection in [
        ConnectionState::StandAlone,
        ConnectionState::Unconnected,
        ConnectionState::Connecting,
    ] {
        let cluster = FakeCluster::new(ClusterState {
            peer_role: Role::Unknown,
            peer_disk: DiskState::Unknown,
            connection,
            ..ClusterState::default()
        });
        let ctx = TestContext::new(cluster);

        let outcome = promote(&ctx).await;

        assert_eq!(outcome, TransitionOutcome::Succeeded, "connection {connection}");
        assert_eq!(ctx.cluster.count_calls("promote r0"), 1);
    }
}

#[tokio::test]
async fn test_promote_aborts_when_disconnecting_with_unknown_peer() {
    let cluster = FakeCluster::new(ClusterState {
        peer_role: Role::Unknown,
        connection: ConnectionState::Disconnecting,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "Disconnecting");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_aborts_on_unhealthy_local_disk() {
    for disk in [
        DiskState::Inconsistent,
        DiskState::Outdated,
        DiskState::Diskless,
        DiskState::Failed,
    ] {
        let cluster = FakeCluster::new(ClusterState {
            disk,
            ..ClusterState::default()
        });
        let ctx = TestContext::new(cluster);

        assert_aborted(&promote(&ctx).await, &format!("local disk of 'r0' is {disk}"));
        assert!(ctx.cluster.calls().is_empty());
    }
}

#[tokio::test]
async fn test_promote_aborts_on_unknown_local_role() {
    let cluster = FakeCluster::new(ClusterState {
        local_role: Role::Unknown,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "local role of 'r0' is Unknown");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_aborts_when_status_unavailable() {
    let cluster = FakeCluster::new(ClusterState {
        status_fails: true,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "cannot read status of 'r0'");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_aborts_when_resource_unknown() {
    let cluster = FakeCluster::new(ClusterState {
        resource_known: false,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "not found");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_aborts_on_unparseable_status() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| s.status_text = Some("r0 something unexpected\n".to_string()));
    let ctx = TestContext::new(cluster);

    assert!(matches!(
        promote(&ctx).await,
        TransitionOutcome::AbortedUnsafe(_)
    ));
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_waits_for_resync_to_finish() {
    let cluster = FakeCluster::new(ClusterState {
        disk: DiskState::Inconsistent,
        sync_percent: Some(50.0),
        sync_step: Some(30.0),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
    let state = ctx.cluster.state();
    assert_eq!(state.sync_percent, None);
    assert_eq!(state.disk, DiskState::UpToDate);
}

#[tokio::test]
async fn test_promote_gives_up_waiting_but_still_checks_disk() {
    let cluster = FakeCluster::new(ClusterState {
        disk: DiskState::Inconsistent,
        sync_percent: Some(40.0),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "Inconsistent");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_proceeds_after_wait_bound_when_local_disk_is_source() {
    let cluster = FakeCluster::new(ClusterState {
        peer_disk: DiskState::Inconsistent,
        sync_percent: Some(70.0),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("promote r0"), 1);
}

#[tokio::test]
async fn test_promote_aborts_when_peer_promotes_during_resync_wait() {
    let cluster = FakeCluster::new(ClusterState {
        disk: DiskState::Inconsistent,
        sync_percent: Some(10.0),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster.clone());

    let watcher = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cluster.update(|s| s.peer_role = Role::Primary);
    });
    let outcome = promote(&ctx).await;
    watcher.await.unwrap();

    assert_aborted(&outcome, "Primary");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_already_primary_and_serving_is_noop() {
    let ctx = TestContext::new(FakeCluster::serving_primary());

    let outcome = promote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::AlreadyInTargetRole);
    assert!(ctx.cluster.calls().is_empty());
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_promote_already_primary_from_status_dumps() {
    for dump in [DRBDADM_PRIMARY_CONNECTED, DRBDADM_PRIMARY_STANDALONE] {
        let cluster = FakeCluster::serving_primary();
        cluster.update(|s| s.status_text = Some(dump.to_string()));
        let ctx = TestContext::new(cluster);

        assert_eq!(promote(&ctx).await, TransitionOutcome::AlreadyInTargetRole);
        assert!(ctx.cluster.calls().is_empty());
    }
}

#[tokio::test]
async fn test_promote_aborts_while_syncing_from_primary_peer() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| s.status_text = Some(DRBDADM_SYNC_TARGET.to_string()));
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "Primary");
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_promote_already_primary_repairs_missing_mount() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.mounts.clear();
        s.active.insert(EXPORT_SERVICE.to_string(), false);
    });
    let ctx = TestContext::new(cluster);

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
    let calls = ctx.cluster.calls();
    assert!(!calls.iter().any(|c| c.starts_with("promote")));
    assert_eq!(calls[0], "mount /dev/drbd0 /srv/nfs ext4");
    assert!(ctx.cluster.state().is_mounted());
}

#[tokio::test]
async fn test_promote_failure_converged_is_success() {
    let cluster = FakeCluster::new(ClusterState {
        promote_failure: Some(CommandFailure::Converged),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("promote r0"), 1);
}

#[tokio::test]
async fn test_promote_failure_with_primary_peer_requires_manual_intervention() {
    let cluster = FakeCluster::new(ClusterState {
        promote_failure: Some(CommandFailure::PeerTookOver),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert_aborted(&promote(&ctx).await, "MANUAL INTERVENTION");
    assert_eq!(ctx.cluster.calls(), vec!["promote r0"]);
}

#[tokio::test]
async fn test_promote_failure_is_never_retried() {
    let cluster = FakeCluster::new(ClusterState {
        promote_failure: Some(CommandFailure::Plain),
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(_)));
    assert_eq!(ctx.cluster.calls(), vec!["promote r0"]);
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn test_promote_mount_failure_is_failed() {
    let cluster = FakeCluster::new(ClusterState {
        mount_fails: true,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("could not be mounted")));
    assert_eq!(ctx.cluster.state().local_role, Role::Primary);
    assert_eq!(ctx.cluster.count_calls("start nfs-server"), 0);
}

#[tokio::test]
async fn test_promote_refuses_device_without_filesystem() {
    let cluster = FakeCluster::new(ClusterState {
        fs_type: None,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    assert!(matches!(promote(&ctx).await, TransitionOutcome::Failed(_)));
    assert!(!ctx.cluster.calls().iter().any(|c| c.starts_with("mount")));
}

#[tokio::test]
async fn test_promote_refuses_unexpected_filesystem_type() {
    let mut ctx = TestContext::new(FakeCluster::secondary());
    ctx.config.filesystem.fs_type = Some("xfs".to_string());

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("xfs")));
    assert!(!ctx.cluster.calls().iter().any(|c| c.starts_with("mount")));
}

#[tokio::test]
async fn test_promote_refuses_mount_point_held_by_other_device() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| {
        s.mounts
            .insert(PathBuf::from("/srv/nfs"), PathBuf::from("/dev/sdb1"));
    });
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("/dev/sdb1")));
    assert_eq!(
        ctx.cluster.state().mounts.get(Path::new("/srv/nfs")),
        Some(&PathBuf::from("/dev/sdb1"))
    );
}

#[tokio::test]
async fn test_promote_export_service_start_failure_is_failed() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| {
        s.start_fails.insert(EXPORT_SERVICE.to_string());
    });
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("nfs-server")));
    let state = ctx.cluster.state();
    assert_eq!(state.local_role, Role::Primary);
    assert_eq!(state.mounts.get(Path::new("/srv/nfs")), Some(&PathBuf::from(DEVICE)));
}

#[tokio::test]
async fn test_promote_fails_when_export_not_visible() {
    let cluster = FakeCluster::new(ClusterState {
        export_visible: false,
        ..ClusterState::default()
    });
    let ctx = TestContext::new(cluster);

    let outcome = promote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("export table")));
}

#[tokio::test]
async fn test_promote_skips_export_check_when_disabled() {
    let mut ctx = TestContext::new(FakeCluster::new(ClusterState {
        export_visible: false,
        ..ClusterState::default()
    }));
    ctx.config.services.verify_export = false;

    assert_eq!(promote(&ctx).await, TransitionOutcome::Succeeded);
}
