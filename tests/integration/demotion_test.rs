// tests/integration/demotion_test.rs

//! Integration tests for the demotion state machine

use super::fixtures::{DRBDADM_SECONDARY_PEER_PRIMARY, EXPORT_SERVICE, RPC_SERVICE};
use super::test_helpers::{CommandFailure, FakeCluster, TestContext};
use roleswitch::TransitionOutcome;
use roleswitch::core::controller::{DemotionController, TransitionContext};
use roleswitch::core::status::{ConnectionState, Role};
use std::path::PathBuf;

async fn demote(ctx: &TestContext) -> TransitionOutcome {
    DemotionController::new(TransitionContext::new(&ctx.config, ctx.host()))
        .run()
        .await
}

#[tokio::test]
async fn test_demote_serving_primary() {
    let ctx = TestContext::new(FakeCluster::serving_primary());

    let outcome = demote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::Succeeded);
    assert_eq!(
        ctx.cluster.calls(),
        vec![
            "exportfs -ua",
            "stop nfs-server",
            "pkill rpc.mountd",
            "pkill rpc.statd",
            "stop rpcbind",
            "umount /srv/nfs Normal",
            "demote r0",
        ]
    );
    let state = ctx.cluster.state();
    assert_eq!(state.local_role, Role::Secondary);
    assert!(!state.is_mounted());
    assert!(!state.is_active(EXPORT_SERVICE));
    assert!(!state.exported);
}

#[tokio::test]
async fn test_demote_already_secondary_is_noop() {
    let cluster = FakeCluster::secondary();
    cluster.update(|s| s.status_text = Some(DRBDADM_SECONDARY_PEER_PRIMARY.to_string()));
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::AlreadyInTargetRole);
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_demote_secondary_with_leftovers_cleans_up_without_role_change() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.local_role = Role::Secondary);
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::Succeeded);
    let calls = ctx.cluster.calls();
    assert!(calls.contains(&"stop nfs-server".to_string()));
    assert!(calls.contains(&"umount /srv/nfs Normal".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("demote")));
}

#[tokio::test]
async fn test_demote_with_unreachable_peer_of_unknown_role() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.peer_role = Role::Unknown;
        s.connection = ConnectionState::Unconnected;
    });
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert_eq!(outcome, TransitionOutcome::Succeeded);
    let calls = ctx.cluster.calls();
    let stop = calls.iter().position(|c| c == "stop nfs-server").unwrap();
    let umount = calls.iter().position(|c| c.starts_with("umount")).unwrap();
    let demote = calls.iter().position(|c| c == "demote r0").unwrap();
    assert!(stop < umount && umount < demote);
    assert_eq!(ctx.cluster.state().local_role, Role::Secondary);
}

#[tokio::test]
async fn test_demote_refuses_when_disconnected_peer_last_seen_primary() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.peer_role = Role::Primary;
        s.connection = ConnectionState::StandAlone;
    });
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::AbortedUnsafe(ref r) if r.contains("last seen as Primary")));
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_demote_fails_when_peer_drops_after_teardown() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.peer_role = Role::Primary;
        s.after_unmount = Some(|state| {
            state.connection = ConnectionState::StandAlone;
            state.peer_role = Role::Unknown;
        });
    });
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(
        matches!(outcome, TransitionOutcome::Failed(ref r)
            if r.contains("last seen as Primary") && r.contains("still Primary")),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(ctx.cluster.count_calls("umount /srv/nfs Normal"), 1);
    assert_eq!(ctx.cluster.count_calls("demote r0"), 0);
    assert_eq!(ctx.cluster.state().local_role, Role::Primary);
}

#[tokio::test]
async fn test_demote_fails_when_status_lost_after_teardown() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.after_unmount = Some(|state| state.status_fails = true));
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(
        matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("status unavailable before demote")),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(ctx.cluster.count_calls("demote r0"), 0);
    assert!(!ctx.cluster.state().is_mounted());
}

#[tokio::test]
async fn test_demote_aborts_on_unknown_local_role() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.local_role = Role::Unknown);
    let ctx = TestContext::new(cluster);

    assert!(matches!(
        demote(&ctx).await,
        TransitionOutcome::AbortedUnsafe(_)
    ));
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_demote_aborts_when_status_unavailable() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.status_fails = true);
    let ctx = TestContext::new(cluster);

    assert!(matches!(
        demote(&ctx).await,
        TransitionOutcome::AbortedUnsafe(_)
    ));
    assert!(ctx.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_demote_busy_mount_uses_lazy_unmount() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.busy = true);
    let ctx = TestContext::new(cluster);

    assert_eq!(demote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("umount /srv/nfs Lazy"), 1);
    assert_eq!(ctx.cluster.count_calls("umount /srv/nfs Normal"), 0);
}

#[tokio::test]
async fn test_demote_stuck_mount_fails_before_demote() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.unmount_fails = true);
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("unmounted")));
    assert_eq!(
        ctx.cluster.calls().iter().filter(|c| c.starts_with("umount")).count(),
        3
    );
    assert_eq!(ctx.cluster.count_calls("umount /srv/nfs Force"), 1);
    assert_eq!(ctx.cluster.count_calls("demote r0"), 0);
    assert_eq!(ctx.cluster.state().local_role, Role::Primary);
}

#[tokio::test]
async fn test_demote_unstoppable_service_fails_before_unmount() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.stubborn.insert(EXPORT_SERVICE.to_string());
        s.kill_ineffective = true;
    });
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("nfs-server")));
    let calls = ctx.cluster.calls();
    assert!(calls.contains(&"kill nfs-server KILL".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("umount")));
    assert!(!calls.iter().any(|c| c.starts_with("demote")));
    assert!(ctx.cluster.state().is_mounted());
}

#[tokio::test]
async fn test_demote_failure_converged_is_success() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.demote_failure = Some(CommandFailure::Converged));
    let ctx = TestContext::new(cluster);

    assert_eq!(demote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("demote r0"), 1);
}

#[tokio::test]
async fn test_demote_failure_still_primary_requires_manual_intervention() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| s.demote_failure = Some(CommandFailure::Plain));
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(ref r) if r.contains("MANUAL INTERVENTION")));
    assert_eq!(ctx.cluster.count_calls("demote r0"), 1);
    let state = ctx.cluster.state();
    assert_eq!(state.local_role, Role::Primary);
    assert!(!state.is_mounted());
    assert!(!state.is_active(EXPORT_SERVICE));
}

#[tokio::test]
async fn test_demote_keeps_rpc_service_for_active_consumer() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.active.insert("nfs-client.target".to_string(), true);
    });
    let mut ctx = TestContext::new(cluster);
    ctx.config.services.rpc_consumers = vec!["nfs-client.target".to_string()];

    assert_eq!(demote(&ctx).await, TransitionOutcome::Succeeded);
    assert_eq!(ctx.cluster.count_calls("stop rpcbind"), 0);
    assert!(ctx.cluster.state().is_active(RPC_SERVICE));
}

#[tokio::test]
async fn test_demote_mounted_elsewhere_is_not_clean() {
    let cluster = FakeCluster::serving_primary();
    cluster.update(|s| {
        s.mounts.clear();
        s.mounts
            .insert(PathBuf::from("/mnt/other"), PathBuf::from("/dev/drbd0"));
        s.unmount_fails = true;
    });
    let ctx = TestContext::new(cluster);

    let outcome = demote(&ctx).await;

    assert!(matches!(outcome, TransitionOutcome::Failed(_)));
    assert_eq!(ctx.cluster.count_calls("demote r0"), 0);
}
