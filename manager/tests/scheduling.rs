//! End-to-end scheduling scenarios

mod common;

use common::*;
use gridmesh_manager::events::SessionEventKind;
use gridmesh_manager::model::{ResourcePolicy, ScalingGroup, SessionStatus};
use gridmesh_manager::store::CounterKind;
use gridmesh_manager::AgentId;
use std::time::Duration;

#[tokio::test]
async fn test_fifo_single_node_happy_path() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 4, 8 * GIB).await;
    let mut events = h.ctx.events().subscribe();

    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 2, 4 * GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s1).await.unwrap();
    assert_eq!(session.status_history[0].status, SessionStatus::Scheduled);
    assert!(session.scheduled_at.is_some());
    assert!(session.fully_bound());
    assert_eq!(session.kernels[0].agent_id, Some(AgentId::new("a1")));

    let a1 = h.ctx.store().get_agent(&AgentId::new("a1")).await.unwrap();
    assert_eq!(a1.occupied_slots, slots(2, 4 * GIB));

    // SessionScheduled observed exactly once
    let mut scheduled = 0;
    while let Ok(event) = events.try_recv() {
        if event.session_id == s1 && event.kind == SessionEventKind::Scheduled {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
}

#[tokio::test]
async fn test_capacity_contention_records_reason() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 4, 8 * GIB).await;

    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 2, 4 * GIB)).await.unwrap();
    let s2 = h.ctx.create_session(single_node_spec("s2", "AK", 3, 2 * GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let first = h.ctx.store().get_session(s1).await.unwrap();
    assert_eq!(first.status_history[0].status, SessionStatus::Scheduled);

    // cpu remaining = 2 < 3
    let second = h.ctx.store().get_session(s2).await.unwrap();
    assert_eq!(second.status, SessionStatus::Pending);
    assert_eq!(second.status_data["scheduler"]["reason"], "NoSuitableAgent");
}

#[tokio::test]
async fn test_dependency_blocking_then_release() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 8, 16 * GIB).await;

    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 1, GIB)).await.unwrap();
    drive_until(&h.ctx, s1, SessionStatus::Running).await;

    let mut spec = single_node_spec("s2", "AK", 1, GIB);
    spec.dependencies = vec![s1];
    let s2 = h.ctx.create_session(spec).await.unwrap();

    h.ctx.reconcile_once().await;
    let blocked = h.ctx.store().get_session(s2).await.unwrap();
    assert_eq!(blocked.status, SessionStatus::Pending);
    assert_eq!(blocked.status_data["scheduler"]["reason"], "DependencyNotSatisfied");

    // S1 terminates successfully; the next tick releases S2
    h.ctx.destroy_session(s1).await.unwrap();
    drive_until(&h.ctx, s1, SessionStatus::Terminated).await;
    drive_until(&h.ctx, s2, SessionStatus::Running).await;
    let released = h.ctx.store().get_session(s2).await.unwrap();
    assert_eq!(released.status_history[0].status, SessionStatus::Scheduled);
}

#[tokio::test]
async fn test_multi_node_places_one_kernel_per_agent() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 4, 8 * GIB).await;
    add_agent(&h.ctx, "a2", 4, 8 * GIB).await;
    add_agent(&h.ctx, "a3", 4, 8 * GIB).await;

    let s = h.ctx.create_session(multi_node_spec("cluster", "AK", 4, 3)).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.status_history[0].status, SessionStatus::Scheduled);
    let mut hosts: Vec<String> = session
        .kernels
        .iter()
        .map(|k| k.agent_id.clone().unwrap().to_string())
        .collect();
    hosts.sort();
    assert_eq!(hosts, vec!["a1", "a2", "a3"]);
}

#[tokio::test]
async fn test_multi_node_all_or_nothing_rollback() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 4, 8 * GIB).await;
    add_agent(&h.ctx, "a2", 4, 8 * GIB).await;

    // Three 4-cpu kernels cannot fit on two 4-cpu agents
    let s = h.ctx.create_session(multi_node_spec("cluster", "AK", 4, 3)).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.status_data["scheduler"]["reason"], "NoSuitableAgent");
    assert!(session.kernels.iter().all(|k| k.agent_id.is_none()));

    for id in ["a1", "a2"] {
        let agent = h.ctx.store().get_agent(&AgentId::new(id)).await.unwrap();
        assert!(agent.occupied_slots.is_empty());
        assert_eq!(agent.container_count, 0);
    }
}

#[tokio::test]
async fn test_concurrency_limit_blocks_third_session() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 16, 32 * GIB).await;
    let key = gridmesh_manager::AccessKey::new("AK");
    let mut policy = ResourcePolicy::unlimited();
    policy.max_concurrent_sessions = 2;
    h.ctx.store().set_keypair_policy(key.clone(), policy).await;

    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 1, GIB)).await.unwrap();
    let s2 = h.ctx.create_session(single_node_spec("s2", "AK", 1, GIB)).await.unwrap();
    drive_until(&h.ctx, s1, SessionStatus::Running).await;
    drive_until(&h.ctx, s2, SessionStatus::Running).await;
    assert_eq!(h.ctx.store().concurrency(&key, CounterKind::Normal).await, 2);

    let s3 = h.ctx.create_session(single_node_spec("s3", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let blocked = h.ctx.store().get_session(s3).await.unwrap();
    assert_eq!(blocked.status, SessionStatus::Pending);
    assert_eq!(blocked.status_data["scheduler"]["reason"], "ConcurrencyLimit");
    // The counter is untouched by the denial
    assert_eq!(h.ctx.store().concurrency(&key, CounterKind::Normal).await, 2);
}

#[tokio::test]
async fn test_pending_timeout_cancels() {
    let h = harness_with_group(ScalingGroup::with_defaults(
        "default",
        Duration::from_millis(50),
    ))
    .await;
    // No agents: the session cannot be funded
    let s = h.ctx.create_session(single_node_spec("stuck", "AK", 2, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;
    assert_eq!(
        h.ctx.store().get_session(s).await.unwrap().status,
        SessionStatus::Pending
    );

    tokio::time::sleep(Duration::from_millis(80)).await;
    h.ctx.reconcile_once().await;

    let cancelled = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(cancelled.status_data["reason"], "PendingTimeout");
    // Never scheduled, so never counted
    let key = gridmesh_manager::AccessKey::new("AK");
    assert_eq!(h.ctx.store().concurrency(&key, CounterKind::Normal).await, 0);
}

#[tokio::test]
async fn test_zero_alive_agents_leaves_queue_untouched() {
    let h = harness().await;
    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 1, GIB)).await.unwrap();
    let s2 = h.ctx.create_session(single_node_spec("s2", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;
    h.ctx.reconcile_once().await;

    for id in [s1, s2] {
        let session = h.ctx.store().get_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        // No transitions ever happened
        assert!(session.status_history.is_empty());
    }
}

#[tokio::test]
async fn test_exact_fit_then_exhaustion() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 2, 4 * GIB).await;

    let s1 = h.ctx.create_session(single_node_spec("fit", "AK", 2, 4 * GIB)).await.unwrap();
    h.ctx.reconcile_once().await;
    let a1 = h.ctx.store().get_agent(&AgentId::new("a1")).await.unwrap();
    assert_eq!(a1.occupied_slots, a1.available_slots);
    assert_eq!(
        h.ctx.store().get_session(s1).await.unwrap().status_history[0].status,
        SessionStatus::Scheduled
    );

    let s2 = h.ctx.create_session(single_node_spec("late", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;
    let late = h.ctx.store().get_session(s2).await.unwrap();
    assert_eq!(late.status, SessionStatus::Pending);
    assert_eq!(late.status_data["scheduler"]["reason"], "NoSuitableAgent");
}

#[tokio::test]
async fn test_roundrobin_cursor_persists_to_scheduler_opts() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 8, 16 * GIB).await;
    add_agent(&h.ctx, "a2", 8, 16 * GIB).await;

    let s1 = h.ctx.create_session(single_node_spec("s1", "AK", 1, GIB)).await.unwrap();
    let s2 = h.ctx.create_session(single_node_spec("s2", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let first = h.ctx.store().get_session(s1).await.unwrap();
    let second = h.ctx.store().get_session(s2).await.unwrap();
    assert_ne!(first.kernels[0].agent_id, second.kernels[0].agent_id);

    let group = h.ctx.store().get_scaling_group("default").await.unwrap();
    assert_eq!(group.scheduler_opts["cursor"], serde_json::json!(2));
}

#[tokio::test]
async fn test_manual_agent_binds_to_designated() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 8, 16 * GIB).await;
    add_agent(&h.ctx, "a2", 8, 16 * GIB).await;

    let mut spec = single_node_spec("pinned", "AK", 1, GIB);
    spec.designated_agent = Some(AgentId::new("a2"));
    let s = h.ctx.create_session(spec).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.kernels[0].agent_id, Some(AgentId::new("a2")));
}

#[tokio::test]
async fn test_manual_agent_invalid_fails_session() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 2, 4 * GIB).await;

    let mut spec = single_node_spec("pinned", "AK", 8, GIB);
    spec.designated_agent = Some(AgentId::new("a1"));
    let s = h.ctx.create_session(spec).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.status_data["reason"], "ManualAgentInvalid");
}

#[tokio::test]
async fn test_reserved_batch_waits_for_window() {
    let h = harness().await;
    add_agent(&h.ctx, "a1", 4, 8 * GIB).await;

    let mut spec = single_node_spec("nightly", "AK", 1, GIB);
    spec.session_type = gridmesh_manager::model::SessionType::Batch;
    spec.starts_at = Some(chrono::Utc::now() + chrono::Duration::milliseconds(100));
    let s = h.ctx.create_session(spec).await.unwrap();

    h.ctx.reconcile_once().await;
    let waiting = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(waiting.status, SessionStatus::Pending);
    assert_eq!(waiting.status_data["scheduler"]["reason"], "ReservedTimeNotReached");

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.ctx.reconcile_once().await;
    let started = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(started.status_history[0].status, SessionStatus::Scheduled);
}

#[tokio::test]
async fn test_unknown_slot_rejected_at_admission() {
    let h = harness().await;
    let mut spec = single_node_spec("exotic", "AK", 1, GIB);
    spec.kernels[0].requested_slots = gridmesh_manager::ResourceSlot::from_pairs([(
        "quantum.qubits",
        rust_decimal::Decimal::from(8),
    )]);
    let err = h.ctx.create_session(spec).await.unwrap_err();
    assert!(matches!(err, gridmesh_manager::SchedulingError::UnknownSlot(_)));
}
