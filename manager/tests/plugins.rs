//! Scheduler and selector plugin behavior through the dispatcher

mod common;

use common::*;
use chrono::Utc;
use gridmesh_manager::model::{Agent, AgentStatus, ScalingGroup, SessionStatus};
use gridmesh_manager::resources::ResourceSlot;
use gridmesh_manager::AgentId;
use std::time::Duration;

async fn add_agent_in(ctx: &gridmesh_manager::ManagerContext, group: &str, id: &str, cpu: u64) {
    ctx.store()
        .upsert_agent(Agent {
            id: AgentId::new(id),
            scaling_group: group.into(),
            architecture: "x86_64".into(),
            available_slots: slots(cpu, 64 * GIB),
            occupied_slots: ResourceSlot::new(),
            status: AgentStatus::Alive,
            container_count: 0,
            max_container_count: 32,
            last_heartbeat: Utc::now(),
        })
        .await;
}

#[tokio::test]
async fn test_drf_prefers_owner_with_smaller_share() {
    let mut group = ScalingGroup::with_defaults("default", Duration::from_secs(86_400));
    group.scheduler_name = "drf".into();
    let h = harness_with_group(group).await;
    add_agent(&h.ctx, "a1", 8, 64 * GIB).await;

    // AK-heavy occupies most of the cluster
    let big = h.ctx.create_session(single_node_spec("big", "AK-heavy", 7, GIB)).await.unwrap();
    drive_until(&h.ctx, big, SessionStatus::Running).await;

    // Heavy queued first, light second; only one cpu remains
    let heavy = h.ctx.create_session(single_node_spec("h", "AK-heavy", 1, GIB)).await.unwrap();
    let light = h.ctx.create_session(single_node_spec("l", "AK-light", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let light_row = h.ctx.store().get_session(light).await.unwrap();
    assert_eq!(light_row.status_history[0].status, SessionStatus::Scheduled);
    let heavy_row = h.ctx.store().get_session(heavy).await.unwrap();
    assert_eq!(heavy_row.status, SessionStatus::Pending);
    assert_eq!(heavy_row.status_data["scheduler"]["reason"], "NoSuitableAgent");
}

#[tokio::test]
async fn test_concentrated_selector_packs_tightest_agent() {
    let mut group = ScalingGroup::with_defaults("default", Duration::from_secs(86_400));
    group.agent_selector_name = "concentrated".into();
    let h = harness_with_group(group).await;
    add_agent(&h.ctx, "roomy", 16, 64 * GIB).await;
    add_agent(&h.ctx, "snug", 2, 8 * GIB).await;

    let s = h.ctx.create_session(single_node_spec("s", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.kernels[0].agent_id, Some(AgentId::new("snug")));
}

#[tokio::test]
async fn test_dispersed_selector_spreads_to_emptiest_agent() {
    let mut group = ScalingGroup::with_defaults("default", Duration::from_secs(86_400));
    group.agent_selector_name = "dispersed".into();
    let h = harness_with_group(group).await;
    add_agent(&h.ctx, "roomy", 16, 64 * GIB).await;
    add_agent(&h.ctx, "snug", 2, 8 * GIB).await;

    let s = h.ctx.create_session(single_node_spec("s", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    let session = h.ctx.store().get_session(s).await.unwrap();
    assert_eq!(session.kernels[0].agent_id, Some(AgentId::new("roomy")));
}

#[tokio::test]
async fn test_scaling_groups_schedule_independently() {
    let h = harness().await;
    h.ctx
        .store()
        .upsert_scaling_group(ScalingGroup::with_defaults("gpu", Duration::from_secs(86_400)))
        .await;
    add_agent_in(&h.ctx, "default", "cpu-node", 8).await;
    add_agent_in(&h.ctx, "gpu", "gpu-node", 8).await;

    let cpu_job = h.ctx.create_session(single_node_spec("cpu-job", "AK", 2, GIB)).await.unwrap();
    let mut gpu_spec = single_node_spec("gpu-job", "AK", 2, GIB);
    gpu_spec.scaling_group = "gpu".into();
    let gpu_job = h.ctx.create_session(gpu_spec).await.unwrap();

    h.ctx.reconcile_once().await;

    let cpu_row = h.ctx.store().get_session(cpu_job).await.unwrap();
    let gpu_row = h.ctx.store().get_session(gpu_job).await.unwrap();
    assert_eq!(cpu_row.kernels[0].agent_id, Some(AgentId::new("cpu-node")));
    assert_eq!(gpu_row.kernels[0].agent_id, Some(AgentId::new("gpu-node")));
}

#[tokio::test]
async fn test_unknown_scheduler_disables_only_its_group() {
    let mut broken = ScalingGroup::with_defaults("broken", Duration::from_secs(86_400));
    broken.scheduler_name = "weighted-lottery".into();
    let h = harness().await;
    h.ctx.store().upsert_scaling_group(broken).await;
    add_agent_in(&h.ctx, "default", "a1", 8).await;
    add_agent_in(&h.ctx, "broken", "b1", 8).await;

    let ok_job = h.ctx.create_session(single_node_spec("ok", "AK", 1, GIB)).await.unwrap();
    let mut stuck_spec = single_node_spec("stuck", "AK", 1, GIB);
    stuck_spec.scaling_group = "broken".into();
    let stuck_job = h.ctx.create_session(stuck_spec).await.unwrap();

    h.ctx.reconcile_once().await;
    h.ctx.reconcile_once().await;

    // The healthy group keeps scheduling; the misconfigured one refuses
    assert_eq!(
        h.ctx.store().get_session(ok_job).await.unwrap().status_history[0].status,
        SessionStatus::Scheduled
    );
    assert_eq!(
        h.ctx.store().get_session(stuck_job).await.unwrap().status,
        SessionStatus::Pending
    );
}

#[tokio::test]
async fn test_lifo_schedules_newest_first() {
    let mut group = ScalingGroup::with_defaults("default", Duration::from_secs(86_400));
    group.scheduler_name = "lifo".into();
    let h = harness_with_group(group).await;
    add_agent(&h.ctx, "a1", 1, 8 * GIB).await;

    let old = h.ctx.create_session(single_node_spec("old", "AK", 1, GIB)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let new = h.ctx.create_session(single_node_spec("new", "AK", 1, GIB)).await.unwrap();
    h.ctx.reconcile_once().await;

    assert_eq!(
        h.ctx.store().get_session(new).await.unwrap().status_history[0].status,
        SessionStatus::Scheduled
    );
    assert_eq!(
        h.ctx.store().get_session(old).await.unwrap().status,
        SessionStatus::Pending
    );
}
