//! Shared harness for dispatcher integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use gridmesh_manager::config::ManagerConfig;
use gridmesh_manager::dispatcher::{KernelSpec, ManagerContext, SessionSpec};
use gridmesh_manager::error::Result;
use gridmesh_manager::model::{
    Agent, AgentStatus, ClusterMode, ImageRef, Kernel, KernelRole, KernelStatus, ScalingGroup,
    SessionStatus, SessionType,
};
use gridmesh_manager::resources::ResourceSlot;
use gridmesh_manager::rpc::{AgentClient, LoopbackAgent, NullStorageProxy};
use gridmesh_manager::{AccessKey, AgentId, KernelId, SessionId};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn slots(cpu: u64, mem: u64) -> ResourceSlot {
    ResourceSlot::from_pairs([("cpu", Decimal::from(cpu)), ("mem", Decimal::from(mem))])
}

pub fn image() -> ImageRef {
    ImageRef {
        registry: "cr.example.com".into(),
        name: "python".into(),
        tag: "3.12".into(),
        architecture: "x86_64".into(),
        digest: None,
    }
}

pub struct Harness {
    pub ctx: Arc<ManagerContext>,
    pub agent: Arc<LoopbackAgent>,
    pub storage: Arc<NullStorageProxy>,
}

/// Context wired to the loopback agent with a default scaling group
pub async fn harness() -> Harness {
    harness_with_group(ScalingGroup::with_defaults("default", Duration::from_secs(86_400))).await
}

pub async fn harness_with_group(group: ScalingGroup) -> Harness {
    let config = ManagerConfig::default();
    let (agent, notices) = LoopbackAgent::new();
    let storage = NullStorageProxy::new();
    let ctx = ManagerContext::start(config, agent.clone(), storage.clone(), notices).unwrap();
    ctx.store().upsert_scaling_group(group).await;
    Harness { ctx, agent, storage }
}

/// An agent client that accepts every call but never reports progress.
/// Sessions dispatched through it stay wherever the manager put them.
pub struct SilentAgent;

#[async_trait]
impl AgentClient for SilentAgent {
    async fn create_kernels(
        &self,
        _agent_id: &AgentId,
        _session_id: SessionId,
        _kernels: &[Kernel],
    ) -> Result<()> {
        Ok(())
    }

    async fn destroy_kernel(&self, _agent_id: &AgentId, _kernel_id: KernelId) -> Result<()> {
        Ok(())
    }

    async fn get_kernel_status(
        &self,
        _agent_id: &AgentId,
        _kernel_id: KernelId,
    ) -> Result<KernelStatus> {
        Ok(KernelStatus::Pending)
    }
}

/// Context whose agents never answer back
pub async fn silent_harness() -> Arc<ManagerContext> {
    let config = ManagerConfig::default();
    let (_tx, notices) = mpsc::unbounded_channel();
    let storage: Arc<NullStorageProxy> = NullStorageProxy::new();
    let ctx = ManagerContext::start(config, Arc::new(SilentAgent), storage, notices).unwrap();
    ctx.store()
        .upsert_scaling_group(ScalingGroup::with_defaults("default", Duration::from_secs(86_400)))
        .await;
    ctx
}

pub async fn add_agent(ctx: &ManagerContext, id: &str, cpu: u64, mem: u64) {
    ctx.store()
        .upsert_agent(Agent {
            id: AgentId::new(id),
            scaling_group: "default".into(),
            architecture: "x86_64".into(),
            available_slots: slots(cpu, mem),
            occupied_slots: ResourceSlot::new(),
            status: AgentStatus::Alive,
            container_count: 0,
            max_container_count: 32,
            last_heartbeat: Utc::now(),
        })
        .await;
}

pub fn single_node_spec(name: &str, key: &str, cpu: u64, mem: u64) -> SessionSpec {
    SessionSpec {
        name: name.into(),
        access_key: AccessKey::new(key),
        user_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        domain_name: "default".into(),
        scaling_group: "default".into(),
        session_type: SessionType::Interactive,
        cluster_mode: ClusterMode::SingleNode,
        priority: 0,
        starts_at: None,
        dependencies: vec![],
        designated_agent: None,
        vfolder_mounts: vec![],
        kernels: vec![KernelSpec {
            role: KernelRole::Main,
            image: image(),
            requested_slots: slots(cpu, mem),
        }],
    }
}

pub fn multi_node_spec(name: &str, key: &str, kernel_cpu: u64, kernels: usize) -> SessionSpec {
    let mut kernel_specs = vec![KernelSpec {
        role: KernelRole::Main,
        image: image(),
        requested_slots: slots(kernel_cpu, GIB),
    }];
    for _ in 1..kernels {
        kernel_specs.push(KernelSpec {
            role: KernelRole::Sub,
            image: image(),
            requested_slots: slots(kernel_cpu, GIB),
        });
    }
    SessionSpec {
        cluster_mode: ClusterMode::MultiNode,
        kernels: kernel_specs,
        ..single_node_spec(name, key, 0, 0)
    }
}

/// Reconcile until the session reaches the wanted status (or panic)
pub async fn drive_until(ctx: &ManagerContext, session_id: SessionId, status: SessionStatus) {
    for _ in 0..10 {
        if ctx.store().get_session(session_id).await.unwrap().status == status {
            return;
        }
        ctx.reconcile_once().await;
    }
    let actual = ctx.store().get_session(session_id).await.unwrap().status;
    panic!("session never reached {}; stuck at {}", status, actual);
}
