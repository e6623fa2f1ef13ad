//! Lifecycle orchestrator (the dispatcher)
//!
//! Ticks once per schedule interval per scaling group, plus immediately on
//! wake events (session created or cancelled, agent heartbeat). Each tick
//! runs under the group's lease lock: snapshot the pending queue and ALIVE
//! agents, prioritize and pick, validate, place, and commit; then drive
//! committed sessions onward through agent RPCs and observed progress
//! notices. Events publish only after commit.

use crate::config::ManagerConfig;
use crate::error::{ErrorClass, Result, SchedulingError};
use crate::events::EventHub;
use crate::lock::{schedule_key, LeaseLock, LockService};
use crate::model::{
    AgentStatus, ClusterMode, ImageRef, Kernel, KernelRole, ScalingGroup, Session,
    SessionResult, SessionStatus, VfolderMount,
};
use crate::resources::{ResourceSlot, SlotRegistry};
use crate::rpc::{AgentClient, AgentNotice, StorageProxyClient};
use crate::sched::{ClusterCapacity, Scheduler, SchedulerRegistry};
use crate::selector::{AgentSelector, SelectorRegistry};
use crate::store::{CounterKind, SessionFilter, StateStore};
use crate::validate::{run_chain, Decision, DenialKind};
use crate::{placement, AccessKey, AgentId, SessionId};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One kernel of a session spec
#[derive(Debug, Clone)]
pub struct KernelSpec {
    /// Role within the session
    pub role: KernelRole,
    /// Image to run
    pub image: ImageRef,
    /// Slot demand
    pub requested_slots: ResourceSlot,
}

/// Inbound session creation request
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Session name, unique per access key
    pub name: String,
    /// Owning keypair
    pub access_key: AccessKey,
    /// Owning user
    pub user_id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Owning domain
    pub domain_name: String,
    /// Target scaling group
    pub scaling_group: String,
    /// Workload type
    pub session_type: crate::model::SessionType,
    /// Kernel distribution mode
    pub cluster_mode: ClusterMode,
    /// Scheduling priority
    pub priority: i32,
    /// Reserved start time for batch sessions
    pub starts_at: Option<chrono::DateTime<Utc>>,
    /// Sessions that must terminate successfully first
    pub dependencies: Vec<SessionId>,
    /// Manually designated agent
    pub designated_agent: Option<AgentId>,
    /// Virtual folders to mount during preparation
    pub vfolder_mounts: Vec<VfolderMount>,
    /// Kernels, main first
    pub kernels: Vec<KernelSpec>,
}

/// Per-scaling-group dispatcher counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Scheduling ticks completed
    pub ticks: u64,
    /// Sessions moved to SCHEDULED
    pub sessions_scheduled: u64,
    /// Denials and placement failures recorded
    pub denials: u64,
    /// Scheduling transaction retries
    pub txn_retries: u64,
    /// Sessions cancelled by the pending timeout
    pub pending_timeouts: u64,
    /// Duration of the last tick in milliseconds
    pub last_tick_ms: u64,
}

/// The manager context: explicit root object carrying every collaborator
///
/// Lifecycle is `start` -> `run` -> `stop`; stop releases held leases and
/// stops the reconciliation loop.
pub struct ManagerContext {
    config: ManagerConfig,
    store: Arc<StateStore>,
    schedulers: SchedulerRegistry,
    selectors: SelectorRegistry,
    selector_cache: DashMap<String, Arc<dyn AgentSelector>>,
    locks: Arc<LockService>,
    hub: Arc<EventHub>,
    agent_client: Arc<dyn AgentClient>,
    storage: Arc<dyn StorageProxyClient>,
    notices: Mutex<mpsc::UnboundedReceiver<AgentNotice>>,
    slot_registry: SlotRegistry,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    stats: DashMap<String, DispatcherStats>,
    broken_groups: DashSet<String>,
    armed_wakes: DashSet<SessionId>,
}

impl ManagerContext {
    /// Build a started context from configuration and RPC collaborators
    pub fn start(
        config: ManagerConfig,
        agent_client: Arc<dyn AgentClient>,
        storage: Arc<dyn StorageProxyClient>,
        notices: mpsc::UnboundedReceiver<AgentNotice>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let slot_registry = config.slot_registry();
        Ok(Arc::new(Self {
            config,
            store: Arc::new(StateStore::new()),
            schedulers: SchedulerRegistry::builtin(),
            selectors: SelectorRegistry::builtin(),
            selector_cache: DashMap::new(),
            locks: Arc::new(LockService::new()),
            hub: Arc::new(EventHub::default()),
            agent_client,
            storage,
            notices: Mutex::new(notices),
            slot_registry,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            stats: DashMap::new(),
            broken_groups: DashSet::new(),
            armed_wakes: DashSet::new(),
        }))
    }

    /// The underlying state store
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// The event hub for subscribers
    pub fn events(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Stats snapshot for one scaling group
    pub fn stats(&self, scaling_group: &str) -> DispatcherStats {
        self.stats
            .get(scaling_group)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Run the reconciliation loop until [`stop`](Self::stop)
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.schedule.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.schedule.interval(), "dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.reconcile_once().await;
        }
        info!("dispatcher stopped");
    }

    /// Stop the loop and release every held lease
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.locks.release_all();
    }

    /// One full reconciliation pass over every scaling group
    ///
    /// Exposed so tests and wake handlers can drive the dispatcher
    /// deterministically without waiting for the interval.
    pub async fn reconcile_once(&self) {
        self.drain_notices().await;
        let heartbeat_deadline = Utc::now()
            - chrono::Duration::from_std(self.config.schedule.heartbeat_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.store.sweep_lost_agents(heartbeat_deadline).await;
        let groups = self.store.scaling_group_names().await;
        futures::future::join_all(groups.iter().map(|g| self.tick_group(g))).await;
        // RPC side effects may have produced progress already
        self.drain_notices().await;
    }

    // ------------------------------------------------------------------
    // Inbound operations
    // ------------------------------------------------------------------

    /// Admit a session for scheduling
    pub async fn create_session(&self, spec: SessionSpec) -> Result<SessionId> {
        if spec.kernels.is_empty() {
            return Err(SchedulingError::invalid_spec("session has zero kernels"));
        }
        let id = SessionId::new();
        let mut kernels = Vec::with_capacity(spec.kernels.len());
        for kernel_spec in &spec.kernels {
            let normalized = self.slot_registry.normalize(&kernel_spec.requested_slots)?;
            kernels.push(Kernel::new(
                id,
                kernel_spec.role,
                kernel_spec.image.clone(),
                normalized,
            ));
        }
        let requested_slots = ResourceSlot::sum(kernels.iter().map(|k| &k.requested_slots));
        let session = Session {
            id,
            name: spec.name,
            access_key: spec.access_key,
            user_id: spec.user_id,
            project_id: spec.project_id,
            domain_name: spec.domain_name,
            scaling_group: spec.scaling_group,
            session_type: spec.session_type,
            cluster_mode: spec.cluster_mode,
            cluster_size: kernels.len() as u32,
            priority: spec.priority,
            starts_at: spec.starts_at,
            dependencies: spec.dependencies,
            designated_agent: spec.designated_agent,
            vfolder_mounts: spec.vfolder_mounts,
            requested_slots,
            status: SessionStatus::Pending,
            status_info: None,
            status_data: serde_json::json!({}),
            status_history: vec![],
            created_at: Utc::now(),
            scheduled_at: None,
            terminated_at: None,
            result: SessionResult::Undefined,
            kernels,
        };
        let id = self.store.create_session(session).await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Cancel a session; idempotent on any state
    pub async fn cancel_session(&self, session_id: SessionId) -> Result<()> {
        self.terminate_session(session_id, "UserCancelled").await
    }

    /// Destroy a session; idempotent on any state
    pub async fn destroy_session(&self, session_id: SessionId) -> Result<()> {
        self.terminate_session(session_id, "UserRequested").await
    }

    /// Filtered session listing
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<Session> {
        self.store.list_sessions(filter).await
    }

    /// Agent heartbeat intake; wakes the scheduler
    pub async fn record_heartbeat(
        &self,
        agent_id: &AgentId,
        available_slots: Option<ResourceSlot>,
    ) -> Result<()> {
        self.store
            .record_heartbeat(agent_id, Utc::now(), available_slots)
            .await?;
        self.wake.notify_one();
        Ok(())
    }

    async fn terminate_session(&self, session_id: SessionId, cause: &'static str) -> Result<()> {
        let session = self.store.get_session(session_id).await?;
        match session.status {
            SessionStatus::Pending => {
                let event = self
                    .store
                    .cancel_pending(session_id, cause, "cancelled before scheduling")
                    .await?;
                self.hub.publish_all(vec![event]);
                self.wake.notify_one();
                Ok(())
            }
            SessionStatus::Terminating => {
                // Repeat request: re-dispatch destroys; idempotent agent-side
                self.dispatch_destroy(&session).await;
                Ok(())
            }
            status if status.is_terminal() => Ok(()),
            status => {
                let event = self
                    .store
                    .transition_session(
                        session_id,
                        status,
                        SessionStatus::Terminating,
                        Some(cause.to_string()),
                        None,
                    )
                    .await?;
                self.hub.publish_all(vec![event]);
                let session = self.store.get_session(session_id).await?;
                self.dispatch_destroy(&session).await;
                self.wake.notify_one();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-group tick
    // ------------------------------------------------------------------

    async fn tick_group(&self, group_name: &str) {
        if self.broken_groups.contains(group_name) {
            return;
        }
        let lease = self.config.schedule.lock_lease();
        let Some(_guard) = self.locks.try_acquire(&schedule_key(group_name), lease).await else {
            debug!(group = group_name, "scheduling lock busy; skipping tick");
            return;
        };
        let started = Instant::now();
        let budget = self.config.schedule.tick_budget();
        let tick = self.tick_group_locked(group_name);
        if tokio::time::timeout(budget, tick).await.is_err() {
            warn!(group = group_name, budget = ?budget, "tick exceeded wall-clock budget");
        }
        let mut stats = self.stats.entry(group_name.to_string()).or_default();
        stats.ticks += 1;
        stats.last_tick_ms = started.elapsed().as_millis() as u64;
    }

    async fn tick_group_locked(&self, group_name: &str) {
        let group = match self.store.get_scaling_group(group_name).await {
            Ok(group) => group,
            Err(err) => {
                error!(group = group_name, %err, "scaling group vanished");
                return;
            }
        };
        self.sweep_pending_timeouts(&group).await;
        self.schedule_pending(&group).await;
        self.drive_group_states(&group).await;
    }

    async fn schedule_pending(&self, group: &ScalingGroup) {
        let scheduler = match self.schedulers.create(&group.scheduler_name, &group.scheduler_opts)
        {
            Ok(scheduler) => scheduler,
            Err(err) => {
                error!(group = %group.name, %err, "refusing to schedule this group");
                self.broken_groups.insert(group.name.clone());
                return;
            }
        };
        let selector = match self.selector_for(group) {
            Ok(selector) => selector,
            Err(err) => {
                error!(group = %group.name, %err, "refusing to schedule this group");
                self.broken_groups.insert(group.name.clone());
                return;
            }
        };

        let pending = self.store.list_pending(&group.name).await;
        if pending.is_empty() {
            return;
        }
        let mut existing: Vec<Session> = self
            .store
            .list_active(&group.name)
            .await
            .into_iter()
            .filter(|s| s.status != SessionStatus::Pending)
            .collect();
        let mut queue = scheduler.prioritize(pending, &existing);

        while !queue.is_empty() {
            let agents = self.store.list_schedulable_agents(&group.name).await;
            let capacity = ClusterCapacity::new(agents.clone()).with_existing(existing.clone());
            let Some(picked) = scheduler.pick(&queue, &capacity) else {
                break;
            };
            let Some(position) = queue.iter().position(|s| s.id == picked) else {
                warn!(group = %group.name, session = %picked, "picker chose a session outside the queue");
                break;
            };
            let session = queue.remove(position);

            match self
                .try_schedule(group, &session, selector.as_ref())
                .await
            {
                Ok(true) => {
                    self.bump(&group.name, |s| s.sessions_scheduled += 1);
                    if let Ok(updated) = self.store.get_session(session.id).await {
                        existing.push(updated);
                    }
                }
                Ok(false) => {
                    // Denial recorded; move on to the next candidate
                    self.bump(&group.name, |s| s.denials += 1);
                }
                Err(err) => match err.class() {
                    ErrorClass::Transient => {
                        debug!(group = %group.name, session = %session.id, %err,
                               "recoverable scheduling failure; deferring to next tick");
                        let _ = self
                            .store
                            .record_scheduling_failure(session.id, err.reason(), err.to_string())
                            .await;
                        break;
                    }
                    ErrorClass::ResourceDenial | ErrorClass::PolicyDenial => {
                        self.bump(&group.name, |s| s.denials += 1);
                        let _ = self
                            .store
                            .record_scheduling_failure(session.id, err.reason(), err.to_string())
                            .await;
                    }
                    ErrorClass::FatalSession => {
                        let _ = self.fail_pending(session.id, &err).await;
                    }
                    ErrorClass::FatalSystemic => {
                        error!(group = %group.name, %err, "systemic failure; group disabled");
                        self.broken_groups.insert(group.name.clone());
                        break;
                    }
                },
            }
        }

        if let Some(cursor) = selector.cursor() {
            self.store.save_selector_cursor(&group.name, cursor).await;
        }
    }

    /// Validate, place, and commit one session.
    ///
    /// `Ok(true)` means committed, `Ok(false)` means a validator denial was
    /// recorded. The whole transaction retries on serialization conflicts
    /// with jittered backoff up to the configured budget.
    async fn try_schedule(
        &self,
        group: &ScalingGroup,
        session: &Session,
        selector: &dyn AgentSelector,
    ) -> Result<bool> {
        let mut attempt: u32 = 0;
        loop {
            // Fresh snapshots each attempt: the conflict that aborted the
            // previous attempt has already changed the world.
            let session = self.store.get_session(session.id).await?;
            if session.status != SessionStatus::Pending {
                return Err(SchedulingError::StaleState {
                    session: session.id.to_string(),
                    expected: SessionStatus::Pending.to_string(),
                    actual: session.status.to_string(),
                });
            }
            let bundle = self
                .store
                .read_policies(&session.access_key, session.project_id, &session.domain_name)
                .await;
            let view = self.store.validation_view(&session).await;
            if let Decision::Fail { kind, info } = run_chain(&session, group, &bundle, &view) {
                if kind == DenialKind::ReservedTimeNotReached {
                    // Tick again when the reservation opens instead of
                    // waiting for the interval
                    if let Some(starts_at) = session.starts_at {
                        self.arm_wake_at(session.id, starts_at);
                    }
                }
                self.store
                    .record_scheduling_failure(session.id, kind.reason(), info)
                    .await?;
                return Ok(false);
            }

            let agents = self.store.list_schedulable_agents(&group.name).await;
            let mut txn = placement::plan(&session, &agents, selector)?;
            txn.increment = Some((
                session.access_key.clone(),
                CounterKind::for_session(&session),
            ));

            match self.store.commit_scheduling(&txn).await {
                Ok(event) => {
                    self.hub.publish_all(vec![event]);
                    return Ok(true);
                }
                Err(err)
                    if err.class() == ErrorClass::Transient
                        && attempt + 1 < self.config.schedule.tx_retries =>
                {
                    attempt += 1;
                    self.bump(&group.name, |s| s.txn_retries += 1);
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fail a still-PENDING session for a fatal per-session error
    async fn fail_pending(&self, session_id: SessionId, err: &SchedulingError) -> Result<()> {
        let event = self
            .store
            .fail_session(session_id, SessionStatus::Pending, err.reason(), err.to_string())
            .await?;
        self.hub.publish_all(vec![event]);
        Ok(())
    }

    fn selector_for(&self, group: &ScalingGroup) -> Result<Arc<dyn AgentSelector>> {
        let cache_key = format!("{}:{}", group.name, group.agent_selector_name);
        if let Some(cached) = self.selector_cache.get(&cache_key) {
            return Ok(Arc::clone(&cached));
        }
        let selector = self
            .selectors
            .create(&group.agent_selector_name, &group.scheduler_opts)?;
        self.selector_cache.insert(cache_key, Arc::clone(&selector));
        Ok(selector)
    }

    fn bump(&self, group: &str, update: impl FnOnce(&mut DispatcherStats)) {
        let mut stats = self.stats.entry(group.to_string()).or_default();
        update(&mut stats);
    }

    /// Arm a one-shot wake when a reserved batch window opens
    fn arm_wake_at(&self, session_id: SessionId, starts_at: chrono::DateTime<Utc>) {
        let delay = (starts_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !self.armed_wakes.insert(session_id) {
            return;
        }
        let wake = Arc::clone(&self.wake);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => wake.notify_one(),
            }
        });
    }

    // ------------------------------------------------------------------
    // State driving
    // ------------------------------------------------------------------

    async fn drive_group_states(&self, group: &ScalingGroup) {
        for session in self.store.list_by_status(&group.name, SessionStatus::Scheduled).await {
            if let Err(err) = self.prepare_session(&session).await {
                warn!(session = %session.id, %err, "preparation dispatch failed");
            }
        }
        for session in self.store.list_by_status(&group.name, SessionStatus::Terminating).await {
            self.dispatch_destroy(&session).await;
        }
        self.sweep_lost_preparations(group).await;
    }

    /// SCHEDULED -> PREPARING: mounts, then create RPCs, then the transition
    async fn prepare_session(&self, session: &Session) -> Result<()> {
        for mount in &session.vfolder_mounts {
            let call = self.storage.mount(mount.vfolder_id, &mount.path);
            match self.with_rpc_timeout(call).await {
                Ok(()) => {}
                Err(err @ SchedulingError::RpcTimeout { .. }) => {
                    // Unknown outcome; stay SCHEDULED and reconcile next tick
                    warn!(session = %session.id, %err, "storage mount timed out");
                    return Ok(());
                }
                Err(err) => {
                    let event = self
                        .store
                        .fail_session(
                            session.id,
                            SessionStatus::Scheduled,
                            "StorageMount",
                            err.to_string(),
                        )
                        .await?;
                    self.hub.publish_all(vec![event]);
                    return Ok(());
                }
            }
        }

        let mut by_agent: HashMap<AgentId, Vec<Kernel>> = HashMap::new();
        for kernel in &session.kernels {
            if let Some(agent_id) = &kernel.agent_id {
                by_agent.entry(agent_id.clone()).or_default().push(kernel.clone());
            }
        }
        for (agent_id, kernels) in &by_agent {
            let call = self.agent_client.create_kernels(agent_id, session.id, kernels);
            match self.with_rpc_timeout(call).await {
                Ok(()) => {}
                Err(err @ SchedulingError::RpcTimeout { .. }) => {
                    warn!(session = %session.id, agent = %agent_id, %err,
                          "create_kernels timed out; will re-issue next tick");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        let event = self
            .store
            .transition_session(
                session.id,
                SessionStatus::Scheduled,
                SessionStatus::Preparing,
                None,
                None,
            )
            .await?;
        self.hub.publish_all(vec![event]);
        Ok(())
    }

    /// (Re-)dispatch kernel destruction; agent-side idempotency absorbs repeats
    async fn dispatch_destroy(&self, session: &Session) {
        for kernel in &session.kernels {
            if kernel.status.is_terminal() {
                continue;
            }
            let Some(agent_id) = &kernel.agent_id else {
                // Never bound; mark it gone directly
                if let Ok(Some(event)) = self.store.kernel_terminated(kernel.id).await {
                    self.hub.publish_all(vec![event]);
                }
                continue;
            };
            let call = self.agent_client.destroy_kernel(agent_id, kernel.id);
            if let Err(err) = self.with_rpc_timeout(call).await {
                warn!(kernel = %kernel.id, agent = %agent_id, %err,
                      "destroy_kernel failed; retrying next tick");
            }
        }
    }

    /// Cancel sessions stuck PENDING past the group's timeout
    async fn sweep_pending_timeouts(&self, group: &ScalingGroup) {
        let timeout = if group.pending_timeout.as_millis() > 0 {
            group.pending_timeout
        } else {
            self.config.schedule.pending_timeout_default()
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return;
        };
        let deadline = Utc::now() - timeout;
        for session in self.store.list_pending(&group.name).await {
            if session.created_at < deadline {
                match self
                    .store
                    .cancel_pending(session.id, "PendingTimeout", "pending timeout exceeded")
                    .await
                {
                    Ok(event) => {
                        self.bump(&group.name, |s| s.pending_timeouts += 1);
                        self.hub.publish_all(vec![event]);
                    }
                    Err(err) => debug!(session = %session.id, %err, "timeout sweep lost a race"),
                }
            }
        }
    }

    /// Fail sessions whose hosting agent went LOST mid-preparation
    async fn sweep_lost_preparations(&self, group: &ScalingGroup) {
        let agents: HashMap<AgentId, AgentStatus> = self
            .store
            .list_agents(&group.name)
            .await
            .into_iter()
            .map(|a| (a.id, a.status))
            .collect();
        let preparing = [
            SessionStatus::Preparing,
            SessionStatus::Pulling,
            SessionStatus::Prepared,
            SessionStatus::Creating,
        ];
        for status in preparing {
            for session in self.store.list_by_status(&group.name, status).await {
                let lost = session.kernels.iter().find_map(|k| {
                    let agent_id = k.agent_id.as_ref()?;
                    match agents.get(agent_id) {
                        Some(AgentStatus::Alive) => None,
                        _ => Some(agent_id.clone()),
                    }
                });
                if let Some(agent_id) = lost {
                    match self
                        .store
                        .fail_session(
                            session.id,
                            status,
                            "AgentLostDuringPreparation",
                            format!("agent {} lost during preparation", agent_id),
                        )
                        .await
                    {
                        Ok(event) => self.hub.publish_all(vec![event]),
                        Err(err) => debug!(session = %session.id, %err, "lost-agent sweep raced"),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Agent notice processing
    // ------------------------------------------------------------------

    async fn drain_notices(&self) {
        let mut notices = Vec::new();
        {
            let mut rx = self.notices.lock().await;
            while let Ok(notice) = rx.try_recv() {
                notices.push(notice);
            }
        }
        for notice in notices {
            if let Err(err) = self.apply_notice(notice).await {
                // StaleState here means a sweep or cancel got there first
                debug!(%err, "agent notice dropped");
            }
        }
    }

    async fn apply_notice(&self, notice: AgentNotice) -> Result<()> {
        match notice {
            AgentNotice::ImagePullStarted { session_id } => {
                let event = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Preparing,
                        SessionStatus::Pulling,
                        None,
                        None,
                    )
                    .await?;
                self.hub.publish_all(vec![event]);
            }
            AgentNotice::ImagePullFinished { session_id } => {
                let prepared = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Pulling,
                        SessionStatus::Prepared,
                        None,
                        None,
                    )
                    .await?;
                // Creation is already requested with create_kernels; the
                // CREATING phase tracks waiting for container starts.
                let creating = self
                    .store
                    .transition_session(
                        session_id,
                        SessionStatus::Prepared,
                        SessionStatus::Creating,
                        None,
                        None,
                    )
                    .await?;
                self.hub.publish_all(vec![prepared, creating]);
            }
            AgentNotice::KernelStarted { kernel_id, container_id } => {
                self.store
                    .update_kernel(kernel_id, crate::model::KernelStatus::Running, Some(container_id))
                    .await?;
                let session_id = self.store.session_of_kernel(kernel_id).await?;
                let session = self.store.get_session(session_id).await?;
                let all_running = session
                    .kernels
                    .iter()
                    .all(|k| k.status == crate::model::KernelStatus::Running);
                if session.status == SessionStatus::Creating && all_running {
                    let event = self
                        .store
                        .transition_session(
                            session_id,
                            SessionStatus::Creating,
                            SessionStatus::Running,
                            None,
                            None,
                        )
                        .await?;
                    self.hub.publish_all(vec![event]);
                }
            }
            AgentNotice::KernelTerminated { kernel_id } => {
                if let Some(event) = self.store.kernel_terminated(kernel_id).await? {
                    self.hub.publish_all(vec![event]);
                }
            }
            AgentNotice::KernelFailed { kernel_id, reason } => {
                let session_id = self.store.session_of_kernel(kernel_id).await?;
                let session = self.store.get_session(session_id).await?;
                if session.status.is_terminal() {
                    return Ok(());
                }
                if session.status == SessionStatus::Terminating {
                    if let Some(event) = self.store.kernel_terminated(kernel_id).await? {
                        self.hub.publish_all(vec![event]);
                    }
                    return Ok(());
                }
                let kind = if reason.contains("image pull") {
                    "ImageUnavailable"
                } else {
                    "KernelFailed"
                };
                let event = self
                    .store
                    .fail_session(session_id, session.status, kind, reason)
                    .await?;
                self.hub.publish_all(vec![event]);
            }
        }
        Ok(())
    }

    async fn with_rpc_timeout<F>(&self, call: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let timeout = self.config.schedule.rpc_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SchedulingError::RpcTimeout { timeout }),
        }
    }
}

/// Bounded jittered backoff between transaction retries
fn retry_backoff(attempt: u32) -> Duration {
    let base_ms = 10u64.saturating_mul(1 << attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
    Duration::from_millis((base_ms + jitter).min(1_000))
}
