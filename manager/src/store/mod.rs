//! Transactional state store
//!
//! The sole mutator of persistent scheduling state. Every read returns a
//! value-typed snapshot; every write validates its preconditions under the
//! store write lock and applies all-or-nothing. Status transitions are CAS
//! on the prior status and fail `StaleState` when reality moved, which the
//! dispatcher treats as a signal to re-read and retry.

pub mod txn;

pub use txn::{KernelBinding, SchedulingTxn};

use crate::error::{Result, SchedulingError};
use crate::events::{SessionEvent, SessionEventKind};
use crate::model::{
    Agent, AgentStatus, KernelStatus, PolicyBundle, ResourcePolicy, ScalingGroup, Session,
    SessionResult, SessionStatus, StatusEntry,
};
use crate::resources::ResourceSlot;
use crate::{AccessKey, AgentId, KernelId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which concurrency counter a session consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    /// Ordinary user sessions
    Normal,
    /// Private system sessions (SFTP sidecars)
    System,
}

impl CounterKind {
    /// Counter kind for a session
    pub fn for_session(session: &Session) -> Self {
        if session.session_type.is_private() {
            CounterKind::System
        } else {
            CounterKind::Normal
        }
    }
}

/// Filter for session listings
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Restrict to one access key
    pub access_key: Option<AccessKey>,
    /// Restrict to one scaling group
    pub scaling_group: Option<String>,
    /// Restrict to these statuses
    pub statuses: Option<Vec<SessionStatus>>,
}

/// Store-derived inputs for the validator chain, captured in one snapshot
#[derive(Debug, Clone)]
pub struct ValidationView {
    /// Snapshot time
    pub now: DateTime<Utc>,
    /// Current value of the session's concurrency counter
    pub concurrency_used: u32,
    /// PENDING sessions owned by the same access key (including this one)
    pub pending_count: u32,
    /// Committed slot usage by the same access key
    pub keypair_occupied: ResourceSlot,
    /// Committed slot usage by the same project
    pub group_occupied: ResourceSlot,
    /// Committed slot usage by the same domain
    pub domain_occupied: ResourceSlot,
    /// Status and result of each declared dependency
    pub dependencies: Vec<(SessionId, SessionStatus, SessionResult)>,
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<SessionId, Session>,
    kernel_index: HashMap<KernelId, SessionId>,
    agents: HashMap<AgentId, Agent>,
    scaling_groups: HashMap<String, ScalingGroup>,
    keypair_policies: HashMap<AccessKey, ResourcePolicy>,
    group_policies: HashMap<Uuid, ResourcePolicy>,
    domain_policies: HashMap<String, ResourcePolicy>,
    counters: HashMap<(AccessKey, CounterKind), u32>,
    commit_seq: u64,
}

impl StoreInner {
    fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| SchedulingError::NotFound { kind: "session", id: id.to_string() })
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| SchedulingError::NotFound { kind: "session", id: id.to_string() })
    }

    fn agent_mut(&mut self, id: &AgentId) -> Result<&mut Agent> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| SchedulingError::NotFound { kind: "agent", id: id.to_string() })
    }

    /// Committed usage: sessions whose reservations are live on agents
    fn usage_committed(&self, pred: impl Fn(&Session) -> bool) -> ResourceSlot {
        let committed = self
            .sessions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    SessionStatus::Scheduled
                        | SessionStatus::Preparing
                        | SessionStatus::Pulling
                        | SessionStatus::Prepared
                        | SessionStatus::Creating
                        | SessionStatus::Running
                        | SessionStatus::Terminating
                )
            })
            .filter(|s| pred(s))
            .map(|s| &s.requested_slots);
        ResourceSlot::sum(committed)
    }

    fn apply_transition(
        &mut self,
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        info: Option<String>,
        data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<SessionEvent> {
        let session = self.session_mut(session_id)?;
        if session.status != from {
            return Err(SchedulingError::StaleState {
                session: session_id.to_string(),
                expected: from.to_string(),
                actual: session.status.to_string(),
            });
        }
        if !SessionStatus::can_transition(from, to) {
            return Err(SchedulingError::StaleState {
                session: session_id.to_string(),
                expected: format!("state with an edge to {}", to),
                actual: from.to_string(),
            });
        }
        session.status = to;
        session.status_info = info.clone();
        if let Some(data) = data {
            session.status_data = data;
        }
        match to {
            SessionStatus::Scheduled => session.scheduled_at = Some(now),
            SessionStatus::Terminated | SessionStatus::Cancelled | SessionStatus::Error => {
                session.terminated_at = Some(now)
            }
            _ => {}
        }
        session.status_history.push(StatusEntry { status: to, timestamp: now, info: info.clone() });
        let seq = session.status_history.len();
        let reason = info.as_deref();
        let kind = SessionEventKind::for_status(to, reason)
            .expect("non-PENDING target always maps to an event");
        self.commit_seq += 1;
        Ok(SessionEvent { session_id, kind, occurred_at: now, seq })
    }

    /// Return a kernel's reservation to its agent; idempotent per kernel
    fn release_kernel(&mut self, session_id: SessionId, kernel_id: KernelId) -> Result<()> {
        let (agent_id, slots, already_terminal) = {
            let session = self.session(session_id)?;
            let kernel = session
                .kernels
                .iter()
                .find(|k| k.id == kernel_id)
                .ok_or_else(|| SchedulingError::NotFound {
                    kind: "kernel",
                    id: kernel_id.to_string(),
                })?;
            (
                kernel.agent_id.clone(),
                kernel.requested_slots.clone(),
                kernel.status.is_terminal(),
            )
        };
        if already_terminal {
            return Ok(());
        }
        if let Some(agent_id) = agent_id {
            if let Ok(agent) = self.agent_mut(&agent_id) {
                agent.occupied_slots = agent.occupied_slots.checked_sub(&slots).unwrap_or_else(|_| {
                    warn!("agent {} occupied slots underflow during release", agent_id);
                    ResourceSlot::new()
                });
                agent.container_count = agent.container_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    fn set_kernel_statuses(&mut self, session_id: SessionId, status: KernelStatus) -> Result<()> {
        let session = self.session_mut(session_id)?;
        for kernel in &mut session.kernels {
            if !kernel.status.is_terminal() {
                kernel.status = status;
            }
        }
        Ok(())
    }

    fn decrement_counter(&mut self, key: &AccessKey, kind: CounterKind) -> u32 {
        let counter = self.counters.entry((key.clone(), kind)).or_insert(0);
        *counter = counter.saturating_sub(1);
        *counter
    }
}

/// The transactional store
#[derive(Debug, Default)]
pub struct StateStore {
    inner: RwLock<StoreInner>,
}

impl StateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Registration and snapshots
    // ------------------------------------------------------------------

    /// Insert or replace an agent row
    pub async fn upsert_agent(&self, agent: Agent) {
        let mut inner = self.inner.write().await;
        inner.agents.insert(agent.id.clone(), agent);
    }

    /// Insert or replace a scaling group row
    pub async fn upsert_scaling_group(&self, group: ScalingGroup) {
        let mut inner = self.inner.write().await;
        inner.scaling_groups.insert(group.name.clone(), group);
    }

    /// Set the keypair-scope policy for an access key
    pub async fn set_keypair_policy(&self, key: AccessKey, policy: ResourcePolicy) {
        let mut inner = self.inner.write().await;
        inner.keypair_policies.insert(key, policy);
    }

    /// Set the project-scope policy
    pub async fn set_group_policy(&self, project_id: Uuid, policy: ResourcePolicy) {
        let mut inner = self.inner.write().await;
        inner.group_policies.insert(project_id, policy);
    }

    /// Set the domain-scope policy
    pub async fn set_domain_policy(&self, domain: impl Into<String>, policy: ResourcePolicy) {
        let mut inner = self.inner.write().await;
        inner.domain_policies.insert(domain.into(), policy);
    }

    /// Fetch one session snapshot
    pub async fn get_session(&self, id: SessionId) -> Result<Session> {
        let inner = self.inner.read().await;
        inner.session(id).cloned()
    }

    /// Fetch one agent snapshot
    pub async fn get_agent(&self, id: &AgentId) -> Result<Agent> {
        let inner = self.inner.read().await;
        inner
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulingError::NotFound { kind: "agent", id: id.to_string() })
    }

    /// Fetch one scaling group snapshot
    pub async fn get_scaling_group(&self, name: &str) -> Result<ScalingGroup> {
        let inner = self.inner.read().await;
        inner
            .scaling_groups
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulingError::NotFound { kind: "scaling group", id: name.into() })
    }

    /// Names of all registered scaling groups
    pub async fn scaling_group_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.scaling_groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// PENDING sessions of a scaling group, oldest first
    pub async fn list_pending(&self, scaling_group: &str) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.scaling_group == scaling_group)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// All agents of a scaling group, regardless of liveness
    pub async fn list_agents(&self, scaling_group: &str) -> Vec<Agent> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner
            .agents
            .values()
            .filter(|a| a.scaling_group == scaling_group)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// ALIVE agents of a scaling group
    pub async fn list_schedulable_agents(&self, scaling_group: &str) -> Vec<Agent> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner
            .agents
            .values()
            .filter(|a| a.scaling_group == scaling_group && a.is_schedulable())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Sessions currently in the given status within a scaling group
    pub async fn list_by_status(&self, scaling_group: &str, status: SessionStatus) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut out: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.status == status && s.scaling_group == scaling_group)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Filtered session listing
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut out: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| filter.access_key.as_ref().map_or(true, |k| &s.access_key == k))
            .filter(|s| filter.scaling_group.as_ref().map_or(true, |g| &s.scaling_group == g))
            .filter(|s| filter.statuses.as_ref().map_or(true, |st| st.contains(&s.status)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Non-terminal sessions in the scaling group (state-driving worklist)
    pub async fn list_active(&self, scaling_group: &str) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut out: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.scaling_group == scaling_group && !s.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Policy bundle for a session's owner identifiers
    pub async fn read_policies(
        &self,
        access_key: &AccessKey,
        project_id: Uuid,
        domain_name: &str,
    ) -> PolicyBundle {
        let inner = self.inner.read().await;
        PolicyBundle {
            keypair: inner
                .keypair_policies
                .get(access_key)
                .cloned()
                .unwrap_or_else(ResourcePolicy::unlimited),
            group: inner
                .group_policies
                .get(&project_id)
                .cloned()
                .unwrap_or_else(ResourcePolicy::unlimited),
            domain: inner
                .domain_policies
                .get(domain_name)
                .cloned()
                .unwrap_or_else(ResourcePolicy::unlimited),
        }
    }

    /// Snapshot of the store-derived inputs the validator chain needs
    pub async fn validation_view(&self, session: &Session) -> ValidationView {
        let inner = self.inner.read().await;
        let kind = CounterKind::for_session(session);
        let concurrency_used = inner
            .counters
            .get(&(session.access_key.clone(), kind))
            .copied()
            .unwrap_or(0);
        let pending_count = inner
            .sessions
            .values()
            .filter(|s| s.access_key == session.access_key && s.status == SessionStatus::Pending)
            .count() as u32;
        let dependencies = session
            .dependencies
            .iter()
            .filter_map(|dep| inner.sessions.get(dep).map(|s| (*dep, s.status, s.result)))
            .collect();
        ValidationView {
            now: Utc::now(),
            concurrency_used,
            pending_count,
            keypair_occupied: inner
                .usage_committed(|s| s.access_key == session.access_key && s.id != session.id),
            group_occupied: inner
                .usage_committed(|s| s.project_id == session.project_id && s.id != session.id),
            domain_occupied: inner
                .usage_committed(|s| s.domain_name == session.domain_name && s.id != session.id),
            dependencies,
        }
    }

    // ------------------------------------------------------------------
    // Session intake
    // ------------------------------------------------------------------

    /// Admit a new PENDING session
    ///
    /// Rejects zero-kernel specs and dependency sets that would close a
    /// cycle; neither ever reaches the scheduler.
    pub async fn create_session(&self, session: Session) -> Result<SessionId> {
        if session.kernels.is_empty() {
            return Err(SchedulingError::invalid_spec("session has zero kernels"));
        }
        if session.status != SessionStatus::Pending {
            return Err(SchedulingError::invalid_spec("new sessions must be PENDING"));
        }
        if session.kernels.iter().filter(|k| k.role.is_main()).count() != 1 {
            return Err(SchedulingError::invalid_spec("session needs exactly one main kernel"));
        }
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(SchedulingError::invalid_spec("session id already exists"));
        }
        // Reject dependency cycles: walk the existing graph from each
        // declared dependency and make sure this session is unreachable.
        let mut stack: Vec<SessionId> = session.dependencies.clone();
        let mut seen: Vec<SessionId> = Vec::new();
        while let Some(current) = stack.pop() {
            if current == session.id {
                return Err(SchedulingError::DependencyCycle {
                    session: session.id.to_string(),
                });
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(dep) = inner.sessions.get(&current) {
                stack.extend(dep.dependencies.iter().copied());
            }
        }
        for kernel in &session.kernels {
            inner.kernel_index.insert(kernel.id, session.id);
        }
        let id = session.id;
        info!(session = %id, name = %session.name, "session admitted");
        inner.sessions.insert(id, session);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Atomic single operations
    // ------------------------------------------------------------------

    /// Atomically reserve slots on an agent for one kernel
    pub async fn bind_kernel(
        &self,
        kernel_id: KernelId,
        agent_id: &AgentId,
        slots: &ResourceSlot,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session_id = *inner.kernel_index.get(&kernel_id).ok_or_else(|| {
            SchedulingError::NotFound { kind: "kernel", id: kernel_id.to_string() }
        })?;
        {
            let agent = inner.agent_mut(agent_id)?;
            let next = agent.occupied_slots.add(slots);
            if !next.le(&agent.available_slots) {
                let slot = slots
                    .names()
                    .find(|n| next.get(n) > agent.available_slots.get(n))
                    .unwrap_or("unknown")
                    .to_string();
                return Err(SchedulingError::CapacityConflict {
                    agent: agent_id.to_string(),
                    slot,
                });
            }
            if !agent.has_container_headroom(1) {
                return Err(SchedulingError::ContainerLimitReached { agent: agent_id.to_string() });
            }
            agent.occupied_slots = next;
            agent.container_count += 1;
        }
        let session = inner.session_mut(session_id)?;
        let kernel = session
            .kernels
            .iter_mut()
            .find(|k| k.id == kernel_id)
            .expect("kernel index and session rows agree");
        kernel.agent_id = Some(agent_id.clone());
        kernel.status = KernelStatus::Scheduled;
        Ok(())
    }

    /// CAS a session from `from` to `to`, appending history
    pub async fn transition_session(
        &self,
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        info: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<SessionEvent> {
        let mut inner = self.inner.write().await;
        inner.apply_transition(session_id, from, to, info, data, Utc::now())
    }

    /// Atomically bump a concurrency counter; returns the new value
    pub async fn increment_concurrency(&self, key: &AccessKey, kind: CounterKind) -> u32 {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry((key.clone(), kind)).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Atomically drop a concurrency counter, clamped at zero
    pub async fn decrement_concurrency(&self, key: &AccessKey, kind: CounterKind) -> u32 {
        let mut inner = self.inner.write().await;
        inner.decrement_counter(key, kind)
    }

    /// Current value of a concurrency counter
    pub async fn concurrency(&self, key: &AccessKey, kind: CounterKind) -> u32 {
        let inner = self.inner.read().await;
        inner.counters.get(&(key.clone(), kind)).copied().unwrap_or(0)
    }

    /// Append a status-history record without a transition (annotation only)
    pub async fn append_status_history(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        timestamp: DateTime<Utc>,
        info: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session = inner.session_mut(session_id)?;
        session.status_history.push(StatusEntry { status, timestamp, info });
        Ok(())
    }

    /// Record a scheduling denial without changing state
    ///
    /// Leaves the session PENDING; the reason lands in `status_data` where
    /// API clients read it. Lost to a concurrent transition, the write is
    /// silently skipped.
    pub async fn record_scheduling_failure(
        &self,
        session_id: SessionId,
        reason: &str,
        detail: impl Into<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let session = inner.session_mut(session_id)?;
        if session.status != SessionStatus::Pending {
            return Ok(());
        }
        let retries = session
            .status_data
            .get("scheduler")
            .and_then(|s| s.get("retries"))
            .and_then(|r| r.as_u64())
            .unwrap_or(0)
            + 1;
        session.status_data = serde_json::json!({
            "scheduler": {
                "reason": reason,
                "detail": detail.into(),
                "retries": retries,
                "last_try": now.to_rfc3339(),
            }
        });
        debug!(session = %session_id, reason, retries, "scheduling denied");
        Ok(())
    }

    /// Persist a selector cursor under `scheduler_opts.cursor`
    pub async fn save_selector_cursor(&self, scaling_group: &str, cursor: serde_json::Value) {
        let mut inner = self.inner.write().await;
        if let Some(group) = inner.scaling_groups.get_mut(scaling_group) {
            if let Some(opts) = group.scheduler_opts.as_object_mut() {
                opts.insert("cursor".into(), cursor);
            } else {
                group.scheduler_opts = serde_json::json!({ "cursor": cursor });
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling transaction
    // ------------------------------------------------------------------

    /// Commit one scheduling decision atomically
    ///
    /// Validates the CAS precondition and every reservation against the
    /// locked state, then applies bindings, the SCHEDULED transition, and
    /// the concurrency increment together. On any failure nothing is
    /// applied and the buffered event is discarded.
    pub async fn commit_scheduling(&self, txn: &SchedulingTxn) -> Result<SessionEvent> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        // Precondition: the session is still PENDING
        {
            let session = inner.session(txn.session_id)?;
            if session.status != SessionStatus::Pending {
                return Err(SchedulingError::StaleState {
                    session: txn.session_id.to_string(),
                    expected: SessionStatus::Pending.to_string(),
                    actual: session.status.to_string(),
                });
            }
            if txn.bindings.len() != session.kernels.len() {
                return Err(SchedulingError::conflict(format!(
                    "transaction binds {} of {} kernels",
                    txn.bindings.len(),
                    session.kernels.len()
                )));
            }
        }

        // Validate every reservation against scratch copies before touching
        // the real rows; a mid-apply abort must not be observable.
        let mut scratch: HashMap<AgentId, Agent> = HashMap::new();
        for binding in &txn.bindings {
            let agent = match scratch.get(&binding.agent_id) {
                Some(a) => a.clone(),
                None => inner
                    .agents
                    .get(&binding.agent_id)
                    .cloned()
                    .ok_or_else(|| SchedulingError::NotFound {
                        kind: "agent",
                        id: binding.agent_id.to_string(),
                    })?,
            };
            if !agent.is_schedulable() {
                return Err(SchedulingError::conflict(format!(
                    "agent {} is no longer schedulable",
                    binding.agent_id
                )));
            }
            let next = agent.occupied_slots.add(&binding.slots);
            if !next.le(&agent.available_slots) {
                let slot = binding
                    .slots
                    .names()
                    .find(|n| next.get(n) > agent.available_slots.get(n))
                    .unwrap_or("unknown")
                    .to_string();
                return Err(SchedulingError::CapacityConflict {
                    agent: binding.agent_id.to_string(),
                    slot,
                });
            }
            if !agent.has_container_headroom(1) {
                return Err(SchedulingError::ContainerLimitReached {
                    agent: binding.agent_id.to_string(),
                });
            }
            let mut updated = agent;
            updated.occupied_slots = next;
            updated.container_count += 1;
            scratch.insert(binding.agent_id.clone(), updated);
        }

        // All reservations check out; apply in one sweep.
        for (agent_id, updated) in scratch {
            inner.agents.insert(agent_id, updated);
        }
        {
            let session = inner.session_mut(txn.session_id)?;
            for binding in &txn.bindings {
                let kernel = session
                    .kernels
                    .iter_mut()
                    .find(|k| k.id == binding.kernel_id)
                    .ok_or_else(|| SchedulingError::NotFound {
                        kind: "kernel",
                        id: binding.kernel_id.to_string(),
                    })?;
                kernel.agent_id = Some(binding.agent_id.clone());
                kernel.status = KernelStatus::Scheduled;
            }
        }
        if let Some((key, kind)) = &txn.increment {
            let counter = inner.counters.entry((key.clone(), *kind)).or_insert(0);
            *counter += 1;
        }
        let event = inner.apply_transition(
            txn.session_id,
            SessionStatus::Pending,
            SessionStatus::Scheduled,
            txn.info.clone(),
            Some(serde_json::json!({})),
            now,
        )?;
        info!(session = %txn.session_id, kernels = txn.bindings.len(), "session scheduled");
        Ok(event)
    }

    // ------------------------------------------------------------------
    // Terminal paths
    // ------------------------------------------------------------------

    /// Cancel a PENDING session (user cancel or pending timeout)
    ///
    /// No reservations exist and the concurrency counter was never bumped,
    /// so only the transition applies.
    pub async fn cancel_pending(
        &self,
        session_id: SessionId,
        reason: &str,
        info: impl Into<String>,
    ) -> Result<SessionEvent> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let event = inner.apply_transition(
            session_id,
            SessionStatus::Pending,
            SessionStatus::Cancelled,
            Some(info.into()),
            Some(serde_json::json!({ "reason": reason })),
            now,
        )?;
        inner.set_kernel_statuses(session_id, KernelStatus::Cancelled)?;
        let session = inner.session_mut(session_id)?;
        session.result = SessionResult::Failure;
        Ok(event)
    }

    /// Complete termination: TERMINATING -> TERMINATED with release and
    /// concurrency decrement in one atomic step
    pub async fn complete_termination(
        &self,
        session_id: SessionId,
        result: SessionResult,
    ) -> Result<SessionEvent> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let event = inner.apply_transition(
            session_id,
            SessionStatus::Terminating,
            SessionStatus::Terminated,
            None,
            None,
            now,
        )?;
        let kernel_ids: Vec<KernelId> =
            inner.session(session_id)?.kernels.iter().map(|k| k.id).collect();
        for kernel_id in kernel_ids {
            inner.release_kernel(session_id, kernel_id)?;
        }
        inner.set_kernel_statuses(session_id, KernelStatus::Terminated)?;
        let (key, kind) = {
            let session = inner.session_mut(session_id)?;
            session.result = result;
            (session.access_key.clone(), CounterKind::for_session(session))
        };
        inner.decrement_counter(&key, kind);
        Ok(event)
    }

    /// Fail a session after placement: -> ERROR with release and decrement
    pub async fn fail_session(
        &self,
        session_id: SessionId,
        from: SessionStatus,
        reason: &str,
        info: impl Into<String>,
    ) -> Result<SessionEvent> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let info = info.into();
        // PENDING sessions never passed the concurrency increment
        let counted = from != SessionStatus::Pending;
        let event = inner.apply_transition(
            session_id,
            from,
            SessionStatus::Error,
            Some(info.clone()),
            Some(serde_json::json!({ "reason": reason, "detail": info })),
            now,
        )?;
        let kernel_ids: Vec<KernelId> =
            inner.session(session_id)?.kernels.iter().map(|k| k.id).collect();
        for kernel_id in kernel_ids {
            inner.release_kernel(session_id, kernel_id)?;
        }
        inner.set_kernel_statuses(session_id, KernelStatus::Error)?;
        let (key, kind) = {
            let session = inner.session_mut(session_id)?;
            session.result = SessionResult::Failure;
            (session.access_key.clone(), CounterKind::for_session(session))
        };
        if counted {
            inner.decrement_counter(&key, kind);
        }
        warn!(session = %session_id, reason, "session failed");
        Ok(event)
    }

    /// Record one kernel's termination: release its reservation and, when
    /// it was the last live kernel of a TERMINATING session, complete the
    /// session (transition, result, concurrency decrement) atomically.
    pub async fn kernel_terminated(&self, kernel_id: KernelId) -> Result<Option<SessionEvent>> {
        let mut inner = self.inner.write().await;
        let session_id = *inner.kernel_index.get(&kernel_id).ok_or_else(|| {
            SchedulingError::NotFound { kind: "kernel", id: kernel_id.to_string() }
        })?;
        inner.release_kernel(session_id, kernel_id)?;
        {
            let session = inner.session_mut(session_id)?;
            if let Some(kernel) = session.kernels.iter_mut().find(|k| k.id == kernel_id) {
                if !kernel.status.is_terminal() {
                    kernel.status = KernelStatus::Terminated;
                }
            }
        }
        let session = inner.session(session_id)?;
        let all_done = session.kernels.iter().all(|k| k.status.is_terminal());
        if session.status != SessionStatus::Terminating || !all_done {
            return Ok(None);
        }
        let now = Utc::now();
        let event = inner.apply_transition(
            session_id,
            SessionStatus::Terminating,
            SessionStatus::Terminated,
            None,
            None,
            now,
        )?;
        let (key, kind) = {
            let session = inner.session_mut(session_id)?;
            session.result = SessionResult::Success;
            (session.access_key.clone(), CounterKind::for_session(session))
        };
        inner.decrement_counter(&key, kind);
        Ok(Some(event))
    }

    // ------------------------------------------------------------------
    // Kernel progress and agent liveness
    // ------------------------------------------------------------------

    /// Update one kernel's status and container id
    pub async fn update_kernel(
        &self,
        kernel_id: KernelId,
        status: KernelStatus,
        container_id: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session_id = *inner.kernel_index.get(&kernel_id).ok_or_else(|| {
            SchedulingError::NotFound { kind: "kernel", id: kernel_id.to_string() }
        })?;
        let session = inner.session_mut(session_id)?;
        let kernel = session
            .kernels
            .iter_mut()
            .find(|k| k.id == kernel_id)
            .expect("kernel index and session rows agree");
        kernel.status = status;
        if container_id.is_some() {
            kernel.container_id = container_id;
        }
        Ok(())
    }

    /// Refresh an agent's heartbeat and advertised capacity
    pub async fn record_heartbeat(
        &self,
        agent_id: &AgentId,
        at: DateTime<Utc>,
        available_slots: Option<ResourceSlot>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let agent = inner.agent_mut(agent_id)?;
        agent.last_heartbeat = at;
        if let Some(slots) = available_slots {
            agent.available_slots = slots;
        }
        if agent.status == AgentStatus::Lost {
            info!(agent = %agent_id, "agent recovered");
            agent.status = AgentStatus::Alive;
        }
        Ok(())
    }

    /// Mark agents silent past the deadline as LOST; returns those flipped
    pub async fn sweep_lost_agents(&self, deadline: DateTime<Utc>) -> Vec<AgentId> {
        let mut inner = self.inner.write().await;
        let mut lost = Vec::new();
        for agent in inner.agents.values_mut() {
            if agent.status == AgentStatus::Alive && agent.last_heartbeat < deadline {
                agent.status = AgentStatus::Lost;
                lost.push(agent.id.clone());
            }
        }
        for id in &lost {
            warn!(agent = %id, "agent marked LOST");
        }
        lost
    }

    /// Monotonic commit sequence, for tests and stats
    pub async fn commit_seq(&self) -> u64 {
        self.inner.read().await.commit_seq
    }
}

/// Look up the owning session of a kernel
impl StateStore {
    /// Session owning the given kernel
    pub async fn session_of_kernel(&self, kernel_id: KernelId) -> Result<SessionId> {
        let inner = self.inner.read().await;
        inner.kernel_index.get(&kernel_id).copied().ok_or_else(|| {
            SchedulingError::NotFound { kind: "kernel", id: kernel_id.to_string() }
        })
    }
}
