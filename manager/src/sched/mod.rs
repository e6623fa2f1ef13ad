//! Scheduler plugin interface and registry
//!
//! A scheduler is a pure value with two operations: `prioritize` orders the
//! pending queue for this tick, `pick` chooses the next session to attempt.
//! Plugins are discovered through a static registry populated at process
//! start; names are ordinary strings carried by scaling groups.

mod drf;
mod fairshare;
mod fifo;
mod lifo;

pub use drf::DrfScheduler;
pub use fairshare::FairShareScheduler;
pub use fifo::FifoScheduler;
pub use lifo::LifoScheduler;

use crate::error::{Result, SchedulingError};
use crate::model::{Agent, ClusterMode, Session};
use crate::resources::ResourceSlot;
use crate::SessionId;
use std::collections::HashMap;
use std::sync::Arc;

/// Free cluster capacity visible to pickers
#[derive(Debug, Clone)]
pub struct ClusterCapacity {
    agents: Vec<Agent>,
    existing: Vec<Session>,
}

impl ClusterCapacity {
    /// Snapshot the schedulable agents of a scaling group
    pub fn new(agents: Vec<Agent>) -> Self {
        Self { agents, existing: Vec::new() }
    }

    /// Attach the non-pending sessions of the group (share accounting)
    pub fn with_existing(mut self, existing: Vec<Session>) -> Self {
        self.existing = existing;
        self
    }

    /// Non-pending sessions of the group at snapshot time
    pub fn existing(&self) -> &[Session] {
        &self.existing
    }

    /// Total capacity across agents (dominant-share denominator)
    pub fn total_slots(&self) -> ResourceSlot {
        ResourceSlot::sum(self.agents.iter().map(|a| &a.available_slots))
    }

    /// Quick feasibility probe: could this session be funded right now?
    ///
    /// Single-node needs one agent that fits the whole demand; multi-node
    /// greedily packs kernels onto the emptiest fitting agents. This is a
    /// conservative approximation used by lookahead pickers only; placement
    /// remains the authority.
    pub fn can_fund(&self, session: &Session) -> bool {
        match session.cluster_mode {
            ClusterMode::SingleNode => self.agents.iter().any(|agent| {
                session
                    .kernels
                    .iter()
                    .all(|k| k.image.architecture == agent.architecture)
                    && session.requested_slots.le(&agent.free_slots())
                    && agent.has_container_headroom(session.cluster_size)
            }),
            ClusterMode::MultiNode => {
                let mut free: Vec<(String, ResourceSlot, u32, u32)> = self
                    .agents
                    .iter()
                    .map(|a| {
                        (
                            a.architecture.clone(),
                            a.free_slots(),
                            a.container_count,
                            a.max_container_count,
                        )
                    })
                    .collect();
                for kernel in session.kernels_in_placement_order() {
                    let candidate = free
                        .iter_mut()
                        .filter(|(arch, slots, count, max)| {
                            *arch == kernel.image.architecture
                                && kernel.requested_slots.le(slots)
                                && *count < *max
                        })
                        .max_by(|a, b| slot_weight(&a.1).cmp(&slot_weight(&b.1)));
                    match candidate {
                        Some((_, slots, count, _)) => {
                            *slots = slots
                                .checked_sub(&kernel.requested_slots)
                                .expect("le() checked above");
                            *count += 1;
                        }
                        None => return false,
                    }
                }
                true
            }
        }
    }
}

/// Scalar weight for comparing free capacities deterministically
fn slot_weight(slots: &ResourceSlot) -> rust_decimal::Decimal {
    slots.iter().map(|(_, v)| v).sum()
}

/// Scheduler plugin contract
pub trait Scheduler: Send + Sync {
    /// Registered plugin name
    fn name(&self) -> &'static str;

    /// Total order in which sessions are attempted this tick.
    ///
    /// Must be deterministic and stable with respect to priority descending,
    /// then FIFO by creation time, then session id.
    fn prioritize(&self, pending: Vec<Session>, existing: &[Session]) -> Vec<Session>;

    /// Choose the next session to attempt, or `None` to end the tick.
    ///
    /// Pickers may look past the head of the queue but must not reorder it.
    fn pick(&self, pending: &[Session], capacity: &ClusterCapacity) -> Option<SessionId>;
}

/// The stable base order: priority desc, created_at asc, session id asc
pub(crate) fn base_order(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

type SchedulerFactory = fn(&serde_json::Value) -> Arc<dyn Scheduler>;

/// Static name -> constructor registry for scheduler plugins
pub struct SchedulerRegistry {
    factories: HashMap<&'static str, SchedulerFactory>,
}

impl SchedulerRegistry {
    /// The default distribution: fifo, lifo, drf, fairshare
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, SchedulerFactory> = HashMap::new();
        factories.insert("fifo", |_| Arc::new(FifoScheduler));
        factories.insert("lifo", |_| Arc::new(LifoScheduler));
        factories.insert("drf", |_| Arc::new(DrfScheduler));
        factories.insert("fairshare", |_| Arc::new(FairShareScheduler));
        Self { factories }
    }

    /// Instantiate a scheduler by registered name
    pub fn create(&self, name: &str, opts: &serde_json::Value) -> Result<Arc<dyn Scheduler>> {
        self.factories
            .get(name)
            .map(|factory| factory(opts))
            .ok_or_else(|| SchedulingError::SchedulerPluginMissing { name: name.to_string() })
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::model::*;
    use crate::resources::ResourceSlot;
    use crate::{AccessKey, SessionId};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    pub fn slots(cpu: u64) -> ResourceSlot {
        ResourceSlot::from_pairs([("cpu", Decimal::from(cpu))])
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

    pub fn session(key: &str, cpu: u64, priority: i32, created_secs: i64) -> Session {
        let id = SessionId::new();
        Session {
            id,
            name: format!("s-{}", id),
            access_key: AccessKey::new(key),
            user_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            domain_name: "default".into(),
            scaling_group: "default".into(),
            session_type: SessionType::Interactive,
            cluster_mode: ClusterMode::SingleNode,
            cluster_size: 1,
            priority,
            starts_at: None,
            dependencies: vec![],
            designated_agent: None,
            vfolder_mounts: vec![],
            requested_slots: slots(cpu),
            status: SessionStatus::Pending,
            status_info: None,
            status_data: serde_json::json!({}),
            status_history: vec![],
            created_at: Utc.timestamp_opt(1_700_000_000 + created_secs, 0).unwrap(),
            scheduled_at: None,
            terminated_at: None,
            result: SessionResult::Undefined,
            kernels: vec![Kernel::new(id, KernelRole::Main, image(), slots(cpu))],
        }
    }

    pub fn agent(id: &str, cpu: u64) -> Agent {
        Agent {
            id: crate::AgentId::new(id),
            scaling_group: "default".into(),
            architecture: "x86_64".into(),
            available_slots: slots(cpu),
            occupied_slots: ResourceSlot::new(),
            status: AgentStatus::Alive,
            container_count: 0,
            max_container_count: 64,
            last_heartbeat: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::model::{Kernel, KernelRole};

    #[test]
    fn test_registry_knows_default_distribution() {
        let registry = SchedulerRegistry::builtin();
        assert_eq!(registry.names(), vec!["drf", "fairshare", "fifo", "lifo"]);
        assert!(registry.create("fifo", &serde_json::json!({})).is_ok());
        assert!(matches!(
            registry.create("weighted-lottery", &serde_json::json!({})),
            Err(SchedulingError::SchedulerPluginMissing { .. })
        ));
    }

    #[test]
    fn test_base_order_priority_then_fifo() {
        let a = session("AK", 1, 0, 10);
        let b = session("AK", 1, 5, 20);
        let c = session("AK", 1, 0, 5);
        let mut queue = vec![a.clone(), b.clone(), c.clone()];
        base_order(&mut queue);
        assert_eq!(queue[0].id, b.id); // highest priority wins
        assert_eq!(queue[1].id, c.id); // then oldest
        assert_eq!(queue[2].id, a.id);
    }

    #[test]
    fn test_can_fund_single_node() {
        let capacity = ClusterCapacity::new(vec![agent("a1", 4)]);
        assert!(capacity.can_fund(&session("AK", 4, 0, 0)));
        assert!(!capacity.can_fund(&session("AK", 5, 0, 0)));
    }

    #[test]
    fn test_can_fund_multi_node_spreads() {
        let mut s = session("AK", 4, 0, 0);
        s.cluster_mode = ClusterMode::MultiNode;
        s.cluster_size = 3;
        let sub1 = Kernel::new(s.id, KernelRole::Sub, image(), slots(4));
        let sub2 = Kernel::new(s.id, KernelRole::Sub, image(), slots(4));
        s.kernels.extend([sub1, sub2]);
        s.requested_slots = slots(12);
        let three = ClusterCapacity::new(vec![agent("a1", 4), agent("a2", 4), agent("a3", 4)]);
        assert!(three.can_fund(&s));
        let two = ClusterCapacity::new(vec![agent("a1", 4), agent("a2", 4)]);
        assert!(!two.can_fund(&s));
    }
}
