//! Scheduling transaction description
//!
//! A scheduling decision is committed as one atomic unit: kernel bindings,
//! the PENDING -> SCHEDULED transition, the concurrency increment, and the
//! buffered event either all become visible or none do.

use crate::resources::ResourceSlot;
use crate::store::CounterKind;
use crate::{AccessKey, AgentId, KernelId, SessionId};

/// One kernel-to-agent reservation inside a scheduling transaction
#[derive(Debug, Clone)]
pub struct KernelBinding {
    /// Kernel being bound
    pub kernel_id: KernelId,
    /// Agent chosen to host it
    pub agent_id: AgentId,
    /// Slots to reserve on the agent
    pub slots: ResourceSlot,
}

/// The atomic commit unit for one scheduling decision
#[derive(Debug, Clone)]
pub struct SchedulingTxn {
    /// Session being scheduled
    pub session_id: SessionId,
    /// Every kernel of the session, bound to its agent
    pub bindings: Vec<KernelBinding>,
    /// Concurrency counter to bump on commit (from the validator chain)
    pub increment: Option<(AccessKey, CounterKind)>,
    /// Optional status annotation recorded with the transition
    pub info: Option<String>,
}

impl SchedulingTxn {
    /// Start an empty transaction for a session
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, bindings: Vec::new(), increment: None, info: None }
    }

    /// Add a kernel binding
    pub fn bind(&mut self, kernel_id: KernelId, agent_id: AgentId, slots: ResourceSlot) {
        self.bindings.push(KernelBinding { kernel_id, agent_id, slots });
    }
}
