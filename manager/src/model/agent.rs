//! Agent value type: a worker node hosting kernels

use crate::resources::ResourceSlot;
use crate::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent liveness states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Heartbeating and schedulable
    Alive,
    /// Missed heartbeats; not schedulable
    Lost,
    /// Deregistered
    Terminated,
    /// Restarting; not schedulable until it reports back
    Restarting,
}

/// A worker node that hosts kernel containers
///
/// Invariant: `occupied_slots <= available_slots` at every committed
/// transaction boundary; no reservation may violate this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Agent identifier
    pub id: AgentId,
    /// The one scaling group this agent belongs to
    pub scaling_group: String,
    /// CPU architecture tag (x86_64, aarch64, ...)
    pub architecture: String,
    /// Total capacity
    pub available_slots: ResourceSlot,
    /// Currently reserved capacity
    pub occupied_slots: ResourceSlot,
    /// Liveness state
    pub status: AgentStatus,
    /// Containers currently hosted
    pub container_count: u32,
    /// Hard container ceiling
    pub max_container_count: u32,
    /// Last heartbeat receipt time
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Capacity still free for new reservations
    pub fn free_slots(&self) -> ResourceSlot {
        // occupied <= available is a store invariant; a violation here is a bug
        self.available_slots
            .checked_sub(&self.occupied_slots)
            .unwrap_or_default()
    }

    /// True when the agent may take new kernels at all
    pub fn is_schedulable(&self) -> bool {
        self.status == AgentStatus::Alive
    }

    /// True when `n` more containers fit under the container ceiling
    pub fn has_container_headroom(&self, n: u32) -> bool {
        self.container_count + n <= self.max_container_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn agent(avail: u64, occ: u64) -> Agent {
        Agent {
            id: AgentId::new("a1"),
            scaling_group: "default".into(),
            architecture: "x86_64".into(),
            available_slots: ResourceSlot::from_pairs([("cpu", Decimal::from(avail))]),
            occupied_slots: ResourceSlot::from_pairs([("cpu", Decimal::from(occ))]),
            status: AgentStatus::Alive,
            container_count: 0,
            max_container_count: 16,
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn test_free_slots() {
        let a = agent(8, 3);
        assert_eq!(a.free_slots().get("cpu"), Decimal::from(5));
    }

    #[test]
    fn test_container_headroom() {
        let mut a = agent(8, 0);
        a.container_count = 15;
        assert!(a.has_container_headroom(1));
        assert!(!a.has_container_headroom(2));
    }
}
