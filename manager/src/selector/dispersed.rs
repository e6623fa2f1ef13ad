//! Dispersed (least-utilized) agent selection

use super::{eligible, remaining_weight, AgentSelector};
use crate::model::Agent;
use crate::resources::ResourceSlot;
use crate::AgentId;

/// Prefer the agent with the most remaining capacity
///
/// Spreads load for latency-sensitive workloads. Ties break on ascending
/// agent id.
pub struct DispersedSelector;

impl AgentSelector for DispersedSelector {
    fn name(&self) -> &'static str {
        "dispersed"
    }

    fn select_for_kernel(
        &self,
        candidates: &[Agent],
        demand: &ResourceSlot,
        arch: &str,
    ) -> Option<AgentId> {
        eligible(candidates, demand, arch)
            .max_by(|a, b| {
                remaining_weight(a, demand)
                    .cmp(&remaining_weight(b, demand))
                    .then(b.id.cmp(&a.id))
            })
            .map(|agent| agent.id.clone())
    }
}
