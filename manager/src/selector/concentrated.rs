//! Concentrated (bin-packing) agent selection

use super::{eligible, remaining_weight, AgentSelector};
use crate::model::Agent;
use crate::resources::ResourceSlot;
use crate::AgentId;

/// Prefer the agent with the least remaining capacity that still fits
///
/// Packs kernels tightly so large-demand sessions keep finding whole free
/// agents. Ties break on ascending agent id.
pub struct ConcentratedSelector;

impl AgentSelector for ConcentratedSelector {
    fn name(&self) -> &'static str {
        "concentrated"
    }

    fn select_for_kernel(
        &self,
        candidates: &[Agent],
        demand: &ResourceSlot,
        arch: &str,
    ) -> Option<AgentId> {
        eligible(candidates, demand, arch)
            .min_by(|a, b| {
                remaining_weight(a, demand)
                    .cmp(&remaining_weight(b, demand))
                    .then(a.id.cmp(&b.id))
            })
            .map(|agent| agent.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    #[test]
    fn test_concentrated_prefers_tightest_fit() {
        let candidates = vec![
            agent("roomy", "x86_64", 16, 16_384),
            agent("snug", "x86_64", 3, 3072),
        ];
        let pick = ConcentratedSelector
            .select_for_kernel(&candidates, &slots(2, 2048), "x86_64")
            .unwrap();
        assert_eq!(pick, AgentId::new("snug"));
    }

    #[test]
    fn test_concentrated_tie_breaks_on_id() {
        let candidates = vec![
            agent("b", "x86_64", 4, 4096),
            agent("a", "x86_64", 4, 4096),
        ];
        let pick = ConcentratedSelector
            .select_for_kernel(&candidates, &slots(2, 2048), "x86_64")
            .unwrap();
        assert_eq!(pick, AgentId::new("a"));
    }
}
