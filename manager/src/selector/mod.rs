//! Agent selector plugin interface and registry
//!
//! A selector chooses the one agent to host a kernel after the common
//! eligibility filter: matching architecture, enough free capacity, and
//! container headroom. Tie-breaks are strategy-defined but must be
//! deterministic for a given candidate order.

mod concentrated;
mod dispersed;
mod roundrobin;

pub use concentrated::ConcentratedSelector;
pub use dispersed::DispersedSelector;
pub use roundrobin::RoundRobinSelector;

use crate::error::{Result, SchedulingError};
use crate::model::Agent;
use crate::resources::ResourceSlot;
use crate::AgentId;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Agent selector plugin contract
pub trait AgentSelector: Send + Sync {
    /// Registered plugin name
    fn name(&self) -> &'static str;

    /// Choose an agent for one kernel, or `None` when nothing fits
    fn select_for_kernel(
        &self,
        candidates: &[Agent],
        demand: &ResourceSlot,
        arch: &str,
    ) -> Option<AgentId>;

    /// Cursor state to persist under `scheduler_opts.cursor`, if stateful
    fn cursor(&self) -> Option<serde_json::Value> {
        None
    }
}

/// The common eligibility filter every strategy applies first
pub(crate) fn eligible<'a>(
    candidates: &'a [Agent],
    demand: &'a ResourceSlot,
    arch: &'a str,
) -> impl Iterator<Item = &'a Agent> {
    candidates.iter().filter(move |agent| {
        agent.is_schedulable()
            && agent.architecture == arch
            && demand.le(&agent.free_slots())
            && agent.has_container_headroom(1)
    })
}

/// Scalar weight of the capacity left on an agent after hosting `demand`,
/// measured over the demanded slot names only
pub(crate) fn remaining_weight(agent: &Agent, demand: &ResourceSlot) -> Decimal {
    let free = agent.free_slots();
    demand.names().map(|name| free.get(name) - demand.get(name)).sum()
}

type SelectorFactory = fn(&serde_json::Value) -> Arc<dyn AgentSelector>;

/// Static name -> constructor registry for selector plugins
pub struct SelectorRegistry {
    factories: HashMap<&'static str, SelectorFactory>,
}

impl SelectorRegistry {
    /// The default distribution: roundrobin, concentrated, dispersed
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, SelectorFactory> = HashMap::new();
        factories.insert("roundrobin", |opts| Arc::new(RoundRobinSelector::from_opts(opts)));
        factories.insert("concentrated", |_| Arc::new(ConcentratedSelector));
        factories.insert("dispersed", |_| Arc::new(DispersedSelector));
        Self { factories }
    }

    /// Instantiate a selector by registered name with plugin options
    pub fn create(&self, name: &str, opts: &serde_json::Value) -> Result<Arc<dyn AgentSelector>> {
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

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
