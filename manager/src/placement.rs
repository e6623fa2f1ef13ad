//! Placement engine
//!
//! Turns one chosen session into a set of kernel-to-agent bindings. The
//! plan is computed against an agent snapshot; the state store re-validates
//! every reservation at commit, so a plan that lost a race simply fails the
//! transaction and rolls back without partial bindings ever being visible.

use crate::error::{Result, SchedulingError};
use crate::model::{Agent, ClusterMode, Session};
use crate::resources::ResourceSlot;
use crate::selector::AgentSelector;
use crate::store::SchedulingTxn;
use crate::AgentId;
use tracing::debug;

/// Compute bindings for a session against an agent snapshot
pub fn plan(
    session: &Session,
    agents: &[Agent],
    selector: &dyn AgentSelector,
) -> Result<SchedulingTxn> {
    if session.kernels.is_empty() {
        // Rejected at creation; a bare row reaching here is a store bug
        return Err(SchedulingError::invalid_spec("session has no kernels"));
    }
    match session.cluster_mode {
        ClusterMode::SingleNode => plan_single_node(session, agents, selector),
        ClusterMode::MultiNode => plan_multi_node(session, agents, selector),
    }
}

/// All kernels on one agent
fn plan_single_node(
    session: &Session,
    agents: &[Agent],
    selector: &dyn AgentSelector,
) -> Result<SchedulingTxn> {
    // Heterogeneous architectures cannot share one agent
    let arch = &session.kernels[0].image.architecture;
    if let Some(odd) = session
        .kernels
        .iter()
        .find(|k| &k.image.architecture != arch)
    {
        return Err(SchedulingError::ArchitectureMismatch {
            wanted: arch.clone(),
            offered: odd.image.architecture.clone(),
        });
    }

    let total_demand = ResourceSlot::sum(session.kernels.iter().map(|k| &k.requested_slots));
    let cluster_size = session.cluster_size;

    let chosen: AgentId = if let Some(designated) = &session.designated_agent {
        let agent = agents
            .iter()
            .find(|a| &a.id == designated)
            .ok_or_else(|| SchedulingError::manual_agent(format!("{} is not alive", designated)))?;
        if &agent.architecture != arch {
            return Err(SchedulingError::manual_agent(format!(
                "{} offers {}, kernels need {}",
                designated, agent.architecture, arch
            )));
        }
        if !total_demand.le(&agent.free_slots()) {
            return Err(SchedulingError::manual_agent(format!(
                "{} lacks free capacity for {}",
                designated, total_demand
            )));
        }
        if !agent.has_container_headroom(cluster_size) {
            return Err(SchedulingError::manual_agent(format!(
                "{} cannot host {} more containers",
                designated, cluster_size
            )));
        }
        designated.clone()
    } else {
        // Only agents with headroom for the whole kernel set are candidates
        let candidates: Vec<Agent> = agents
            .iter()
            .filter(|a| a.has_container_headroom(cluster_size))
            .cloned()
            .collect();
        selector
            .select_for_kernel(&candidates, &total_demand, arch)
            .ok_or(SchedulingError::NoSuitableAgent)?
    };

    debug!(session = %session.id, agent = %chosen, "single-node placement");
    let mut txn = SchedulingTxn::new(session.id);
    for kernel in session.kernels_in_placement_order() {
        txn.bind(kernel.id, chosen.clone(), kernel.requested_slots.clone());
    }
    Ok(txn)
}

/// One agent per kernel, all-or-nothing
fn plan_multi_node(
    session: &Session,
    agents: &[Agent],
    selector: &dyn AgentSelector,
) -> Result<SchedulingTxn> {
    let mut working: Vec<Agent> = agents.to_vec();
    let mut txn = SchedulingTxn::new(session.id);

    for kernel in session.kernels_in_placement_order() {
        let chosen = selector
            .select_for_kernel(&working, &kernel.requested_slots, &kernel.image.architecture)
            .ok_or(SchedulingError::NoSuitableAgent)?;
        let agent = working
            .iter_mut()
            .find(|a| a.id == chosen)
            .ok_or(SchedulingError::NoSuitableAgent)?;
        agent.occupied_slots = agent.occupied_slots.add(&kernel.requested_slots);
        agent.container_count += 1;
        debug!(session = %session.id, kernel = %kernel.id, agent = %chosen, "multi-node placement");
        txn.bind(kernel.id, chosen, kernel.requested_slots.clone());
    }
    Ok(txn)
}
