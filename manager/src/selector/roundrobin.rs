//! Round-robin agent selection

use super::{eligible, AgentSelector};
use crate::model::Agent;
use crate::resources::ResourceSlot;
use crate::AgentId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotate across eligible agents, stable across ticks
///
/// The cursor survives restarts by round-tripping through the scaling
/// group's `scheduler_opts.cursor`: the dispatcher seeds it at construction
/// and persists [`AgentSelector::cursor`] after each tick.
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    /// Start from an explicit cursor position
    pub fn new(cursor: usize) -> Self {
        Self { cursor: AtomicUsize::new(cursor) }
    }

    /// Construct from plugin options, resuming a persisted cursor
    pub fn from_opts(opts: &serde_json::Value) -> Self {
        let cursor = opts
            .get("cursor")
            .and_then(|c| c.as_u64())
            .unwrap_or(0) as usize;
        Self::new(cursor)
    }
}

impl AgentSelector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select_for_kernel(
        &self,
        candidates: &[Agent],
        demand: &ResourceSlot,
        arch: &str,
    ) -> Option<AgentId> {
        let mut fitting: Vec<&Agent> = eligible(candidates, demand, arch).collect();
        if fitting.is_empty() {
            return None;
        }
        fitting.sort_by(|a, b| a.id.cmp(&b.id));
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(fitting[position % fitting.len()].id.clone())
    }

    fn cursor(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!(self.cursor.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    #[test]
    fn test_roundrobin_rotates() {
        let selector = RoundRobinSelector::new(0);
        let candidates = vec![
            agent("a1", "x86_64", 8, 8192),
            agent("a2", "x86_64", 8, 8192),
            agent("a3", "x86_64", 8, 8192),
        ];
        let demand = slots(1, 512);
        let picks: Vec<_> = (0..4)
            .map(|_| selector.select_for_kernel(&candidates, &demand, "x86_64").unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![
                AgentId::new("a1"),
                AgentId::new("a2"),
                AgentId::new("a3"),
                AgentId::new("a1"),
            ]
        );
    }

    #[test]
    fn test_roundrobin_resumes_from_persisted_cursor() {
        let selector = RoundRobinSelector::from_opts(&serde_json::json!({ "cursor": 1 }));
        let candidates = vec![
            agent("a1", "x86_64", 8, 8192),
            agent("a2", "x86_64", 8, 8192),
        ];
        let pick = selector
            .select_for_kernel(&candidates, &slots(1, 512), "x86_64")
            .unwrap();
        assert_eq!(pick, AgentId::new("a2"));
        assert_eq!(selector.cursor(), Some(serde_json::json!(2)));
    }

    #[test]
    fn test_roundrobin_none_when_nothing_fits() {
        let selector = RoundRobinSelector::new(0);
        let candidates = vec![agent("a1", "x86_64", 1, 512)];
        assert!(selector
            .select_for_kernel(&candidates, &slots(2, 1024), "x86_64")
            .is_none());
    }
}
