//! First-in-first-out scheduling

use super::{base_order, ClusterCapacity, Scheduler};
use crate::model::Session;
use crate::SessionId;

/// Strict queue order: always attempt the head
///
/// Head-of-queue denials are recorded by the dispatcher and the loop moves
/// on, so a stuck head does not silently starve without a visible reason.
pub struct FifoScheduler;

impl Scheduler for FifoScheduler {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn prioritize(&self, mut pending: Vec<Session>, _existing: &[Session]) -> Vec<Session> {
        base_order(&mut pending);
        pending
    }

    fn pick(&self, pending: &[Session], _capacity: &ClusterCapacity) -> Option<SessionId> {
        pending.first().map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    #[test]
    fn test_fifo_picks_oldest() {
        let old = session("AK", 1, 0, 0);
        let new = session("AK", 1, 0, 100);
        let sched = FifoScheduler;
        let queue = sched.prioritize(vec![new.clone(), old.clone()], &[]);
        let capacity = ClusterCapacity::new(vec![agent("a1", 8)]);
        assert_eq!(sched.pick(&queue, &capacity), Some(old.id));
    }

    #[test]
    fn test_fifo_priority_overrides_age() {
        let old = session("AK", 1, 0, 0);
        let urgent = session("AK", 1, 10, 100);
        let sched = FifoScheduler;
        let queue = sched.prioritize(vec![old.clone(), urgent.clone()], &[]);
        let capacity = ClusterCapacity::new(vec![agent("a1", 8)]);
        assert_eq!(sched.pick(&queue, &capacity), Some(urgent.id));
    }

    #[test]
    fn test_fifo_empty_queue() {
        let sched = FifoScheduler;
        let capacity = ClusterCapacity::new(vec![]);
        assert_eq!(sched.pick(&[], &capacity), None);
    }
}
