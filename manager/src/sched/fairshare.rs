//! Fair-share scheduling by accumulated usage

use super::{base_order, ClusterCapacity, Scheduler};
use crate::model::Session;
use crate::{AccessKey, SessionId};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Fair share by accumulated committed usage per access key
///
/// Owners holding less of the cluster go first. Usage is the scalar sum of
/// all slot quantities their non-pending sessions hold; queue order among a
/// single owner's sessions stays the base order.
pub struct FairShareScheduler;

impl FairShareScheduler {
    fn usage_by_key(capacity: &ClusterCapacity) -> HashMap<AccessKey, Decimal> {
        let mut usage: HashMap<AccessKey, Decimal> = HashMap::new();
        for session in capacity.existing() {
            if session.status.is_terminal() {
                continue;
            }
            let weight: Decimal = session.requested_slots.iter().map(|(_, v)| v).sum();
            *usage.entry(session.access_key.clone()).or_insert(Decimal::ZERO) += weight;
        }
        usage
    }
}

impl Scheduler for FairShareScheduler {
    fn name(&self) -> &'static str {
        "fairshare"
    }

    fn prioritize(&self, mut pending: Vec<Session>, _existing: &[Session]) -> Vec<Session> {
        base_order(&mut pending);
        pending
    }

    fn pick(&self, pending: &[Session], capacity: &ClusterCapacity) -> Option<SessionId> {
        if pending.is_empty() {
            return None;
        }
        let usage = Self::usage_by_key(capacity);
        let mut best: Option<(Decimal, usize)> = None;
        for (idx, session) in pending.iter().enumerate() {
            if !capacity.can_fund(session) {
                continue;
            }
            let used = usage
                .get(&session.access_key)
                .copied()
                .unwrap_or(Decimal::ZERO);
            match best {
                Some((best_used, _)) if best_used <= used => {}
                _ => best = Some((used, idx)),
            }
        }
        match best {
            Some((_, idx)) => Some(pending[idx].id),
            None => pending.first().map(|s| s.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::model::SessionStatus;

    #[test]
    fn test_fairshare_prefers_idle_owner() {
        let mut busy = session("AK-busy", 4, 0, 0);
        busy.status = SessionStatus::Running;
        let busy_pending = session("AK-busy", 1, 0, 10);
        let idle_pending = session("AK-idle", 1, 0, 20);

        let sched = FairShareScheduler;
        let capacity = ClusterCapacity::new(vec![agent("a1", 8)]).with_existing(vec![busy]);
        let queue = sched.prioritize(vec![busy_pending.clone(), idle_pending.clone()], &[]);
        assert_eq!(sched.pick(&queue, &capacity), Some(idle_pending.id));
    }

    #[test]
    fn test_fairshare_ties_keep_queue_order(){
        let first = session("AK-a", 1, 0, 0);
        let second = session("AK-b", 1, 0, 10);
        let sched = FairShareScheduler;
        let capacity = ClusterCapacity::new(vec![agent("a1", 8)]);
        let queue = sched.prioritize(vec![second.clone(), first.clone()], &[]);
        assert_eq!(sched.pick(&queue, &capacity), Some(first.id));
    }
}
