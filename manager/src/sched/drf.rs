//! Dominant-resource-fairness scheduling

use super::{base_order, ClusterCapacity, Scheduler};
use crate::model::{Session, SessionStatus};
use crate::{AccessKey, SessionId};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Dominant-resource fairness over per-access-key shares
///
/// Each access key's dominant share is the largest fraction of any single
/// cluster resource its committed sessions hold. The pick favors the
/// fundable session whose owner has the smallest dominant share, looking
/// past the head without reordering the queue. When nothing is fundable the
/// head is returned so the denial reason gets recorded.
pub struct DrfScheduler;

impl DrfScheduler {
    fn dominant_shares(capacity: &ClusterCapacity) -> HashMap<AccessKey, Decimal> {
        let total = capacity.total_slots();
        let mut usage: HashMap<AccessKey, crate::resources::ResourceSlot> = HashMap::new();
        for session in capacity.existing() {
            if committed(session.status) {
                let entry = usage.entry(session.access_key.clone()).or_default();
                *entry = entry.add(&session.requested_slots);
            }
        }
        usage
            .into_iter()
            .map(|(key, used)| {
                let share = used
                    .iter()
                    .filter_map(|(name, amount)| {
                        let cap = total.get(name);
                        if cap.is_zero() {
                            None
                        } else {
                            Some(amount / cap)
                        }
                    })
                    .max()
                    .unwrap_or(Decimal::ZERO);
                (key, share)
            })
            .collect()
    }
}

fn committed(status: SessionStatus) -> bool {
    matches!(
        status,
        SessionStatus::Scheduled
            | SessionStatus::Preparing
            | SessionStatus::Pulling
            | SessionStatus::Prepared
            | SessionStatus::Creating
            | SessionStatus::Running
            | SessionStatus::Terminating
    )
}

impl Scheduler for DrfScheduler {
    fn name(&self) -> &'static str {
        "drf"
    }

    fn prioritize(&self, mut pending: Vec<Session>, _existing: &[Session]) -> Vec<Session> {
        base_order(&mut pending);
        pending
    }

    fn pick(&self, pending: &[Session], capacity: &ClusterCapacity) -> Option<SessionId> {
        if pending.is_empty() {
            return None;
        }
        let shares = Self::dominant_shares(capacity);
        let mut best: Option<(Decimal, usize)> = None;
        for (idx, session) in pending.iter().enumerate() {
            if !capacity.can_fund(session) {
                continue;
            }
            let share = shares
                .get(&session.access_key)
                .copied()
                .unwrap_or(Decimal::ZERO);
            match best {
                Some((best_share, _)) if best_share <= share => {}
                _ => best = Some((share, idx)),
            }
        }
        match best {
            Some((_, idx)) => Some(pending[idx].id),
            // Nothing fundable: surface the head so its denial is recorded
            None => pending.first().map(|s| s.id),
        }
    }
}
