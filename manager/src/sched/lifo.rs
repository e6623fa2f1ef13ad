//! Last-in-first-out scheduling

use super::{base_order, ClusterCapacity, Scheduler};
use crate::model::Session;
use crate::SessionId;

/// Attempt the most recently created session first
///
/// The queue order stays the stable base order; only the pick walks from
/// the tail, so the view handed to the next `pick` call is unchanged.
pub struct LifoScheduler;

impl Scheduler for LifoScheduler {
    fn name(&self) -> &'static str {
        "lifo"
    }

    fn prioritize(&self, mut pending: Vec<Session>, _existing: &[Session]) -> Vec<Session> {
        base_order(&mut pending);
        pending
    }

    fn pick(&self, pending: &[Session], _capacity: &ClusterCapacity) -> Option<SessionId> {
        pending.last().map(|s| s.id)
    }
}
