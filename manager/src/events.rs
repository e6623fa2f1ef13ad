//! Session lifecycle events
//!
//! Events are buffered inside the scheduling transaction and released to the
//! hub only after commit, so subscribers observe at most one event per
//! committed transition. The `seq` field is the session's status-history
//! index at commit time; consumers deduplicate on `(session_id, seq)`.

use crate::model::SessionStatus;
use crate::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kinds of session lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEventKind {
    /// Kernels bound and resources reserved
    Scheduled,
    /// Agent RPCs dispatched
    Preparing,
    /// Image pull observed
    Pulling,
    /// Images present on all agents
    Prepared,
    /// Containers being created
    Creating,
    /// All kernels running
    Running,
    /// Termination dispatched
    Terminating,
    /// All kernels gone
    Terminated,
    /// Cancelled before placement took effect
    Cancelled,
    /// Unrecoverable failure
    Failed {
        /// Machine-readable failure reason
        reason: String,
    },
}

impl SessionEventKind {
    /// The event matching a committed status, if that status emits one
    pub fn for_status(status: SessionStatus, reason: Option<&str>) -> Option<Self> {
        match status {
            SessionStatus::Scheduled => Some(Self::Scheduled),
            SessionStatus::Preparing => Some(Self::Preparing),
            SessionStatus::Pulling => Some(Self::Pulling),
            SessionStatus::Prepared => Some(Self::Prepared),
            SessionStatus::Creating => Some(Self::Creating),
            SessionStatus::Running => Some(Self::Running),
            SessionStatus::Terminating => Some(Self::Terminating),
            SessionStatus::Terminated => Some(Self::Terminated),
            SessionStatus::Cancelled => Some(Self::Cancelled),
            SessionStatus::Error => Some(Self::Failed {
                reason: reason.unwrap_or("unknown").to_string(),
            }),
            SessionStatus::Pending => None,
        }
    }
}

/// One committed lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// What happened
    pub kind: SessionEventKind,
    /// Commit time of the transition
    pub occurred_at: DateTime<Utc>,
    /// Status-history index; monotonic per session, used for deduplication
    pub seq: usize,
}

/// Broadcast hub for committed events
///
/// Lagging subscribers drop old events rather than blocking commit.
#[derive(Debug)]
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    /// Create a hub with the given subscriber buffer depth
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to committed events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish committed events; send errors mean no subscribers, which is fine
    pub fn publish_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.tx.send(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_once() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let event = SessionEvent {
            session_id: SessionId::new(),
            kind: SessionEventKind::Scheduled,
            occurred_at: Utc::now(),
            seq: 1,
        };
        hub.publish_all(vec![event.clone()]);
        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pending_emits_no_event() {
        assert!(SessionEventKind::for_status(SessionStatus::Pending, None).is_none());
        assert_eq!(
            SessionEventKind::for_status(SessionStatus::Error, Some("StorageMount")),
            Some(SessionEventKind::Failed { reason: "StorageMount".into() })
        );
    }
}
