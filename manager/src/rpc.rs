//! Agent and storage-proxy RPC contracts
//!
//! The core never speaks a wire protocol itself; it calls these traits and
//! observes agent progress through the notice stream. All operations are
//! idempotent by id: re-issuing a call after a timeout must not create or
//! destroy anything twice.

use crate::error::Result;
use crate::model::{Kernel, KernelStatus};
use crate::{AgentId, KernelId, SessionId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Progress reported back by agents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotice {
    /// Image pull started for a session's kernels
    ImagePullStarted {
        /// Session being prepared
        session_id: SessionId,
    },
    /// All images present for the session
    ImagePullFinished {
        /// Session being prepared
        session_id: SessionId,
    },
    /// One kernel's container is up
    KernelStarted {
        /// Kernel that started
        kernel_id: KernelId,
        /// Container id assigned by the agent
        container_id: String,
    },
    /// One kernel's container is gone
    KernelTerminated {
        /// Kernel that terminated
        kernel_id: KernelId,
    },
    /// One kernel failed on the agent
    KernelFailed {
        /// Kernel that failed
        kernel_id: KernelId,
        /// Agent-side failure description
        reason: String,
    },
}

/// Outbound agent RPC contract
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Ask an agent to prepare and start a session's kernels.
    /// Idempotent by session id.
    async fn create_kernels(
        &self,
        agent_id: &AgentId,
        session_id: SessionId,
        kernels: &[Kernel],
    ) -> Result<()>;

    /// Ask an agent to destroy one kernel. Idempotent by kernel id.
    async fn destroy_kernel(&self, agent_id: &AgentId, kernel_id: KernelId) -> Result<()>;

    /// Poll one kernel's agent-side status
    async fn get_kernel_status(&self, agent_id: &AgentId, kernel_id: KernelId)
        -> Result<KernelStatus>;
}

/// Outbound storage-proxy RPC contract (vfolder mounts during PREPARING)
#[async_trait]
pub trait StorageProxyClient: Send + Sync {
    /// Mount a virtual folder for a session
    async fn mount(&self, vfolder_id: Uuid, path: &str) -> Result<()>;

    /// Unmount a virtual folder
    async fn unmount(&self, vfolder_id: Uuid) -> Result<()>;
}

/// In-process agent used by the standalone daemon and the test suite
///
/// Simulates the agent side of the protocol: a first `create_kernels` pulls
/// the image and starts every kernel, reporting progress through the notice
/// channel; repeated calls are absorbed by the idempotency set.
pub struct LoopbackAgent {
    notices: mpsc::UnboundedSender<AgentNotice>,
    created_sessions: DashSet<SessionId>,
    destroyed_kernels: DashSet<KernelId>,
    kernel_states: DashMap<KernelId, KernelStatus>,
    create_calls: DashMap<SessionId, u32>,
    fail_pull_for: DashSet<SessionId>,
}

impl LoopbackAgent {
    /// Create the agent and the notice receiver the dispatcher drains
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                notices: tx,
                created_sessions: DashSet::new(),
                destroyed_kernels: DashSet::new(),
                kernel_states: DashMap::new(),
                create_calls: DashMap::new(),
                fail_pull_for: DashSet::new(),
            }),
            rx,
        )
    }

    /// Make the next image pull for a session fail (test hook)
    pub fn fail_image_pull(&self, session_id: SessionId) {
        self.fail_pull_for.insert(session_id);
    }

    /// How many times `create_kernels` was invoked for a session
    pub fn create_calls(&self, session_id: SessionId) -> u32 {
        self.create_calls.get(&session_id).map(|c| *c).unwrap_or(0)
    }

    /// Containers actually started, across all sessions
    pub fn containers_started(&self) -> usize {
        self.kernel_states
            .iter()
            .filter(|entry| *entry.value() == KernelStatus::Running)
            .count()
    }
}

#[async_trait]
impl AgentClient for LoopbackAgent {
    async fn create_kernels(
        &self,
        agent_id: &AgentId,
        session_id: SessionId,
        kernels: &[Kernel],
    ) -> Result<()> {
        *self.create_calls.entry(session_id).or_insert(0) += 1;
        if !self.created_sessions.insert(session_id) {
            debug!(session = %session_id, "duplicate create_kernels absorbed");
            return Ok(());
        }
        debug!(agent = %agent_id, session = %session_id, kernels = kernels.len(), "creating kernels");
        let _ = self.notices.send(AgentNotice::ImagePullStarted { session_id });
        if self.fail_pull_for.remove(&session_id).is_some() {
            let image = kernels
                .first()
                .map(|k| k.image.to_string())
                .unwrap_or_default();
            for kernel in kernels {
                let _ = self.notices.send(AgentNotice::KernelFailed {
                    kernel_id: kernel.id,
                    reason: format!("image pull failed: {}", image),
                });
            }
            return Ok(());
        }
        let _ = self.notices.send(AgentNotice::ImagePullFinished { session_id });
        for kernel in kernels {
            let container_id = format!("ctr-{}", kernel.id);
            self.kernel_states.insert(kernel.id, KernelStatus::Running);
            let _ = self.notices.send(AgentNotice::KernelStarted {
                kernel_id: kernel.id,
                container_id,
            });
        }
        Ok(())
    }

    async fn destroy_kernel(&self, agent_id: &AgentId, kernel_id: KernelId) -> Result<()> {
        if !self.destroyed_kernels.insert(kernel_id) {
            debug!(kernel = %kernel_id, "duplicate destroy_kernel absorbed");
            return Ok(());
        }
        debug!(agent = %agent_id, kernel = %kernel_id, "destroying kernel");
        self.kernel_states.insert(kernel_id, KernelStatus::Terminated);
        let _ = self.notices.send(AgentNotice::KernelTerminated { kernel_id });
        Ok(())
    }

    async fn get_kernel_status(
        &self,
        _agent_id: &AgentId,
        kernel_id: KernelId,
    ) -> Result<KernelStatus> {
        Ok(self
            .kernel_states
            .get(&kernel_id)
            .map(|s| *s)
            .unwrap_or(KernelStatus::Pending))
    }
}

/// Storage proxy that mounts everything instantly
#[derive(Debug, Default)]
pub struct NullStorageProxy {
    fail_mounts: DashSet<Uuid>,
}

impl NullStorageProxy {
    /// Create a proxy with no failure injections
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make mounting the given vfolder fail (test hook)
    pub fn fail_mount(&self, vfolder_id: Uuid) {
        self.fail_mounts.insert(vfolder_id);
    }
}

#[async_trait]
impl StorageProxyClient for NullStorageProxy {
    async fn mount(&self, vfolder_id: Uuid, path: &str) -> Result<()> {
        if self.fail_mounts.remove(&vfolder_id).is_some() {
            return Err(crate::error::SchedulingError::StorageMount {
                detail: format!("mount of {} at {} refused", vfolder_id, path),
            });
        }
        Ok(())
    }

    async fn unmount(&self, _vfolder_id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageRef, KernelRole};
    use crate::resources::ResourceSlot;

    fn kernel(session_id: SessionId) -> Kernel {
        Kernel::new(
            session_id,
            KernelRole::Main,
            ImageRef {
                registry: "cr.example.com".into(),
                name: "python".into(),
                tag: "3.12".into(),
                architecture: "x86_64".into(),
                digest: None,
            },
            ResourceSlot::new(),
        )
    }

    #[tokio::test]
    async fn test_create_kernels_is_idempotent() {
        let (agent, mut rx) = LoopbackAgent::new();
        let session_id = SessionId::new();
        let kernels = vec![kernel(session_id)];
        let aid = AgentId::new("a1");

        agent.create_kernels(&aid, session_id, &kernels).await.unwrap();
        agent.create_kernels(&aid, session_id, &kernels).await.unwrap();

        assert_eq!(agent.create_calls(session_id), 2);
        assert_eq!(agent.containers_started(), 1);

        // Exactly one pull/start sequence was reported
        let mut started = 0;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice, AgentNotice::KernelStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_destroy_kernel_is_idempotent() {
        let (agent, mut rx) = LoopbackAgent::new();
        let session_id = SessionId::new();
        let k = kernel(session_id);
        let aid = AgentId::new("a1");
        agent.create_kernels(&aid, session_id, &[k.clone()]).await.unwrap();
        agent.destroy_kernel(&aid, k.id).await.unwrap();
        agent.destroy_kernel(&aid, k.id).await.unwrap();

        let mut terminated = 0;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice, AgentNotice::KernelTerminated { .. }) {
                terminated += 1;
            }
        }
        assert_eq!(terminated, 1);
    }

    #[tokio::test]
    async fn test_failed_pull_reports_kernel_failure() {
        let (agent, mut rx) = LoopbackAgent::new();
        let session_id = SessionId::new();
        let kernels = vec![kernel(session_id)];
        agent.fail_image_pull(session_id);
        agent
            .create_kernels(&AgentId::new("a1"), session_id, &kernels)
            .await
            .unwrap();
        let mut failed = false;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice, AgentNotice::KernelFailed { .. }) {
                failed = true;
            }
        }
        assert!(failed);
        assert_eq!(agent.containers_started(), 0);
    }
}
