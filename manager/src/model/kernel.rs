//! Kernel value type: one container within a session

use crate::resources::ResourceSlot;
use crate::{AgentId, KernelId, SessionId};
use serde::{Deserialize, Serialize};

/// Role of a kernel inside its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelRole {
    /// Exactly one per session; placed first
    Main,
    /// Additional workers in multi-kernel sessions
    Sub,
}

impl KernelRole {
    /// True for the main kernel
    pub fn is_main(&self) -> bool {
        matches!(self, KernelRole::Main)
    }
}

/// Container image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host
    pub registry: String,
    /// Image name
    pub name: String,
    /// Image tag
    pub tag: String,
    /// Target architecture tag (x86_64, aarch64, ...)
    pub architecture: String,
    /// Content digest, when resolved
    pub digest: Option<String>,
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}@{}", self.registry, self.name, self.tag, self.architecture)
    }
}

/// Per-kernel lifecycle states (mirrors the session machine per kernel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelStatus {
    /// Waiting for placement
    Pending,
    /// Bound to an agent
    Scheduled,
    /// Container being prepared on the agent
    Preparing,
    /// Image pull in progress
    Pulling,
    /// Image present
    Prepared,
    /// Container being created
    Creating,
    /// Container running
    Running,
    /// Destruction dispatched
    Terminating,
    /// Container gone
    Terminated,
    /// Cancelled before creation
    Cancelled,
    /// Unrecoverable failure
    Error,
}

impl KernelStatus {
    /// Terminal kernel states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KernelStatus::Terminated | KernelStatus::Cancelled | KernelStatus::Error
        )
    }
}

/// A unit of container placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    /// Kernel identifier
    pub id: KernelId,
    /// Owning session
    pub session_id: SessionId,
    /// Role within the session
    pub role: KernelRole,
    /// Image to run
    pub image: ImageRef,
    /// Slot demand for this kernel
    pub requested_slots: ResourceSlot,
    /// Hosting agent, once bound
    pub agent_id: Option<AgentId>,
    /// Container id, once created
    pub container_id: Option<String>,
    /// Kernel lifecycle state
    pub status: KernelStatus,
}

impl Kernel {
    /// Build an unbound pending kernel
    pub fn new(
        session_id: SessionId,
        role: KernelRole,
        image: ImageRef,
        requested_slots: ResourceSlot,
    ) -> Self {
        Self {
            id: KernelId::new(),
            session_id,
            role,
            image,
            requested_slots,
            agent_id: None,
            container_id: None,
            status: KernelStatus::Pending,
        }
    }
}
