//! GridMesh Manager - Compute Session Control Plane
//!
//! The manager accepts compute sessions (one or more kernels running across
//! worker agents), decides where and when each session runs, binds kernels to
//! agents and resource slots, and drives sessions through their lifecycle
//! state machine while reconciling with reality on failure.
//!
//! ## Core components
//! - **Resource model**: exact decimal arithmetic over open-ended slot maps
//! - **State store**: transactional snapshot persistence with CAS transitions
//! - **Scheduler plugins**: fifo / lifo / drf / fairshare queue strategies
//! - **Agent selector plugins**: roundrobin / concentrated / dispersed
//! - **Placement engine**: single-node and multi-node all-or-nothing binding
//! - **Dispatcher**: per-scaling-group reconciliation under a lease lock

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lock;
pub mod model;
pub mod placement;
pub mod resources;
pub mod rpc;
pub mod sched;
pub mod selector;
pub mod store;
pub mod validate;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Re-export key types
pub use config::ManagerConfig;
pub use dispatcher::{DispatcherStats, ManagerContext};
pub use error::{ErrorClass, Result, SchedulingError};
pub use events::{EventHub, SessionEvent};
pub use model::{Agent, Kernel, ScalingGroup, Session, SessionStatus};
pub use resources::ResourceSlot;
pub use store::StateStore;

/// Manager API version
pub const MANAGER_VERSION: &str = "0.1.0";

/// Session identifier
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh session identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel identifier
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct KernelId(pub Uuid);

impl KernelId {
    /// Generate a fresh kernel identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for KernelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent identifier
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    /// Wrap an agent name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access key identifying the owning keypair of a session
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AccessKey(pub String);

impl AccessKey {
    /// Wrap an access key string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
