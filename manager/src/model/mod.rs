//! Value types for the scheduling domain
//!
//! One immutable value type per entity. Repositories accept and return these
//! snapshots only; persistence mapping stays inside the state store.

pub mod agent;
pub mod kernel;
pub mod policy;
pub mod session;

pub use agent::{Agent, AgentStatus};
pub use kernel::{ImageRef, Kernel, KernelRole, KernelStatus};
pub use policy::{PolicyBundle, ResourcePolicy, ScalingGroup};
pub use session::{
    ClusterMode, Session, SessionResult, SessionStatus, SessionType, StatusEntry, VfolderMount,
};
