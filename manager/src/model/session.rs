//! Session value type and lifecycle state machine

use crate::model::kernel::Kernel;
use crate::resources::ResourceSlot;
use crate::{AccessKey, AgentId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepted, waiting for a scheduling decision
    Pending,
    /// Kernels bound to agents, resources reserved
    Scheduled,
    /// Agent RPCs dispatched, containers being prepared
    Preparing,
    /// Kernel images being pulled on the agents
    Pulling,
    /// Images present, ready for container creation
    Prepared,
    /// Containers being created
    Creating,
    /// All kernels running
    Running,
    /// Termination dispatched, waiting for agent acks
    Terminating,
    /// All kernels gone, resources released
    Terminated,
    /// Cancelled before placement took effect
    Cancelled,
    /// Unrecoverable per-session failure
    Error,
}

impl SessionStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    /// Validate a state transition against the declared machine
    pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (from, to) {
            (Pending, Scheduled) => true,
            (Pending, Cancelled) => true,
            // Fatal pre-placement denials (e.g. an invalid designated agent)
            (Pending, Error) => true,
            (Scheduled, Preparing) => true,
            (Preparing, Pulling) => true,
            (Pulling, Prepared) => true,
            (Prepared, Creating) => true,
            (Creating, Running) => true,
            (Running, Terminating) => true,
            // Forced destroy while preparation is still in flight
            (Scheduled, Terminating) => true,
            (Preparing, Terminating) => true,
            (Pulling, Terminating) => true,
            (Prepared, Terminating) => true,
            (Creating, Terminating) => true,
            (Terminating, Terminated) => true,
            // Failures after placement surface as ERROR
            (Scheduled, Error) => true,
            (Preparing, Error) => true,
            (Pulling, Error) => true,
            (Prepared, Error) => true,
            (Creating, Error) => true,
            (Running, Error) => true,
            (Terminating, Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::Preparing => "PREPARING",
            SessionStatus::Pulling => "PULLING",
            SessionStatus::Prepared => "PREPARED",
            SessionStatus::Creating => "CREATING",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Terminating => "TERMINATING",
            SessionStatus::Terminated => "TERMINATED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// What the session is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    /// Interactive notebook / terminal workloads
    Interactive,
    /// Batch jobs, optionally with a reserved start time
    Batch,
    /// Model-serving workloads
    Inference,
    /// Private system sessions (SSH/SFTP sidecars)
    System,
}

impl SessionType {
    /// Private sessions skip the quota and ceiling validators
    pub fn is_private(&self) -> bool {
        matches!(self, SessionType::System)
    }
}

/// Kernel distribution across agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMode {
    /// All kernels on one agent
    SingleNode,
    /// One agent chosen per kernel
    MultiNode,
}

/// Final outcome of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionResult {
    /// Not finished yet
    Undefined,
    /// Finished successfully
    Success,
    /// Finished with failure
    Failure,
}

/// A virtual folder to mount during preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfolderMount {
    /// Virtual folder id
    pub vfolder_id: Uuid,
    /// Mount path inside the kernels
    pub path: String,
}

/// One append-only status history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Status entered
    pub status: SessionStatus,
    /// When the transition committed
    pub timestamp: DateTime<Utc>,
    /// Optional human-readable annotation
    pub info: Option<String>,
}

/// The user-visible unit of scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: SessionId,
    /// Name, unique per access key
    pub name: String,
    /// Owning keypair
    pub access_key: AccessKey,
    /// Owning user
    pub user_id: Uuid,
    /// Owning project/group
    pub project_id: Uuid,
    /// Owning domain
    pub domain_name: String,
    /// Scaling group this session schedules into
    pub scaling_group: String,
    /// Workload type
    pub session_type: SessionType,
    /// Kernel distribution mode
    pub cluster_mode: ClusterMode,
    /// Total kernel count
    pub cluster_size: u32,
    /// Scheduling priority; higher wins ties
    pub priority: i32,
    /// Reserved start time for batch sessions
    pub starts_at: Option<DateTime<Utc>>,
    /// Sessions that must terminate successfully before this one starts
    pub dependencies: Vec<SessionId>,
    /// Manually designated agent, if any
    pub designated_agent: Option<AgentId>,
    /// Virtual folders mounted during preparation
    pub vfolder_mounts: Vec<VfolderMount>,
    /// Sum of kernel slot demands
    pub requested_slots: ResourceSlot,
    /// Current lifecycle state
    pub status: SessionStatus,
    /// Human-readable reason for the current state
    pub status_info: Option<String>,
    /// Structured retry/reason payload
    pub status_data: serde_json::Value,
    /// Append-only transition log
    pub status_history: Vec<StatusEntry>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the session was scheduled
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub terminated_at: Option<DateTime<Utc>>,
    /// Final outcome
    pub result: SessionResult,
    /// Kernels owned by this session, main first
    pub kernels: Vec<Kernel>,
}

impl Session {
    /// Kernels in placement order: main first, then subs by kernel id
    pub fn kernels_in_placement_order(&self) -> Vec<&Kernel> {
        let mut ordered: Vec<&Kernel> = self.kernels.iter().collect();
        ordered.sort_by_key(|k| (!k.role.is_main(), k.id));
        ordered
    }

    /// The main kernel, when present
    pub fn main_kernel(&self) -> Option<&Kernel> {
        self.kernels.iter().find(|k| k.role.is_main())
    }

    /// True once every kernel carries an agent binding
    pub fn fully_bound(&self) -> bool {
        !self.kernels.is_empty() && self.kernels.iter().all(|k| k.agent_id.is_some())
    }
}
