//! Scheduling and lifecycle error types

use std::time::Duration;
use thiserror::Error;

/// Manager result type
pub type Result<T> = std::result::Result<T, SchedulingError>;

/// How a failure should be handled by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry within the tick up to the configured budget, then defer
    Transient,
    /// Session stays PENDING; reason recorded in status_data
    ResourceDenial,
    /// Session stays PENDING (or is cancelled on quota expiry); reason recorded
    PolicyDenial,
    /// Session moves to ERROR; reservations released, concurrency decremented
    FatalSession,
    /// Scheduling for the affected scaling group stops; other groups continue
    FatalSystemic,
}

/// Errors raised by the scheduler core
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// CAS on a session status found a different current state
    #[error("stale state: session {session} is {actual}, expected {expected}")]
    StaleState {
        /// Session whose state moved underneath us
        session: String,
        /// Status the caller assumed
        expected: String,
        /// Status actually found
        actual: String,
    },

    /// A reservation would push an agent past its advertised capacity
    #[error("capacity conflict on agent {agent}: slot {slot} over-committed")]
    CapacityConflict {
        /// Agent whose capacity would be violated
        agent: String,
        /// First offending slot name
        slot: String,
    },

    /// An agent RPC did not answer within the configured deadline
    #[error("agent rpc timed out after {timeout:?}")]
    RpcTimeout {
        /// Deadline that expired
        timeout: Duration,
    },

    /// The scheduling transaction lost a snapshot race and should be retried
    #[error("serialization conflict: {detail}")]
    SerializationConflict {
        /// Human-readable description of the conflicting write
        detail: String,
    },

    /// No agent can host the demand
    #[error("no suitable agent for requested resources")]
    NoSuitableAgent,

    /// Componentwise subtraction would go negative
    #[error("insufficient amount of slot {0}")]
    InsufficientSlot(String),

    /// Kernel image architecture does not match the candidate agent
    #[error("architecture mismatch: kernel wants {wanted}, agent offers {offered}")]
    ArchitectureMismatch {
        /// Architecture required by the kernel image
        wanted: String,
        /// Architecture the agent reports
        offered: String,
    },

    /// Placement would exceed the agent's container limit
    #[error("container limit reached on agent {agent}")]
    ContainerLimitReached {
        /// Agent at its container ceiling
        agent: String,
    },

    /// A manually designated agent cannot host the session
    #[error("manually designated agent invalid: {reason}")]
    ManualAgentInvalid {
        /// Why the designated agent was rejected
        reason: String,
    },

    /// The kernel image cannot be resolved or pulled
    #[error("image unavailable: {image}")]
    ImageUnavailable {
        /// Image reference that failed
        image: String,
    },

    /// A storage-proxy mount failed during preparation
    #[error("storage mount failed: {detail}")]
    StorageMount {
        /// Mount failure detail from the storage proxy
        detail: String,
    },

    /// The hosting agent went LOST while the session was being prepared
    #[error("agent {agent} lost during preparation")]
    AgentLostDuringPreparation {
        /// Agent that disappeared
        agent: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("configuration invalid: {detail}")]
    ConfigInvalid {
        /// Validation failure detail
        detail: String,
    },

    /// A resource slot name is not registered in the known-slot-types table
    #[error("unknown resource slot: {0}")]
    UnknownSlot(String),

    /// A scaling group names a scheduler or selector that is not registered
    #[error("scheduler plugin missing: {name}")]
    SchedulerPluginMissing {
        /// Plugin name that failed lookup
        name: String,
    },

    /// An entity lookup failed
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (session, kernel, agent, scaling group, policy)
        kind: &'static str,
        /// Identifier that missed
        id: String,
    },

    /// Session creation was rejected up front
    #[error("invalid session spec: {detail}")]
    InvalidSessionSpec {
        /// Why the spec was rejected
        detail: String,
    },

    /// Adding the dependency edges would create a cycle
    #[error("dependency cycle involving session {session}")]
    DependencyCycle {
        /// Session whose dependency set closes a cycle
        session: String,
    },
}

impl SchedulingError {
    /// Classify the error for dispatcher handling (§ error taxonomy)
    pub fn class(&self) -> ErrorClass {
        use SchedulingError::*;
        match self {
            StaleState { .. } | CapacityConflict { .. } | RpcTimeout { .. }
            | SerializationConflict { .. } => ErrorClass::Transient,
            NoSuitableAgent
            | InsufficientSlot(_)
            | ArchitectureMismatch { .. }
            | ContainerLimitReached { .. } => ErrorClass::ResourceDenial,
            ManualAgentInvalid { .. }
            | ImageUnavailable { .. }
            | StorageMount { .. }
            | AgentLostDuringPreparation { .. } => ErrorClass::FatalSession,
            ConfigInvalid { .. } | UnknownSlot(_) | SchedulerPluginMissing { .. } => {
                ErrorClass::FatalSystemic
            }
            NotFound { .. } | InvalidSessionSpec { .. } | DependencyCycle { .. } => {
                ErrorClass::FatalSession
            }
        }
    }

    /// Short machine-readable reason recorded into `status_data`
    pub fn reason(&self) -> &'static str {
        use SchedulingError::*;
        match self {
            StaleState { .. } => "StaleState",
            CapacityConflict { .. } => "CapacityConflict",
            RpcTimeout { .. } => "RpcTimeout",
            SerializationConflict { .. } => "SerializationConflict",
            NoSuitableAgent => "NoSuitableAgent",
            InsufficientSlot(_) => "InsufficientSlot",
            ArchitectureMismatch { .. } => "ArchitectureMismatch",
            ContainerLimitReached { .. } => "ContainerLimitReached",
            ManualAgentInvalid { .. } => "ManualAgentInvalid",
            ImageUnavailable { .. } => "ImageUnavailable",
            StorageMount { .. } => "StorageMount",
            AgentLostDuringPreparation { .. } => "AgentLostDuringPreparation",
            ConfigInvalid { .. } => "ConfigInvalid",
            UnknownSlot(_) => "UnknownSlot",
            SchedulerPluginMissing { .. } => "SchedulerPluginMissing",
            NotFound { .. } => "NotFound",
            InvalidSessionSpec { .. } => "InvalidSessionSpec",
            DependencyCycle { .. } => "DependencyCycle",
        }
    }

    /// Create a serialization-conflict error
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::SerializationConflict { detail: detail.into() }
    }

    /// Create a manual-agent rejection
    pub fn manual_agent(reason: impl Into<String>) -> Self {
        Self::ManualAgentInvalid { reason: reason.into() }
    }

    /// Create a config validation error
    pub fn config(detail: impl Into<String>) -> Self {
        Self::ConfigInvalid { detail: detail.into() }
    }

    /// Create a session-spec rejection
    pub fn invalid_spec(detail: impl Into<String>) -> Self {
        Self::InvalidSessionSpec { detail: detail.into() }
    }
}
