//! Resource policies and scaling groups

use crate::model::session::SessionType;
use crate::resources::ResourceSlot;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-scope resource caps
///
/// A scope is a keypair, user group (project), or domain; the same shape
/// serves all three. An empty `total_resource_slots` constrains nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Ceiling on the sum of requested slots of non-terminal sessions.
    /// Slots absent from the ceiling are unconstrained.
    pub total_resource_slots: ResourceSlot,
    /// Concurrent non-terminal normal sessions per access key
    pub max_concurrent_sessions: u32,
    /// Pending sessions allowed per access key; None = unlimited
    pub max_pending_session_count: Option<u32>,
    /// Concurrent private (SFTP sidecar) sessions per access key
    pub max_concurrent_sftp_sessions: u32,
    /// Session types this scope admits; None = all
    pub allowed_session_types: Option<Vec<SessionType>>,
}

impl ResourcePolicy {
    /// A policy that admits everything
    pub fn unlimited() -> Self {
        Self {
            total_resource_slots: ResourceSlot::new(),
            max_concurrent_sessions: u32::MAX,
            max_pending_session_count: None,
            max_concurrent_sftp_sessions: u32::MAX,
            allowed_session_types: None,
        }
    }
}

/// The policy views applied to one session's owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Keypair-scope policy
    pub keypair: ResourcePolicy,
    /// Project/group-scope policy
    pub group: ResourcePolicy,
    /// Domain-scope policy
    pub domain: ResourcePolicy,
}

impl PolicyBundle {
    /// A bundle that admits everything
    pub fn unlimited() -> Self {
        Self {
            keypair: ResourcePolicy::unlimited(),
            group: ResourcePolicy::unlimited(),
            domain: ResourcePolicy::unlimited(),
        }
    }
}

/// A named partition of agents sharing scheduler and selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroup {
    /// Group name; the distributed lock key is derived from this
    pub name: String,
    /// Registered scheduler plugin name (fifo, lifo, drf, fairshare)
    pub scheduler_name: String,
    /// Registered agent selector plugin name (roundrobin, concentrated, dispersed)
    pub agent_selector_name: String,
    /// Plugin options; selector cursors persist under `cursor`
    pub scheduler_opts: serde_json::Value,
    /// How long a session may stay PENDING before forced cancellation
    #[serde(with = "duration_secs")]
    pub pending_timeout: Duration,
    /// Session types this group admits
    pub allowed_session_types: Vec<SessionType>,
}

impl ScalingGroup {
    /// A group with the stock fifo/roundrobin pairing
    pub fn with_defaults(name: impl Into<String>, pending_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            scheduler_name: "fifo".into(),
            agent_selector_name: "roundrobin".into(),
            scheduler_opts: serde_json::json!({}),
            pending_timeout,
            allowed_session_types: vec![
                SessionType::Interactive,
                SessionType::Batch,
                SessionType::Inference,
                SessionType::System,
            ],
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
