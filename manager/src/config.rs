//! Manager configuration
//!
//! Layered from an optional TOML file plus `GRIDMESH_*` environment
//! overrides. Every knob carries the documented default so an empty file is
//! a valid deployment.

use crate::error::{Result, SchedulingError};
use crate::resources::{SlotRegistry, SlotType, SlotUnit};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scheduling loop configuration (`schedule.*` keys)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Per-group tick interval
    #[serde(default = "defaults::interval_ms")]
    pub interval_ms: u64,
    /// Distributed lock lease; must be at least twice the tick interval
    #[serde(default = "defaults::lock_lease_ms")]
    pub lock_lease_ms: u64,
    /// Scheduling transaction retry budget per session per tick
    #[serde(default = "defaults::tx_retries")]
    pub tx_retries: u32,
    /// PENDING age after which sessions are force-cancelled
    #[serde(default = "defaults::pending_timeout_ms")]
    pub pending_timeout_default_ms: u64,
    /// Per-call agent RPC deadline
    #[serde(default = "defaults::rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Wall-clock budget for one scheduling tick
    #[serde(default = "defaults::tick_budget_ms")]
    pub tick_budget_ms: u64,
    /// Heartbeat silence after which an agent is marked LOST
    #[serde(default = "defaults::heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::interval_ms(),
            lock_lease_ms: defaults::lock_lease_ms(),
            tx_retries: defaults::tx_retries(),
            pending_timeout_default_ms: defaults::pending_timeout_ms(),
            rpc_timeout_ms: defaults::rpc_timeout_ms(),
            tick_budget_ms: defaults::tick_budget_ms(),
            heartbeat_timeout_ms: defaults::heartbeat_timeout_ms(),
        }
    }
}

impl ScheduleConfig {
    /// Tick interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Lock lease as a duration
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    /// Default pending timeout as a duration
    pub fn pending_timeout_default(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_default_ms)
    }

    /// RPC deadline as a duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Tick budget as a duration
    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    /// Heartbeat timeout as a duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// A configured slot type entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTypeConfig {
    /// Slot name
    pub name: String,
    /// Unit semantics
    pub unit: SlotUnit,
}

/// Resource slot configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SlotsConfig {
    /// Additional slot types beyond the builtin cpu/mem pair
    #[serde(default)]
    pub known_slot_types: Vec<SlotTypeConfig>,
}

/// Top-level manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Scheduling loop knobs
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Slot registry extensions
    #[serde(default)]
    pub slots: SlotsConfig,
}

impl ManagerConfig {
    /// Load from an optional TOML file layered under `GRIDMESH_*` env vars
    ///
    /// `GRIDMESH_SCHEDULE__INTERVAL_MS=5000` overrides `schedule.interval_ms`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml).required(true),
            );
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("GRIDMESH").separator("__"))
            .build()
            .map_err(|e| SchedulingError::config(e.to_string()))?;
        let parsed: ManagerConfig = cfg
            .try_deserialize()
            .map_err(|e| SchedulingError::config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject inconsistent knob combinations
    pub fn validate(&self) -> Result<()> {
        if self.schedule.interval_ms == 0 {
            return Err(SchedulingError::config("schedule.interval_ms must be positive"));
        }
        if self.schedule.lock_lease_ms < 2 * self.schedule.interval_ms {
            return Err(SchedulingError::config(format!(
                "schedule.lock_lease_ms ({}) must be at least twice schedule.interval_ms ({})",
                self.schedule.lock_lease_ms, self.schedule.interval_ms
            )));
        }
        if self.schedule.tx_retries == 0 {
            return Err(SchedulingError::config("schedule.tx_retries must be positive"));
        }
        Ok(())
    }

    /// Build the slot registry: builtin types plus configured extensions
    pub fn slot_registry(&self) -> SlotRegistry {
        let mut registry = SlotRegistry::builtin();
        for slot in &self.slots.known_slot_types {
            registry.register(SlotType { name: slot.name.clone(), unit: slot.unit });
        }
        registry
    }
}

mod defaults {
    pub fn interval_ms() -> u64 {
        10_000
    }
    pub fn lock_lease_ms() -> u64 {
        30_000
    }
    pub fn tx_retries() -> u32 {
        10
    }
    pub fn pending_timeout_ms() -> u64 {
        86_400_000
    }
    pub fn rpc_timeout_ms() -> u64 {
        30_000
    }
    pub fn tick_budget_ms() -> u64 {
        60_000
    }
    pub fn heartbeat_timeout_ms() -> u64 {
        60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.schedule.interval(), Duration::from_secs(10));
        assert_eq!(cfg.schedule.lock_lease(), Duration::from_secs(30));
        assert_eq!(cfg.schedule.tx_retries, 10);
        assert_eq!(cfg.schedule.pending_timeout_default(), Duration::from_secs(86_400));
        assert_eq!(cfg.schedule.rpc_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_lease_must_cover_two_ticks() {
        let mut cfg = ManagerConfig::default();
        cfg.schedule.interval_ms = 20_000;
        assert!(cfg.validate().is_err());
        cfg.schedule.lock_lease_ms = 40_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[schedule]\ninterval_ms = 2000\nlock_lease_ms = 9000\n\n\
             [[slots.known_slot_types]]\nname = \"cuda.device\"\nunit = \"count\"\n"
        )
        .unwrap();
        let cfg = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.schedule.interval_ms, 2000);
        assert!(cfg.slot_registry().knows("cuda.device"));
        assert!(cfg.slot_registry().knows("cpu"));
    }
}
