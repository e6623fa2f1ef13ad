//! Admission validator chain
//!
//! Validators are predicates over a candidate session, its policy bundle,
//! and a store snapshot. They run in a fixed order and the first failure
//! short-circuits. Denials are ordinary values, not errors: the dispatcher
//! records them into `status_data` and moves on to the next candidate.

use crate::model::{PolicyBundle, ScalingGroup, Session, SessionResult, SessionStatus, SessionType};
use crate::resources::ResourceSlot;
use crate::store::{CounterKind, ValidationView};

/// Why a validator denied a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialKind {
    /// A dependency has not terminated successfully
    DependencyNotSatisfied,
    /// A reserved batch session's start time is still in the future
    ReservedTimeNotReached,
    /// The access key is at its concurrency ceiling
    ConcurrencyLimit,
    /// Too many PENDING sessions for the access key
    PendingQuotaExceeded,
    /// A scope's total_resource_slots ceiling would be exceeded
    ResourcePolicyExceeded {
        /// Which scope denied: "domain", "group", or "keypair"
        scope: &'static str,
    },
    /// The scaling group does not admit this session type
    DisallowedSessionType,
}

impl DenialKind {
    /// Machine-readable reason recorded into `status_data`
    pub fn reason(&self) -> &'static str {
        match self {
            DenialKind::DependencyNotSatisfied => "DependencyNotSatisfied",
            DenialKind::ReservedTimeNotReached => "ReservedTimeNotReached",
            DenialKind::ConcurrencyLimit => "ConcurrencyLimit",
            DenialKind::PendingQuotaExceeded => "PendingQuotaExceeded",
            DenialKind::ResourcePolicyExceeded { .. } => "ResourcePolicyExceeded",
            DenialKind::DisallowedSessionType => "DisallowedSessionType",
        }
    }
}

/// Validator outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The session may proceed
    Pass,
    /// The session is denied this tick
    Fail {
        /// Denial category
        kind: DenialKind,
        /// Human-readable detail
        info: String,
    },
}

impl Decision {
    fn fail(kind: DenialKind, info: impl Into<String>) -> Self {
        Decision::Fail { kind, info: info.into() }
    }

    /// True for `Pass`
    pub fn passed(&self) -> bool {
        matches!(self, Decision::Pass)
    }
}

/// Run the full chain in its fixed order
///
/// Private (system) sessions run only the dependency, reserved-batch, and
/// concurrency validators.
pub fn run_chain(
    session: &Session,
    group: &ScalingGroup,
    bundle: &PolicyBundle,
    view: &ValidationView,
) -> Decision {
    let decision = check_dependencies(session, view);
    if !decision.passed() {
        return decision;
    }
    let decision = check_reserved_batch(session, view);
    if !decision.passed() {
        return decision;
    }
    let decision = check_concurrency(session, bundle, view);
    if !decision.passed() {
        return decision;
    }
    if session.session_type.is_private() {
        return Decision::Pass;
    }
    let decision = check_pending_quota(bundle, view);
    if !decision.passed() {
        return decision;
    }
    let decision = check_resource_ceilings(session, bundle, view);
    if !decision.passed() {
        return decision;
    }
    check_session_type(session, group)
}

/// Every declared dependency must be TERMINATED with result SUCCESS
fn check_dependencies(session: &Session, view: &ValidationView) -> Decision {
    if view.dependencies.len() != session.dependencies.len() {
        return Decision::fail(
            DenialKind::DependencyNotSatisfied,
            "a declared dependency no longer exists",
        );
    }
    for (dep_id, status, result) in &view.dependencies {
        if *status != SessionStatus::Terminated || *result != SessionResult::Success {
            return Decision::fail(
                DenialKind::DependencyNotSatisfied,
                format!("dependency {} is {} ({:?})", dep_id, status, result),
            );
        }
    }
    Decision::Pass
}

/// Reserved batch sessions wait for their start time
fn check_reserved_batch(session: &Session, view: &ValidationView) -> Decision {
    if session.session_type == SessionType::Batch {
        if let Some(starts_at) = session.starts_at {
            if view.now < starts_at {
                return Decision::fail(
                    DenialKind::ReservedTimeNotReached,
                    format!("reserved start {}", starts_at.to_rfc3339()),
                );
            }
        }
    }
    Decision::Pass
}

/// Per-access-key concurrency ceiling
///
/// On pass the dispatcher schedules the counter increment inside the
/// scheduling transaction; any later abort discards it with the rest.
fn check_concurrency(session: &Session, bundle: &PolicyBundle, view: &ValidationView) -> Decision {
    let limit = match CounterKind::for_session(session) {
        CounterKind::System => bundle.keypair.max_concurrent_sftp_sessions,
        CounterKind::Normal => bundle.keypair.max_concurrent_sessions,
    };
    if view.concurrency_used >= limit {
        return Decision::fail(
            DenialKind::ConcurrencyLimit,
            format!("{} of {} concurrent sessions in use", view.concurrency_used, limit),
        );
    }
    Decision::Pass
}

/// Pending-session quota; the candidate itself counts as pending
fn check_pending_quota(bundle: &PolicyBundle, view: &ValidationView) -> Decision {
    if let Some(max) = bundle.keypair.max_pending_session_count {
        if view.pending_count > max {
            return Decision::fail(
                DenialKind::PendingQuotaExceeded,
                format!("{} pending sessions exceed quota {}", view.pending_count, max),
            );
        }
    }
    Decision::Pass
}

/// Domain, then group, then keypair total-resource ceilings
fn check_resource_ceilings(
    session: &Session,
    bundle: &PolicyBundle,
    view: &ValidationView,
) -> Decision {
    let checks: [(&'static str, &ResourceSlot, &ResourceSlot); 3] = [
        ("domain", &view.domain_occupied, &bundle.domain.total_resource_slots),
        ("group", &view.group_occupied, &bundle.group.total_resource_slots),
        ("keypair", &view.keypair_occupied, &bundle.keypair.total_resource_slots),
    ];
    for (scope, occupied, ceiling) in checks {
        if !ResourceSlot::fits_ceiling(occupied, &session.requested_slots, ceiling) {
            return Decision::fail(
                DenialKind::ResourcePolicyExceeded { scope },
                format!("{} ceiling {} exceeded (used {})", scope, ceiling, occupied),
            );
        }
    }
    Decision::Pass
}

/// The scaling group must admit the session type
fn check_session_type(session: &Session, group: &ScalingGroup) -> Decision {
    if group.allowed_session_types.contains(&session.session_type) {
        Decision::Pass
    } else {
        Decision::fail(
            DenialKind::DisallowedSessionType,
            format!("{:?} not allowed in scaling group {}", session.session_type, group.name),
        )
    }
}
