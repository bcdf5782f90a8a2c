//! Condition management and `Ready` aggregation following Cluster API conventions

use crate::crd::{Condition, ConditionSeverity, ConditionStatus};

pub const READY: &str = "Ready";
pub const INFRASTRUCTURE_READY: &str = "InfrastructureReady";
pub const CONTROL_PLANE_ENDPOINT_READY: &str = "ControlPlaneEndpointReady";
pub const BOOTSTRAP_DATA_READY: &str = "BootstrapDataReady";
pub const VM_PROVISIONED: &str = "VMProvisioned";
pub const LOAD_BALANCER_MEMBER_READY: &str = "LoadBalancerMemberReady";

/// Children rolled up into a VCDCluster's `Ready`
pub const CLUSTER_READY_DEPENDENCIES: &[&str] = &[INFRASTRUCTURE_READY, CONTROL_PLANE_ENDPOINT_READY];

/// Children rolled up into a VCDMachine's `Ready`
pub fn machine_ready_dependencies(control_plane: bool) -> &'static [&'static str] {
    if control_plane {
        &[BOOTSTRAP_DATA_READY, VM_PROVISIONED, LOAD_BALANCER_MEMBER_READY]
    } else {
        &[BOOTSTRAP_DATA_READY, VM_PROVISIONED]
    }
}

/// Update or add a condition to the conditions list
///
/// The transition time is only replaced when the status changes, so
/// rewriting an unchanged condition leaves the list byte-for-byte equal.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let should_update_time = existing.status != condition.status;

        existing.severity = condition.severity;
        existing.reason = condition.reason;
        existing.message = condition.message;

        if should_update_time {
            existing.status = condition.status;
            existing.last_transition_time = condition.last_transition_time;
        }
    } else {
        conditions.push(condition);
    }
}

pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(conditions, Condition::new_true(type_));
}

pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set_condition(conditions, Condition::new_false(type_, reason, severity, message));
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(Condition::is_true)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Derive `Ready` from the listed child conditions
///
/// - any child `False`: `Ready=False`, taking severity and reason from the
///   most severe child (Error over Warning over Info) and listing every
///   child at that severity in the message
/// - otherwise any child `Unknown` or missing: `Ready=Unknown`
/// - otherwise: `Ready=True`
///
/// Child conditions are never modified.
pub fn summarize(conditions: &[Condition], dependencies: &[&str]) -> Condition {
    let children: Vec<(&str, Option<&Condition>)> = dependencies
        .iter()
        .map(|d| (*d, find_condition(conditions, d)))
        .collect();

    let worst = children
        .iter()
        .filter_map(|(_, c)| *c)
        .filter(|c| c.status == ConditionStatus::False)
        .map(|c| c.severity.unwrap_or(ConditionSeverity::Info))
        .max();

    if let Some(severity) = worst {
        let failing: Vec<&Condition> = children
            .iter()
            .filter_map(|(_, c)| *c)
            .filter(|c| {
                c.status == ConditionStatus::False
                    && c.severity.unwrap_or(ConditionSeverity::Info) == severity
            })
            .collect();
        let reason = failing
            .first()
            .map(|c| c.reason.as_str())
            .unwrap_or_default();
        let message = failing
            .iter()
            .map(|c| {
                if c.message.is_empty() {
                    c.type_.clone()
                } else {
                    format!("{}: {}", c.type_, c.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Condition::new_false(READY, reason, severity, message);
    }

    if let Some((type_, existing)) = children
        .iter()
        .find(|(_, c)| c.map(|c| c.status == ConditionStatus::Unknown).unwrap_or(true))
    {
        return match existing {
            Some(c) => Condition::new_unknown(READY, &c.reason, format!("{}: {}", type_, c.message)),
            None => Condition::new_unknown(
                READY,
                &format!("WaitingFor{type_}"),
                format!("{type_} has not been reported yet"),
            ),
        };
    }

    Condition::new_true(READY)
}

/// Recompute `Ready` from its children and store it
pub fn set_summary(conditions: &mut Vec<Condition>, dependencies: &[&str]) -> bool {
    let ready = summarize(conditions, dependencies);
    let is_ready = ready.is_true();
    set_condition(conditions, ready);
    is_ready
}
