//! Typed status conditions
//!
//! Conditions are the only user-visible failure surface of the operator:
//! every reconcile appends/updates them in memory and the whole list is
//! replaced on the status patch.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Condition types and reasons
// =============================================================================

/// Availability of the shared kubeadm profile on the hypervisor.
pub const KUBEADM_PROFILE_AVAILABLE_CONDITION: &str = "KubeadmProfileAvailable";
pub const KUBEADM_PROFILE_DISABLED_REASON: &str = "KubeadmProfileDisabled";
pub const KUBEADM_PROFILE_CREATION_ABORTED_REASON: &str = "KubeadmProfileCreationAborted";
pub const KUBEADM_PROFILE_CREATION_FAILED_REASON: &str = "KubeadmProfileCreationFailed";

/// Availability of the cluster load balancer.
pub const LOAD_BALANCER_AVAILABLE_CONDITION: &str = "LoadBalancerAvailable";
pub const LOAD_BALANCER_PROVISIONING_ABORTED_REASON: &str = "LoadBalancerProvisioningAborted";
pub const LOAD_BALANCER_PROVISIONING_FAILED_REASON: &str = "LoadBalancerProvisioningFailed";

/// Set on the IncusCluster by the control plane provider once the first
/// API server is reachable. Consumed, never written, by this operator.
pub const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";

/// Provisioning state of the instance backing an IncusMachine.
pub const INSTANCE_PROVISIONED_CONDITION: &str = "InstanceProvisioned";
pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON: &str = "WaitingForClusterInfrastructure";
pub const WAITING_FOR_BOOTSTRAP_DATA_REASON: &str = "WaitingForBootstrapData";
pub const WAITING_FOR_CONTROL_PLANE_AVAILABLE_REASON: &str = "WaitingForControlPlaneAvailable";
pub const CREATING_INSTANCE_REASON: &str = "CreatingInstance";
pub const INSTANCE_PROVISIONING_ABORTED_REASON: &str = "InstanceProvisioningAborted";
pub const INSTANCE_PROVISIONING_FAILED_REASON: &str = "InstanceProvisioningFailed";
pub const INSTANCE_DELETED_REASON: &str = "InstanceDeleted";

/// Outcome of the in-instance cloud-init bootstrap.
pub const BOOTSTRAP_SUCCEEDED_CONDITION: &str = "BootstrapSucceeded";
pub const BOOTSTRAPPING_REASON: &str = "Bootstrapping";
pub const BOOTSTRAP_FAILED_REASON: &str = "BootstrapFailed";
pub const BOOTSTRAP_STATUS_UNKNOWN_REASON: &str = "BootstrapStatusUnknown";

/// Summary condition.
pub const READY_CONDITION: &str = "Ready";

/// Shared reason for delete-in-progress markers.
pub const DELETING_REASON: &str = "Deleting";

// =============================================================================
// Condition model
// =============================================================================

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition severity, ranked Error > Warning > Info
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionSeverity {
    #[default]
    Info,
    Warning,
    Error,
}

/// A typed, severity-ranked status entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Severity of the condition when it is not True
    #[serde(default)]
    pub severity: ConditionSeverity,
    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn truthy(r#type: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: ConditionStatus::True,
            severity: ConditionSeverity::Info,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn falsy(r#type: &str, reason: &str, severity: ConditionSeverity, message: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: ConditionStatus::False,
            severity,
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then(|| message.to_string()),
            last_transition_time: Some(Utc::now()),
        }
    }

    pub fn unknown(r#type: &str, reason: &str, message: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: ConditionStatus::Unknown,
            severity: ConditionSeverity::Info,
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then(|| message.to_string()),
            last_transition_time: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Set a condition, replacing any existing condition of the same type.
/// The transition timestamp of an unchanged status is preserved.
pub fn set(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        let last_transition_time = if existing.status == condition.status {
            existing.last_transition_time
        } else {
            condition.last_transition_time
        };
        *existing = Condition {
            last_transition_time,
            ..condition
        };
    } else {
        conditions.push(condition);
    }
}

pub fn mark_true(conditions: &mut Vec<Condition>, r#type: &str) {
    set(conditions, Condition::truthy(r#type));
}

pub fn mark_false(
    conditions: &mut Vec<Condition>,
    r#type: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set(conditions, Condition::falsy(r#type, reason, severity, message));
}

pub fn mark_unknown(conditions: &mut Vec<Condition>, r#type: &str, reason: &str, message: &str) {
    set(conditions, Condition::unknown(r#type, reason, message));
}

pub fn get<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

pub fn is_true(conditions: &[Condition], r#type: &str) -> bool {
    get(conditions, r#type).map(|c| c.status == ConditionStatus::True) == Some(true)
}

/// Update the Ready summary condition from the given infrastructure
/// condition types: True if all are True, otherwise a copy of the worst
/// offender (ranked by severity).
pub fn summarize(conditions: &mut Vec<Condition>, types: &[&str]) {
    let worst = conditions
        .iter()
        .filter(|c| types.contains(&c.r#type.as_str()) && c.status != ConditionStatus::True)
        .max_by_key(|c| c.severity)
        .cloned();

    match worst {
        None => mark_true(conditions, READY_CONDITION),
        Some(c) => set(
            conditions,
            Condition {
                r#type: READY_CONDITION.to_string(),
                status: c.status,
                severity: c.severity,
                reason: c.reason,
                message: c.message,
                last_transition_time: Some(Utc::now()),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_same_type() {
        let mut conditions = vec![];
        mark_false(
            &mut conditions,
            LOAD_BALANCER_AVAILABLE_CONDITION,
            LOAD_BALANCER_PROVISIONING_FAILED_REASON,
            ConditionSeverity::Warning,
            "connection refused",
        );
        mark_true(&mut conditions, LOAD_BALANCER_AVAILABLE_CONDITION);

        assert_eq!(conditions.len(), 1);
        assert!(is_true(&conditions, LOAD_BALANCER_AVAILABLE_CONDITION));
    }

    #[test]
    fn test_set_preserves_transition_time_for_same_status() {
        let mut conditions = vec![];
        mark_true(&mut conditions, LOAD_BALANCER_AVAILABLE_CONDITION);
        let first = conditions[0].last_transition_time;

        mark_true(&mut conditions, LOAD_BALANCER_AVAILABLE_CONDITION);
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn test_summarize_all_true() {
        let mut conditions = vec![];
        mark_true(&mut conditions, KUBEADM_PROFILE_AVAILABLE_CONDITION);
        mark_true(&mut conditions, LOAD_BALANCER_AVAILABLE_CONDITION);
        summarize(
            &mut conditions,
            &[
                KUBEADM_PROFILE_AVAILABLE_CONDITION,
                LOAD_BALANCER_AVAILABLE_CONDITION,
            ],
        );

        assert!(is_true(&conditions, READY_CONDITION));
    }

    #[test]
    fn test_summarize_copies_worst_severity() {
        let mut conditions = vec![];
        mark_false(
            &mut conditions,
            KUBEADM_PROFILE_AVAILABLE_CONDITION,
            KUBEADM_PROFILE_CREATION_FAILED_REASON,
            ConditionSeverity::Warning,
            "transient",
        );
        mark_false(
            &mut conditions,
            LOAD_BALANCER_AVAILABLE_CONDITION,
            LOAD_BALANCER_PROVISIONING_ABORTED_REASON,
            ConditionSeverity::Error,
            "missing extension",
        );
        summarize(
            &mut conditions,
            &[
                KUBEADM_PROFILE_AVAILABLE_CONDITION,
                LOAD_BALANCER_AVAILABLE_CONDITION,
            ],
        );

        let ready = get(&conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.severity, ConditionSeverity::Error);
        assert_eq!(
            ready.reason.as_deref(),
            Some(LOAD_BALANCER_PROVISIONING_ABORTED_REASON)
        );
    }
}
