//! Shared types used by every version of the VCDCluster and VCDMachine CRDs

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of both infrastructure kinds
pub const API_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// Finalizer protecting VCDCluster infrastructure
pub const CLUSTER_FINALIZER: &str = "vcdcluster.infrastructure.cluster.x-k8s.io";

/// Finalizer protecting VCDMachine virtual machines
pub const MACHINE_FINALIZER: &str = "vcdmachine.infrastructure.cluster.x-k8s.io";

/// Annotation carrying fields a schema version cannot represent
pub const CONVERSION_DATA_ANNOTATION: &str =
    "capvcd.infrastructure.cluster.x-k8s.io/conversion-data";

/// Default port of the Kubernetes API server behind the load balancer
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

/// Host/port pair of the control-plane endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }
}

/// Lifecycle phase of a VCDCluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Provisioned,
    Deleting,
    Failed,
}

/// Lifecycle phase of a VCDMachine
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    #[default]
    Pending,
    Provisioning,
    Running,
    Deleting,
    Failed,
}

impl MachinePhase {
    fn rank(&self) -> u8 {
        match self {
            MachinePhase::Pending => 0,
            MachinePhase::Provisioning | MachinePhase::Failed => 1,
            MachinePhase::Running => 2,
            MachinePhase::Deleting => 3,
        }
    }

    /// Phases only move forward, except `Failed` -> `Provisioning` on retry
    ///
    /// `Failed` is entered from `Provisioning`, or from `Running` when the
    /// VM is lost.
    pub fn can_transition_to(&self, next: MachinePhase) -> bool {
        match (self, next) {
            (MachinePhase::Failed, MachinePhase::Provisioning) => true,
            (MachinePhase::Failed, MachinePhase::Deleting) => true,
            (MachinePhase::Failed, _) => *self == next,
            (_, MachinePhase::Failed) => {
                matches!(self, MachinePhase::Provisioning | MachinePhase::Running)
            }
            _ => next.rank() >= self.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachinePhase::Pending => "Pending",
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Running => "Running",
            MachinePhase::Deleting => "Deleting",
            MachinePhase::Failed => "Failed",
        }
    }
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// How bad a `False` condition is
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum ConditionSeverity {
    Info,
    Warning,
    Error,
}

/// Condition for status reporting (Cluster API convention)
///
/// # Example
///
/// ```rust
/// use capvcd::crd::{Condition, ConditionStatus};
///
/// let condition = Condition::new_true("InfrastructureReady");
/// assert_eq!(condition.status, ConditionStatus::True);
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "InfrastructureReady")
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// Only meaningful when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,
    /// Last time the condition transitioned, RFC 3339
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new_true(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn new_false(
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn new_unknown(type_: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Address reported for a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: String,
    pub address: String,
}

impl MachineAddress {
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self {
            type_: "InternalIP".to_string(),
            address: address.into(),
        }
    }
}
