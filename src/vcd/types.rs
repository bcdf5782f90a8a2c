//! Typed view of the Cloud Director objects, tasks and requests the provider uses

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;

/// Metadata key recording which Kubernetes object owns an external object
pub const OWNER_METADATA_KEY: &str = "capvcd.io/owner";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    EdgeGateway,
    Network,
    VApp,
    Vm,
    LoadBalancer,
}

impl ResourceKind {
    /// CloudAPI collection holding objects of this kind
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::EdgeGateway => "edgeGateways",
            ResourceKind::Network => "orgVdcNetworks",
            ResourceKind::VApp => "vApps",
            ResourceKind::Vm => "vms",
            ResourceKind::LoadBalancer => "loadBalancer/virtualServices",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::EdgeGateway => "edge-gateway",
            ResourceKind::Network => "network",
            ResourceKind::VApp => "vapp",
            ResourceKind::Vm => "vm",
            ResourceKind::LoadBalancer => "load-balancer",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a platform task, closed over the states the provider acts on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskStatus {
    /// Map the platform's status string; unknown values are treated as still running
    pub fn from_platform(status: &str) -> Self {
        match status {
            "queued" | "preRunning" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "success" => TaskStatus::Success,
            "error" | "aborted" | "canceled" => TaskStatus::Error,
            _ => TaskStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }
}

/// Reference to an in-flight platform operation
///
/// Never persisted: if it is lost, the next reconcile re-derives progress
/// from the observed state of the object it was acting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    pub href: String,
    /// Human-readable description, e.g. "create vm tenant-a-m1"
    pub operation: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub status: TaskStatus,
    pub message: Option<String>,
}

/// Coarse lifecycle state of an external object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    #[default]
    Ready,
    Failed,
    #[serde(other)]
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "POWERED_ON")]
    PoweredOn,
    #[serde(rename = "POWERED_OFF")]
    PoweredOff,
    #[serde(rename = "SUSPENDED")]
    Suspended,
    #[serde(other)]
    Unknown,
}

/// Observed state of a platform object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: EntityState,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
    #[serde(default)]
    pub guest_customized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExternalObject {
    pub fn owner(&self) -> Option<&str> {
        self.metadata.get(OWNER_METADATA_KEY).map(String::as_str)
    }

    pub fn is_powered_on(&self) -> bool {
        self.power_state == Some(PowerState::PoweredOn)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub name: String,
    pub vdc: String,
    pub gateway_id: String,
    pub gateway_address: String,
    pub prefix_length: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VAppRequest {
    pub name: String,
    pub vdc: String,
    pub network_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRequest {
    pub name: String,
    pub vapp_id: String,
    pub network_id: String,
    pub catalog: String,
    pub template: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sizing_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRequest {
    pub name: String,
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vip_subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,
    pub port: i32,
}

/// A create request for one external object, tagged with its owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub owner: String,
    pub spec: ResourceSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceSpec {
    Network(NetworkRequest),
    VApp(VAppRequest),
    Vm(VmRequest),
    LoadBalancer(LoadBalancerRequest),
}

impl ResourceRequest {
    pub fn kind(&self) -> ResourceKind {
        match &self.spec {
            ResourceSpec::Network(_) => ResourceKind::Network,
            ResourceSpec::VApp(_) => ResourceKind::VApp,
            ResourceSpec::Vm(_) => ResourceKind::Vm,
            ResourceSpec::LoadBalancer(_) => ResourceKind::LoadBalancer,
        }
    }

    pub fn name(&self) -> &str {
        match &self.spec {
            ResourceSpec::Network(r) => &r.name,
            ResourceSpec::VApp(r) => &r.name,
            ResourceSpec::Vm(r) => &r.name,
            ResourceSpec::LoadBalancer(r) => &r.name,
        }
    }

    /// JSON body sent to the platform, including the owner metadata
    pub fn body(&self) -> Result<Value> {
        let mut body = match &self.spec {
            ResourceSpec::Network(r) => serde_json::to_value(r)?,
            ResourceSpec::VApp(r) => serde_json::to_value(r)?,
            ResourceSpec::Vm(r) => serde_json::to_value(r)?,
            ResourceSpec::LoadBalancer(r) => serde_json::to_value(r)?,
        };
        if let Some(fields) = body.as_object_mut() {
            fields.insert(
                "metadata".to_string(),
                json!({ OWNER_METADATA_KEY: self.owner }),
            );
        }
        Ok(body)
    }
}

/// Mutating action on an existing object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    PowerOn,
    PowerOff,
    /// Guest customization; `user_data` is base64-encoded cloud-init
    Customize {
        computer_name: String,
        user_data: String,
    },
    SetMembers {
        members: Vec<String>,
        port: i32,
    },
}

impl Operation {
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::PowerOn => "powerOn",
            Operation::PowerOff => "powerOff",
            Operation::Customize { .. } => "customize",
            Operation::SetMembers { .. } => "setMembers",
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Operation::PowerOn | Operation::PowerOff => json!({}),
            Operation::Customize {
                computer_name,
                user_data,
            } => json!({
                "computerName": computer_name,
                "userData": user_data,
            }),
            Operation::SetMembers { members, port } => json!({
                "members": members,
                "port": port,
            }),
        }
    }
}

/// How the platform answered a mutating call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Accepted; progress is tracked by the task
    Task(TaskHandle),
    /// Applied synchronously
    Completed,
    /// An object with the same name already exists
    AlreadyExists,
    /// Another operation on the object is in progress
    Busy,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_mapping() {
        assert_eq!(TaskStatus::from_platform("preRunning"), TaskStatus::Queued);
        assert_eq!(TaskStatus::from_platform("running"), TaskStatus::Running);
        assert_eq!(TaskStatus::from_platform("success"), TaskStatus::Success);
        assert_eq!(TaskStatus::from_platform("aborted"), TaskStatus::Error);
        assert_eq!(TaskStatus::from_platform("somethingNew"), TaskStatus::Running);
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn test_external_object_defaults() {
        let object: ExternalObject = serde_json::from_value(json!({
            "id": "urn:vcloud:vm:1",
            "name": "tenant-a-m1",
            "state": "creating",
            "powerState": "POWERED_OFF",
            "metadata": {"capvcd.io/owner": "tenant-a/m1"}
        }))
        .unwrap();
        assert_eq!(object.state, EntityState::Busy);
        assert_eq!(object.power_state, Some(PowerState::PoweredOff));
        assert_eq!(object.owner(), Some("tenant-a/m1"));
        assert!(!object.guest_customized);
    }

    #[test]
    fn test_request_body_carries_owner() {
        let request = ResourceRequest {
            owner: "tenant-a/c1".to_string(),
            spec: ResourceSpec::VApp(VAppRequest {
                name: "tenant-a-c1".to_string(),
                vdc: "acme-vdc".to_string(),
                network_id: "urn:vcloud:network:1".to_string(),
            }),
        };
        let body = request.body().unwrap();
        assert_eq!(body["metadata"][OWNER_METADATA_KEY], "tenant-a/c1");
        assert_eq!(body["networkId"], "urn:vcloud:network:1");
        assert_eq!(request.kind(), ResourceKind::VApp);
    }
}
