//! `v1alpha1` VCDCluster and VCDMachine
//!
//! The original schema. Still served so existing manifests keep working;
//! every object is converted to `v1beta1` before it is stored.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, ClusterPhase, Condition, MachinePhase};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "VCDCluster",
    plural = "vcdclusters",
    namespaced,
    status = "VCDClusterStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VCDClusterSpec {
    pub org: String,
    pub ovdc: String,
    pub edge_gateway: String,
    pub network_cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    /// Dropped in v1beta1; the management role is decided by the bootstrap flow
    #[serde(default)]
    pub use_as_management_cluster: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCDClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "VCDMachine",
    plural = "vcdmachines",
    namespaced,
    status = "VCDMachineStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct VCDMachineSpec {
    pub cluster_name: String,
    pub catalog: String,
    pub template: String,
    #[serde(default)]
    pub compute_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data_secret: Option<String>,
    #[serde(default)]
    pub control_plane: bool,
    /// Dropped in v1beta1; GPU placement moved to placement policies
    #[serde(default)]
    pub enable_nvidia_gpu: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCDMachineStatus {
    #[serde(default)]
    pub phase: MachinePhase,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Plain IP addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
