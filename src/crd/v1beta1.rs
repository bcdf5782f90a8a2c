//! `v1beta1` VCDCluster and VCDMachine: the hub and storage version
//!
//! Reconcilers only ever see these types. Older versions convert through
//! them (see `crd::conversion`).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ApiEndpoint, ClusterPhase, Condition, MachineAddress, MachinePhase, DEFAULT_API_SERVER_PORT,
};

/// Structured validation error for the hub specs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Join validation errors into one status message
pub fn describe_errors(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VCDCluster",
    plural = "vcdclusters",
    namespaced,
    status = "VCDClusterStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VCDClusterSpec {
    pub org: String,
    pub ovdc: String,
    /// Existing edge gateway the cluster network is routed through
    pub edge_gateway: String,
    pub network: ClusterNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    #[serde(default)]
    pub load_balancer: LoadBalancerSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// CIDR of the routed network created for the cluster, e.g. "10.0.0.0/24"
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Subnet the virtual IP is allocated from; the gateway default when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_subnet: Option<String>,
    #[serde(default)]
    pub port: i32,
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
    pub vapp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl VCDClusterSpec {
    /// Fill in defaults the API server would otherwise leave as zero values
    pub fn apply_defaults(&mut self) {
        if self.load_balancer.port == 0 {
            self.load_balancer.port = DEFAULT_API_SERVER_PORT;
        }
        if let Some(endpoint) = self.control_plane_endpoint.as_mut() {
            if endpoint.port == 0 {
                endpoint.port = self.load_balancer.port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("spec.org", &self.org),
            ("spec.ovdc", &self.ovdc),
            ("spec.edgeGateway", &self.edge_gateway),
        ] {
            if value.trim().is_empty() {
                errors.push(SpecValidationError::new(field, "must not be empty"));
            }
        }

        if !is_valid_cidr(&self.network.cidr) {
            errors.push(SpecValidationError::new(
                "spec.network.cidr",
                format!("'{}' is not an IPv4 CIDR", self.network.cidr),
            ));
        }

        if !(0..=65535).contains(&self.load_balancer.port) {
            errors.push(SpecValidationError::new(
                "spec.loadBalancer.port",
                "must be a TCP port, or 0 for the default",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<std::net::Ipv4Addr>().is_ok()
        && prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false)
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "VCDMachine",
    plural = "vcdmachines",
    namespaced,
    status = "VCDMachineStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VCDMachineSpec {
    /// Name of the owning VCDCluster in the same namespace
    pub cluster_name: String,
    pub template: TemplateRef,
    #[serde(default)]
    pub sizing_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i64>,
    #[serde(default)]
    pub bootstrap: Bootstrap,
    #[serde(default)]
    pub control_plane: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub catalog: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding cloud-init data under the `value` key; set by the bootstrap provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
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
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(default)]
    pub power_on_requested: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl VCDMachineSpec {
    pub fn apply_defaults(&mut self) {
        if let Some(size) = self.disk_size_gb {
            if size <= 0 {
                self.disk_size_gb = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.cluster_name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.clusterName",
                "must reference the owning VCDCluster",
            ));
        }
        if self.template.catalog.trim().is_empty() || self.template.name.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.template",
                "catalog and name are required",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_spec() -> VCDClusterSpec {
        VCDClusterSpec {
            org: "acme".to_string(),
            ovdc: "acme-vdc".to_string(),
            edge_gateway: "edge-01".to_string(),
            network: ClusterNetwork {
                cidr: "10.10.0.0/24".to_string(),
                dns_servers: vec![],
            },
            control_plane_endpoint: Some(ApiEndpoint {
                host: "192.168.10.5".to_string(),
                port: 0,
            }),
            load_balancer: LoadBalancerSpec::default(),
        }
    }

    #[test]
    fn test_cluster_defaults() {
        let mut spec = cluster_spec();
        spec.apply_defaults();
        assert_eq!(spec.load_balancer.port, DEFAULT_API_SERVER_PORT);
        assert_eq!(spec.control_plane_endpoint.unwrap().port, DEFAULT_API_SERVER_PORT);
    }

    #[test]
    fn test_cluster_validation_rejects_bad_cidr() {
        let mut spec = cluster_spec();
        spec.network.cidr = "10.10.0.0".to_string();
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "spec.network.cidr");
    }

    #[test]
    fn test_cluster_validation_collects_all_errors() {
        let mut spec = cluster_spec();
        spec.org = String::new();
        spec.edge_gateway = " ".to_string();
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(describe_errors(&errors).contains("spec.org"));
    }

    #[test]
    fn test_machine_validation_requires_template() {
        let spec = VCDMachineSpec {
            cluster_name: "c1".to_string(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }
}
