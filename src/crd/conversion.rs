//! Conversion between schema versions, using `v1beta1` as the hub
//!
//! Every non-hub version implements [`Convertible`]. Fields one side cannot
//! represent travel in the [`CONVERSION_DATA_ANNOTATION`] of the produced
//! object and are restored, then dropped, on the way back, so
//! `from_hub(to_hub(x)) == x` and `to_hub(from_hub(h)) == h`.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{MachineAddress, API_GROUP, CONVERSION_DATA_ANNOTATION};
use super::{v1alpha1, v1beta1};
use crate::error::{Error, Result};

pub const HUB_VERSION: &str = "v1beta1";
pub const V1ALPHA1: &str = "v1alpha1";

/// A non-hub schema version that converts losslessly through `Hub`
pub trait Convertible<Hub>: Sized {
    fn to_hub(&self) -> Result<Hub>;
    fn from_hub(hub: &Hub) -> Result<Self>;
}

/// Remove and decode the conversion annotation, if present
fn take_conversion_data<T: DeserializeOwned>(meta: &mut ObjectMeta) -> Result<Option<T>> {
    let Some(annotations) = meta.annotations.as_mut() else {
        return Ok(None);
    };
    let raw = annotations.remove(CONVERSION_DATA_ANNOTATION);
    if annotations.is_empty() {
        meta.annotations = None;
    }
    match raw {
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
            Error::ConversionError(format!("corrupt {CONVERSION_DATA_ANNOTATION}: {e}"))
        }),
        None => Ok(None),
    }
}

/// Encode `data` into the conversion annotation unless there is nothing to keep
fn put_conversion_data<T: Serialize + Default + PartialEq>(
    meta: &mut ObjectMeta,
    data: &T,
) -> Result<()> {
    if *data == T::default() {
        return Ok(());
    }
    let raw = serde_json::to_string(data)?;
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CONVERSION_DATA_ANNOTATION.to_string(), raw);
    Ok(())
}

// ── VCDCluster ──────────────────────────────────────────────────────────────

/// v1alpha1-only cluster fields, kept on the hub object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterAlphaData {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    use_as_management_cluster: bool,
}

/// Hub-only cluster fields, kept on the v1alpha1 object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterHubData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dns_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vip_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    load_balancer_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vapp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioning_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl Convertible<v1beta1::VCDCluster> for v1alpha1::VCDCluster {
    fn to_hub(&self) -> Result<v1beta1::VCDCluster> {
        let mut metadata = self.metadata.clone();
        let kept: ClusterHubData = take_conversion_data(&mut metadata)?.unwrap_or_default();

        let spec = v1beta1::VCDClusterSpec {
            org: self.spec.org.clone(),
            ovdc: self.spec.ovdc.clone(),
            edge_gateway: self.spec.edge_gateway.clone(),
            network: v1beta1::ClusterNetwork {
                cidr: self.spec.network_cidr.clone(),
                dns_servers: kept.dns_servers.clone(),
            },
            control_plane_endpoint: self.spec.control_plane_endpoint.clone(),
            load_balancer: v1beta1::LoadBalancerSpec {
                vip_subnet: kept.vip_subnet.clone(),
                port: kept.load_balancer_port,
            },
        };

        let status = self.status.as_ref().map(|s| v1beta1::VCDClusterStatus {
            phase: s.phase,
            ready: s.ready,
            gateway_id: s.gateway_id.clone(),
            network_id: s.network_id.clone(),
            vapp_id: kept.vapp_id.clone(),
            load_balancer_pool_id: s.load_balancer_pool_id.clone(),
            control_plane_endpoint: s.control_plane_endpoint.clone(),
            conditions: s.conditions.clone(),
            observed_generation: kept.observed_generation,
            provisioning_started_at: kept.provisioning_started_at.clone(),
            failure_reason: kept.failure_reason.clone(),
            failure_message: kept.failure_message.clone(),
        });

        put_conversion_data(
            &mut metadata,
            &ClusterAlphaData {
                use_as_management_cluster: self.spec.use_as_management_cluster,
            },
        )?;

        Ok(v1beta1::VCDCluster {
            metadata,
            spec,
            status,
        })
    }

    fn from_hub(hub: &v1beta1::VCDCluster) -> Result<Self> {
        let mut metadata = hub.metadata.clone();
        let kept: ClusterAlphaData = take_conversion_data(&mut metadata)?.unwrap_or_default();

        let spec = v1alpha1::VCDClusterSpec {
            org: hub.spec.org.clone(),
            ovdc: hub.spec.ovdc.clone(),
            edge_gateway: hub.spec.edge_gateway.clone(),
            network_cidr: hub.spec.network.cidr.clone(),
            control_plane_endpoint: hub.spec.control_plane_endpoint.clone(),
            use_as_management_cluster: kept.use_as_management_cluster,
        };

        let status = hub.status.as_ref().map(|s| v1alpha1::VCDClusterStatus {
            phase: s.phase,
            ready: s.ready,
            gateway_id: s.gateway_id.clone(),
            network_id: s.network_id.clone(),
            load_balancer_pool_id: s.load_balancer_pool_id.clone(),
            control_plane_endpoint: s.control_plane_endpoint.clone(),
            conditions: s.conditions.clone(),
        });

        let hub_status = hub.status.clone().unwrap_or_default();
        put_conversion_data(
            &mut metadata,
            &ClusterHubData {
                dns_servers: hub.spec.network.dns_servers.clone(),
                vip_subnet: hub.spec.load_balancer.vip_subnet.clone(),
                load_balancer_port: hub.spec.load_balancer.port,
                vapp_id: hub_status.vapp_id,
                observed_generation: hub_status.observed_generation,
                provisioning_started_at: hub_status.provisioning_started_at,
                failure_reason: hub_status.failure_reason,
                failure_message: hub_status.failure_message,
            },
        )?;

        Ok(v1alpha1::VCDCluster {
            metadata,
            spec,
            status,
        })
    }
}

// ── VCDMachine ──────────────────────────────────────────────────────────────

/// v1alpha1-only machine fields, kept on the hub object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineAlphaData {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    enable_nvidia_gpu: bool,
    /// Original size when it is not a whole number of GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    disk_size_mb: Option<i64>,
}

/// Hub-only machine fields, kept on the v1alpha1 object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineHubData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    placement_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    storage_profile: Option<String>,
    /// Full addresses when some are not plain internal IPs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vm_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    power_on_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioning_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

const MB_PER_GB: i64 = 1024;

/// Whole GiB, rounded up
fn mb_to_gb(mb: i64) -> i64 {
    mb.div_euclid(MB_PER_GB) + i64::from(mb.rem_euclid(MB_PER_GB) != 0)
}

fn gb_to_mb(gb: i64) -> Result<i64> {
    gb.checked_mul(MB_PER_GB)
        .ok_or_else(|| Error::ConversionError(format!("diskSizeGb {gb} is too large to express in MB")))
}

impl Convertible<v1beta1::VCDMachine> for v1alpha1::VCDMachine {
    fn to_hub(&self) -> Result<v1beta1::VCDMachine> {
        let mut metadata = self.metadata.clone();
        let kept: MachineHubData = take_conversion_data(&mut metadata)?.unwrap_or_default();

        let spec = v1beta1::VCDMachineSpec {
            cluster_name: self.spec.cluster_name.clone(),
            template: v1beta1::TemplateRef {
                catalog: self.spec.catalog.clone(),
                name: self.spec.template.clone(),
            },
            sizing_policy: self.spec.compute_policy.clone(),
            placement_policy: kept.placement_policy.clone(),
            storage_profile: kept.storage_profile.clone(),
            disk_size_gb: self.spec.disk_size_mb.map(mb_to_gb),
            bootstrap: v1beta1::Bootstrap {
                data_secret_name: self.spec.bootstrap_data_secret.clone(),
            },
            control_plane: self.spec.control_plane,
        };

        let status = self.status.as_ref().map(|s| {
            let plain: Vec<&str> = kept.addresses.iter().map(|a| a.address.as_str()).collect();
            let addresses = if !kept.addresses.is_empty() && plain == s.addresses {
                kept.addresses.clone()
            } else {
                s.addresses
                    .iter()
                    .map(|a| MachineAddress::internal_ip(a.as_str()))
                    .collect()
            };
            v1beta1::VCDMachineStatus {
                phase: s.phase,
                ready: s.ready,
                provider_id: s.provider_id.clone(),
                addresses,
                vm_id: kept.vm_id.clone(),
                power_on_requested: kept.power_on_requested,
                conditions: s.conditions.clone(),
                observed_generation: kept.observed_generation,
                provisioning_started_at: kept.provisioning_started_at.clone(),
                failure_reason: kept.failure_reason.clone(),
                failure_message: kept.failure_message.clone(),
            }
        });

        let disk_size_mb = self
            .spec
            .disk_size_mb
            .filter(|mb| mb.rem_euclid(MB_PER_GB) != 0);
        put_conversion_data(
            &mut metadata,
            &MachineAlphaData {
                enable_nvidia_gpu: self.spec.enable_nvidia_gpu,
                disk_size_mb,
            },
        )?;

        Ok(v1beta1::VCDMachine {
            metadata,
            spec,
            status,
        })
    }

    fn from_hub(hub: &v1beta1::VCDMachine) -> Result<Self> {
        let mut metadata = hub.metadata.clone();
        let kept: MachineAlphaData = take_conversion_data(&mut metadata)?.unwrap_or_default();

        // The preserved size only applies while the hub value still matches it
        let disk_size_mb = match (kept.disk_size_mb, hub.spec.disk_size_gb) {
            (Some(mb), Some(gb)) if mb_to_gb(mb) == gb => Some(mb),
            (_, gb) => gb.map(gb_to_mb).transpose()?,
        };

        let spec = v1alpha1::VCDMachineSpec {
            cluster_name: hub.spec.cluster_name.clone(),
            catalog: hub.spec.template.catalog.clone(),
            template: hub.spec.template.name.clone(),
            compute_policy: hub.spec.sizing_policy.clone(),
            disk_size_mb,
            bootstrap_data_secret: hub.spec.bootstrap.data_secret_name.clone(),
            control_plane: hub.spec.control_plane,
            enable_nvidia_gpu: kept.enable_nvidia_gpu,
        };

        let status = hub.status.as_ref().map(|s| v1alpha1::VCDMachineStatus {
            phase: s.phase,
            ready: s.ready,
            provider_id: s.provider_id.clone(),
            addresses: s.addresses.iter().map(|a| a.address.clone()).collect(),
            conditions: s.conditions.clone(),
        });

        let hub_status = hub.status.clone().unwrap_or_default();
        let addresses = if hub_status
            .addresses
            .iter()
            .all(|a| a.type_ == MachineAddress::internal_ip("").type_)
        {
            Vec::new()
        } else {
            hub_status.addresses.clone()
        };
        put_conversion_data(
            &mut metadata,
            &MachineHubData {
                placement_policy: hub.spec.placement_policy.clone(),
                storage_profile: hub.spec.storage_profile.clone(),
                addresses,
                vm_id: hub_status.vm_id,
                power_on_requested: hub_status.power_on_requested,
                observed_generation: hub_status.observed_generation,
                provisioning_started_at: hub_status.provisioning_started_at,
                failure_reason: hub_status.failure_reason,
                failure_message: hub_status.failure_message,
            },
        )?;

        Ok(v1alpha1::VCDMachine {
            metadata,
            spec,
            status,
        })
    }
}

// ── Dynamic objects ─────────────────────────────────────────────────────────

fn api_version(version: &str) -> String {
    format!("{API_GROUP}/{version}")
}

/// Convert a raw `VCDCluster` or `VCDMachine` object to `desired_api_version`
///
/// Objects already at the desired version are returned untouched.
pub fn convert_object(object: Value, desired_api_version: &str) -> Result<Value> {
    let current = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ConversionError("object has no apiVersion".to_string()))?
        .to_string();
    if current == desired_api_version {
        return Ok(object);
    }

    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match kind.as_str() {
        "VCDCluster" => convert_via_hub::<v1alpha1::VCDCluster, v1beta1::VCDCluster>(
            object,
            &current,
            desired_api_version,
        ),
        "VCDMachine" => convert_via_hub::<v1alpha1::VCDMachine, v1beta1::VCDMachine>(
            object,
            &current,
            desired_api_version,
        ),
        other => Err(Error::ConversionError(format!(
            "unsupported kind '{other}'"
        ))),
    }
}

fn convert_via_hub<Old, Hub>(object: Value, from: &str, to: &str) -> Result<Value>
where
    Old: Convertible<Hub> + Serialize + DeserializeOwned,
    Hub: Serialize + DeserializeOwned,
{
    let hub: Hub = if from == api_version(HUB_VERSION) {
        serde_json::from_value(object)?
    } else if from == api_version(V1ALPHA1) {
        serde_json::from_value::<Old>(object)?.to_hub()?
    } else {
        return Err(Error::ConversionError(format!(
            "unsupported source version '{from}'"
        )));
    };

    if to == api_version(HUB_VERSION) {
        Ok(serde_json::to_value(hub)?)
    } else if to == api_version(V1ALPHA1) {
        Ok(serde_json::to_value(Old::from_hub(&hub)?)?)
    } else {
        Err(Error::ConversionError(format!(
            "unsupported target version '{to}'"
        )))
    }
}
