//! VCDCluster reconciliation
//!
//! Brings up, in order: the edge gateway lookup, the routed cluster
//! network, the vApp that will hold the machines, and the load balancer
//! fronting the API server. Each step waits for the previous one and
//! every pass re-observes from the top, so a pass that stops early (task
//! still running, transient error, operator restart) loses nothing.
//!
//! Teardown runs in reverse and only once no VCDMachine references the
//! cluster any more.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::conditions::{
    mark_false, mark_true, set_summary, CLUSTER_READY_DEPENDENCIES, CONTROL_PLANE_ENDPOINT_READY,
    INFRASTRUCTURE_READY,
};
use super::finalizers::{has_finalizer, is_being_deleted};
use super::lifecycle::{
    failed, failed_with, provisioning_step, retry_cooldown, step, waiting, LifecycleStatus,
    Next, Outcome, Step, REASON_PROVISIONING_TIMEOUT,
};
use crate::config::ReconcileConfig;
use crate::crd::{
    describe_errors, ApiEndpoint, ClusterPhase, Condition, ConditionSeverity, VCDCluster,
    VCDClusterSpec, VCDClusterStatus, CLUSTER_FINALIZER,
};
use crate::error::{Error, ErrorClass, Result};
use crate::vcd::naming::{external_name, owner_key};
use crate::vcd::types::{LoadBalancerRequest, NetworkRequest, VAppRequest};
use crate::vcd::{InfraAdapter, ResourceKind, ResourceRequest, ResourceSpec};

/// Inputs to one VCDCluster pass besides the object itself
pub struct ClusterContext<'a> {
    pub adapter: &'a InfraAdapter,
    pub config: &'a ReconcileConfig,
    pub now: DateTime<Utc>,
    /// VCDMachines still referencing this cluster, including ones being deleted
    pub machines: usize,
}

/// Platform names of the objects a cluster owns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNames {
    pub network: String,
    pub vapp: String,
    pub load_balancer: String,
}

impl ClusterNames {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            network: external_name(namespace, name, Some("net")),
            vapp: external_name(namespace, name, None),
            load_balancer: load_balancer_name(namespace, name),
        }
    }
}

/// Name of the API server load balancer; machines need it to join the pool
pub fn load_balancer_name(namespace: &str, cluster: &str) -> String {
    external_name(namespace, cluster, Some("api-lb"))
}

impl LifecycleStatus for VCDClusterStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn provisioning_started_at(&self) -> Option<&str> {
        self.provisioning_started_at.as_deref()
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    fn record_failure(&mut self, reason: &str, message: &str) {
        self.phase = ClusterPhase::Failed;
        self.failure_reason = Some(reason.to_string());
        self.failure_message = Some(message.to_string());
    }
}

/// First usable host of an IPv4 CIDR and its prefix length, e.g. 10.0.0.0/24 -> (10.0.0.1, 24)
fn gateway_address(cidr: &str) -> Option<(String, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    if prefix >= 31 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    let network = u32::from(addr) & mask;
    Some((Ipv4Addr::from(network + 1).to_string(), prefix))
}

#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn reconcile_cluster(
    cluster: &VCDCluster,
    ctx: ClusterContext<'_>,
) -> Result<Outcome<VCDClusterStatus>> {
    let status = cluster.status.clone().unwrap_or_default();
    if is_being_deleted(cluster) {
        return delete_cluster(cluster, status, &ctx).await;
    }
    apply_cluster(cluster, status, &ctx).await
}

async fn apply_cluster(
    cluster: &VCDCluster,
    mut status: VCDClusterStatus,
    ctx: &ClusterContext<'_>,
) -> Result<Outcome<VCDClusterStatus>> {
    let deps = CLUSTER_READY_DEPENDENCIES;
    let generation = cluster.metadata.generation;

    if status.phase == ClusterPhase::Failed {
        let spec_changed = status.observed_generation != generation;
        let timed_out = status.failure_reason.as_deref() == Some(REASON_PROVISIONING_TIMEOUT);
        if !spec_changed {
            if !timed_out {
                return Ok(Outcome::new(status, Next::AwaitChange));
            }
            if let Some(remaining) =
                retry_cooldown(&status.conditions, ctx.now, ctx.config.requeue_ceiling())
            {
                return Ok(Outcome::new(status, Next::After(remaining)));
            }
        }
        info!("Retrying failed VCDCluster");
        status.phase = ClusterPhase::Provisioning;
        status.failure_reason = None;
        status.failure_message = None;
        status.provisioning_started_at = Some(ctx.now.to_rfc3339());
    }
    status.observed_generation = generation;

    let mut spec = cluster.spec.clone();
    spec.apply_defaults();
    if let Err(errors) = spec.validate() {
        let error = Error::ValidationError(describe_errors(&errors));
        return Ok(failed_with(status, deps, INFRASTRUCTURE_READY, &error, ctx.config));
    }

    if status.phase == ClusterPhase::Pending {
        status.phase = ClusterPhase::Provisioning;
        status.provisioning_started_at = Some(ctx.now.to_rfc3339());
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let owner = owner_key(&namespace, &name);
    let names = ClusterNames::new(&namespace, &name);

    // Edge gateway: pre-existing, looked up but never created
    let gateway = match ctx.adapter.observe(ResourceKind::EdgeGateway, &spec.edge_gateway).await {
        Ok(Some(gateway)) => gateway,
        Ok(None) => {
            let message = format!(
                "edge gateway '{}' not found in VDC '{}'",
                spec.edge_gateway, spec.ovdc
            );
            return Ok(failed(
                status,
                deps,
                INFRASTRUCTURE_READY,
                "GatewayNotFound",
                &message,
                ErrorClass::Terminal,
                ctx.config,
            ));
        }
        Err(e) if e.class() == ErrorClass::Terminal => {
            return Ok(failed_with(status, deps, INFRASTRUCTURE_READY, &e, ctx.config));
        }
        Err(e) if e.class() == ErrorClass::Transient && status.provisioning_started_at.is_some() => {
            warn!(error = %e, "Edge gateway lookup failed while provisioning; will retry");
            return Ok(waiting(
                status,
                deps,
                INFRASTRUCTURE_READY,
                "GatewayLookup",
                e.to_string(),
                ctx.now,
                ctx.config,
            ));
        }
        Err(e) => return Err(e),
    };
    status.gateway_id = Some(gateway.id.clone());

    let Some((gateway_ip, prefix_length)) = gateway_address(&spec.network.cidr) else {
        let message = format!("network CIDR '{}' leaves no room for hosts", spec.network.cidr);
        return Ok(failed(
            status,
            deps,
            INFRASTRUCTURE_READY,
            "InvalidSpec",
            &message,
            ErrorClass::Terminal,
            ctx.config,
        ));
    };

    let network_request = ResourceRequest {
        owner: owner.clone(),
        spec: ResourceSpec::Network(NetworkRequest {
            name: names.network.clone(),
            vdc: spec.ovdc.clone(),
            gateway_id: gateway.id.clone(),
            gateway_address: gateway_ip,
            prefix_length,
            dns_servers: spec.network.dns_servers.clone(),
        }),
    };
    let network = match provisioning_step(&status, ctx.adapter.ensure_created(&network_request).await)? {
        Step::Done(network) => network,
        Step::Waiting(what) => {
            return Ok(waiting(status, deps, INFRASTRUCTURE_READY, "NetworkProvisioning", what, ctx.now, ctx.config));
        }
        Step::Failed(e) => return Ok(failed_with(status, deps, INFRASTRUCTURE_READY, &e, ctx.config)),
    };
    status.network_id = Some(network.id.clone());

    let vapp_request = ResourceRequest {
        owner: owner.clone(),
        spec: ResourceSpec::VApp(VAppRequest {
            name: names.vapp.clone(),
            vdc: spec.ovdc.clone(),
            network_id: network.id.clone(),
        }),
    };
    let vapp = match provisioning_step(&status, ctx.adapter.ensure_created(&vapp_request).await)? {
        Step::Done(vapp) => vapp,
        Step::Waiting(what) => {
            return Ok(waiting(status, deps, INFRASTRUCTURE_READY, "VAppProvisioning", what, ctx.now, ctx.config));
        }
        Step::Failed(e) => return Ok(failed_with(status, deps, INFRASTRUCTURE_READY, &e, ctx.config)),
    };
    status.vapp_id = Some(vapp.id.clone());
    mark_true(&mut status.conditions, INFRASTRUCTURE_READY);

    let lb_request = ResourceRequest {
        owner,
        spec: ResourceSpec::LoadBalancer(LoadBalancerRequest {
            name: names.load_balancer.clone(),
            gateway_id: gateway.id.clone(),
            vip_subnet: spec.load_balancer.vip_subnet.clone(),
            virtual_ip: requested_vip(&spec),
            port: spec.load_balancer.port,
        }),
    };
    let lb = match provisioning_step(&status, ctx.adapter.ensure_created(&lb_request).await)? {
        Step::Done(lb) => lb,
        Step::Waiting(what) => {
            return Ok(waiting(
                status,
                deps,
                CONTROL_PLANE_ENDPOINT_READY,
                "LoadBalancerProvisioning",
                what,
                ctx.now,
                ctx.config,
            ));
        }
        Step::Failed(e) => {
            return Ok(failed_with(status, deps, CONTROL_PLANE_ENDPOINT_READY, &e, ctx.config));
        }
    };
    status.load_balancer_pool_id = Some(lb.id.clone());

    let Some(endpoint) = control_plane_endpoint(&spec, lb.virtual_ip.as_deref()) else {
        return Ok(waiting(
            status,
            deps,
            CONTROL_PLANE_ENDPOINT_READY,
            "WaitingForVirtualIP",
            format!("load balancer '{}' has no virtual IP yet", names.load_balancer),
            ctx.now,
            ctx.config,
        ));
    };
    match &status.control_plane_endpoint {
        None => {
            info!(host = %endpoint.host, port = endpoint.port, "Control-plane endpoint assigned");
            status.control_plane_endpoint = Some(endpoint);
        }
        Some(existing) if *existing != endpoint => {
            warn!(
                current = %existing.host,
                observed = %endpoint.host,
                "Load balancer address differs from the published endpoint; keeping the published one"
            );
        }
        Some(_) => {}
    }
    mark_true(&mut status.conditions, CONTROL_PLANE_ENDPOINT_READY);

    if status.phase != ClusterPhase::Provisioned {
        info!("VCDCluster infrastructure provisioned");
    }
    status.phase = ClusterPhase::Provisioned;
    status.provisioning_started_at = None;
    status.ready = set_summary(&mut status.conditions, deps);
    Ok(Outcome::new(status, Next::Resync))
}

fn requested_vip(spec: &VCDClusterSpec) -> Option<String> {
    spec.control_plane_endpoint
        .as_ref()
        .map(|e| e.host.clone())
        .filter(|h| !h.is_empty())
}

/// The user-supplied endpoint wins; otherwise the load balancer's virtual IP
fn control_plane_endpoint(spec: &VCDClusterSpec, vip: Option<&str>) -> Option<ApiEndpoint> {
    if let Some(endpoint) = spec.control_plane_endpoint.as_ref().filter(|e| e.is_set()) {
        return Some(endpoint.clone());
    }
    vip.filter(|v| !v.is_empty()).map(|host| ApiEndpoint {
        host: host.to_string(),
        port: spec.load_balancer.port,
    })
}

async fn delete_cluster(
    cluster: &VCDCluster,
    mut status: VCDClusterStatus,
    ctx: &ClusterContext<'_>,
) -> Result<Outcome<VCDClusterStatus>> {
    let deps = CLUSTER_READY_DEPENDENCIES;
    if !has_finalizer(cluster, CLUSTER_FINALIZER) {
        return Ok(Outcome::new(status, Next::AwaitChange));
    }
    status.phase = ClusterPhase::Deleting;

    if ctx.machines > 0 {
        mark_false(
            &mut status.conditions,
            INFRASTRUCTURE_READY,
            "DeletionBlocked",
            ConditionSeverity::Info,
            format!("{} VCDMachine(s) still reference this cluster", ctx.machines),
        );
        status.ready = set_summary(&mut status.conditions, deps);
        return Ok(Outcome::new(status, Next::Poll));
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let owner = owner_key(&namespace, &name);
    let names = ClusterNames::new(&namespace, &name);

    let teardown = [
        (ResourceKind::LoadBalancer, names.load_balancer, CONTROL_PLANE_ENDPOINT_READY),
        (ResourceKind::VApp, names.vapp, INFRASTRUCTURE_READY),
        (ResourceKind::Network, names.network, INFRASTRUCTURE_READY),
    ];
    for (kind, object_name, condition) in teardown {
        match step(ctx.adapter.ensure_deleted(kind, &object_name, &owner).await)? {
            Step::Done(()) => match kind {
                ResourceKind::LoadBalancer => status.load_balancer_pool_id = None,
                ResourceKind::VApp => status.vapp_id = None,
                ResourceKind::Network => status.network_id = None,
                ResourceKind::EdgeGateway | ResourceKind::Vm => {}
            },
            Step::Waiting(what) => {
                mark_false(&mut status.conditions, condition, "Deleting", ConditionSeverity::Info, what);
                status.ready = set_summary(&mut status.conditions, deps);
                return Ok(Outcome::new(status, Next::Poll));
            }
            Step::Failed(e) => {
                warn!(%kind, name = %object_name, error = %e, "Teardown failed");
                mark_false(
                    &mut status.conditions,
                    condition,
                    e.reason(),
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                status.ready = set_summary(&mut status.conditions, deps);
                return Ok(Outcome::new(status, Next::After(ctx.config.requeue_ceiling())));
            }
        }
    }

    info!("VCDCluster infrastructure removed");
    status.gateway_id = None;
    status.ready = false;
    Ok(Outcome::released(status))
}
