//! VCDMachine reconciliation
//!
//! A machine becomes a VM in its cluster's vApp: created from the
//! template, customized once with the bootstrap data, powered on once.
//! Control-plane machines additionally join the cluster's API load
//! balancer pool.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::cluster::load_balancer_name;
use super::conditions::{
    machine_ready_dependencies, mark_false, mark_true, remove_condition, set_summary,
    BOOTSTRAP_DATA_READY, LOAD_BALANCER_MEMBER_READY, VM_PROVISIONED,
};
use super::finalizers::{has_finalizer, is_being_deleted};
use super::lifecycle::{
    failed, failed_with, provisioning_step, retry_cooldown, step, waiting, LifecycleStatus, Next,
    Outcome, Step, REASON_PROVISIONING_TIMEOUT,
};
use crate::config::ReconcileConfig;
use crate::crd::{
    describe_errors, Condition, ConditionSeverity, MachineAddress, MachinePhase, VCDCluster,
    VCDMachine, VCDMachineStatus, DEFAULT_API_SERVER_PORT, MACHINE_FINALIZER,
};
use crate::error::{Error, ErrorClass, Result};
use crate::vcd::naming::{computer_name, external_name, owner_key};
use crate::vcd::types::VmRequest;
use crate::vcd::{
    ExternalObject, InfraAdapter, Operation, Progress, ResourceKind, ResourceRequest, ResourceSpec,
};

pub const PROVIDER_ID_PREFIX: &str = "vmware-cloud-director://";
pub const REASON_VM_NOT_FOUND: &str = "VMNotFound";

/// Inputs to one VCDMachine pass besides the object itself
pub struct MachineContext<'a> {
    pub adapter: &'a InfraAdapter,
    pub config: &'a ReconcileConfig,
    pub now: DateTime<Utc>,
    /// The owning VCDCluster, if it exists yet
    pub cluster: Option<&'a VCDCluster>,
    /// Decoded bootstrap secret, once the bootstrap provider has written it
    pub bootstrap_data: Option<&'a str>,
}

impl LifecycleStatus for VCDMachineStatus {
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
        if !self.phase.can_transition_to(MachinePhase::Failed) {
            warn!(phase = self.phase.as_str(), reason, "Not moving machine to Failed");
            return;
        }
        self.phase = MachinePhase::Failed;
        self.failure_reason = Some(reason.to_string());
        self.failure_message = Some(message.to_string());
    }
}

pub fn vm_name(namespace: &str, machine: &str) -> String {
    external_name(namespace, machine, None)
}

pub fn provider_id(vm_id: &str) -> String {
    format!("{PROVIDER_ID_PREFIX}{vm_id}")
}

fn set_phase(status: &mut VCDMachineStatus, next: MachinePhase) {
    if status.phase == next {
        return;
    }
    if status.phase.can_transition_to(next) {
        debug!(from = status.phase.as_str(), to = next.as_str(), "Machine phase change");
        status.phase = next;
    } else {
        warn!(from = status.phase.as_str(), to = next.as_str(), "Refusing backwards phase change");
    }
}

#[instrument(skip(machine, ctx), fields(name = %machine.name_any(), namespace = machine.namespace()))]
pub async fn reconcile_machine(
    machine: &VCDMachine,
    ctx: MachineContext<'_>,
) -> Result<Outcome<VCDMachineStatus>> {
    let status = machine.status.clone().unwrap_or_default();
    if is_being_deleted(machine) {
        return delete_machine(machine, status, &ctx).await;
    }
    apply_machine(machine, status, &ctx).await
}

async fn apply_machine(
    machine: &VCDMachine,
    mut status: VCDMachineStatus,
    ctx: &MachineContext<'_>,
) -> Result<Outcome<VCDMachineStatus>> {
    let deps = machine_ready_dependencies(machine.spec.control_plane);
    let generation = machine.metadata.generation;
    if !machine.spec.control_plane {
        remove_condition(&mut status.conditions, LOAD_BALANCER_MEMBER_READY);
    }

    if status.phase == MachinePhase::Failed {
        if status.failure_reason.as_deref() == Some(REASON_VM_NOT_FOUND) {
            // The provider ID still names the lost VM; only replacing the machine recovers
            status.observed_generation = generation;
            return Ok(Outcome::new(status, Next::AwaitChange));
        }
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
        info!("Retrying failed VCDMachine");
        status.phase = MachinePhase::Provisioning;
        status.failure_reason = None;
        status.failure_message = None;
        status.power_on_requested = false;
        status.provisioning_started_at = Some(ctx.now.to_rfc3339());
    }
    status.observed_generation = generation;

    let mut spec = machine.spec.clone();
    spec.apply_defaults();
    if let Err(errors) = spec.validate() {
        if status.phase == MachinePhase::Pending {
            set_phase(&mut status, MachinePhase::Provisioning);
            status.provisioning_started_at = Some(ctx.now.to_rfc3339());
        }
        let error = Error::ValidationError(describe_errors(&errors));
        return Ok(failed_with(status, deps, VM_PROVISIONED, &error, ctx.config));
    }

    let Some(cluster) = ctx.cluster else {
        return Ok(waiting(
            status,
            deps,
            VM_PROVISIONED,
            "WaitingForCluster",
            format!("VCDCluster '{}' does not exist", spec.cluster_name),
            ctx.now,
            ctx.config,
        ));
    };
    let cluster_status = cluster.status.clone().unwrap_or_default();
    let (Some(vapp_id), Some(network_id)) = (cluster_status.vapp_id, cluster_status.network_id)
    else {
        return Ok(waiting(
            status,
            deps,
            VM_PROVISIONED,
            "WaitingForClusterInfrastructure",
            format!("VCDCluster '{}' has no vApp and network yet", spec.cluster_name),
            ctx.now,
            ctx.config,
        ));
    };

    // Bootstrap data only matters until the guest has been customized and started
    if ctx.bootstrap_data.is_none() && !status.power_on_requested {
        return Ok(waiting(
            status,
            deps,
            BOOTSTRAP_DATA_READY,
            "WaitingForBootstrapData",
            "bootstrap data secret is not available yet".to_string(),
            ctx.now,
            ctx.config,
        ));
    }
    mark_true(&mut status.conditions, BOOTSTRAP_DATA_READY);

    // Inputs are in place; from here on the provisioning deadline runs
    if status.phase == MachinePhase::Pending {
        set_phase(&mut status, MachinePhase::Provisioning);
        status.provisioning_started_at = Some(ctx.now.to_rfc3339());
    }

    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    let owner = owner_key(&namespace, &name);
    let vm_name = vm_name(&namespace, &name);

    // A VM this machine already had is never replaced behind its provider ID
    if let Some(vm_id) = status.vm_id.clone() {
        let lookup = ctx.adapter.observe(ResourceKind::Vm, &vm_name).await.map(Progress::Ready);
        match provisioning_step(&status, lookup)? {
            Step::Done(Some(_)) => {}
            Step::Done(None) => {
                warn!(vm = %vm_name, vm_id = %vm_id, "VM disappeared from the platform");
                let message = format!("VM '{vm_name}' ({vm_id}) no longer exists on the platform");
                return Ok(failed(
                    status,
                    deps,
                    VM_PROVISIONED,
                    REASON_VM_NOT_FOUND,
                    &message,
                    ErrorClass::Terminal,
                    ctx.config,
                ));
            }
            Step::Waiting(what) => {
                return Ok(waiting(status, deps, VM_PROVISIONED, "VMLookup", what, ctx.now, ctx.config));
            }
            Step::Failed(e) => return Ok(failed_with(status, deps, VM_PROVISIONED, &e, ctx.config)),
        }
    }

    let request = ResourceRequest {
        owner: owner.clone(),
        spec: ResourceSpec::Vm(VmRequest {
            name: vm_name.clone(),
            vapp_id,
            network_id,
            catalog: spec.template.catalog.clone(),
            template: spec.template.name.clone(),
            sizing_policy: spec.sizing_policy.clone(),
            placement_policy: spec.placement_policy.clone(),
            storage_profile: spec.storage_profile.clone(),
            disk_size_gb: spec.disk_size_gb,
        }),
    };
    let mut vm = match provisioning_step(&status, ctx.adapter.ensure_created(&request).await)? {
        Step::Done(vm) => vm,
        Step::Waiting(what) => {
            return Ok(waiting(status, deps, VM_PROVISIONED, "VMProvisioning", what, ctx.now, ctx.config));
        }
        Step::Failed(e) => return Ok(failed_with(status, deps, VM_PROVISIONED, &e, ctx.config)),
    };
    status.vm_id = Some(vm.id.clone());

    if !vm.guest_customized && !vm.is_powered_on() {
        let Some(bootstrap_data) = ctx.bootstrap_data else {
            return Ok(waiting(
                status,
                deps,
                BOOTSTRAP_DATA_READY,
                "WaitingForBootstrapData",
                format!("VM '{vm_name}' cannot be customized without bootstrap data"),
                ctx.now,
                ctx.config,
            ));
        };
        let user_data = STANDARD.encode(bootstrap_data);
        let customize = Operation::Customize {
            computer_name: computer_name(&name),
            user_data,
        };
        let result = ctx
            .adapter
            .ensure_state(ResourceKind::Vm, &vm_name, &owner, |observed| {
                (!observed.guest_customized && !observed.is_powered_on()).then_some(customize)
            })
            .await;
        vm = match provisioning_step(&status, result)? {
            Step::Done(vm) => vm,
            Step::Waiting(what) => {
                return Ok(waiting(status, deps, VM_PROVISIONED, "Customizing", what, ctx.now, ctx.config));
            }
            Step::Failed(e) => return Ok(failed_with(status, deps, VM_PROVISIONED, &e, ctx.config)),
        };
    }

    if !vm.is_powered_on() {
        if status.power_on_requested {
            // Issued once; a VM that stays off afterwards is left to the operator
            return Ok(waiting(
                status,
                deps,
                VM_PROVISIONED,
                "PoweringOn",
                format!("VM '{vm_name}' is not powered on yet"),
                ctx.now,
                ctx.config,
            ));
        }
        status.power_on_requested = true;
        let result = ctx
            .adapter
            .ensure_state(ResourceKind::Vm, &vm_name, &owner, |observed| {
                (!observed.is_powered_on()).then_some(Operation::PowerOn)
            })
            .await;
        vm = match provisioning_step(&status, result)? {
            Step::Done(vm) => vm,
            Step::Waiting(what) => {
                return Ok(waiting(status, deps, VM_PROVISIONED, "PoweringOn", what, ctx.now, ctx.config));
            }
            Step::Failed(e) => return Ok(failed_with(status, deps, VM_PROVISIONED, &e, ctx.config)),
        };
    }

    if vm.ip_addresses.is_empty() {
        return Ok(waiting(
            status,
            deps,
            VM_PROVISIONED,
            "WaitingForAddress",
            format!("VM '{vm_name}' has not reported an address"),
            ctx.now,
            ctx.config,
        ));
    }
    status.addresses = vm
        .ip_addresses
        .iter()
        .map(MachineAddress::internal_ip)
        .collect();
    if status.provider_id.is_none() {
        let id = provider_id(&vm.id);
        info!(provider_id = %id, "VCDMachine provider ID assigned");
        status.provider_id = Some(id);
    }
    mark_true(&mut status.conditions, VM_PROVISIONED);
    if status.phase != MachinePhase::Running {
        info!("VCDMachine running");
    }
    set_phase(&mut status, MachinePhase::Running);
    status.provisioning_started_at = None;

    if spec.control_plane {
        if let Some(next) = join_load_balancer(&mut status, cluster, &vm, ctx).await? {
            status.ready = set_summary(&mut status.conditions, deps);
            return Ok(Outcome::new(status, next));
        }
    }

    status.ready = set_summary(&mut status.conditions, deps);
    Ok(Outcome::new(status, Next::Resync))
}

/// Cluster coordinates shared by pool joins and leaves
fn load_balancer_ref(cluster: &VCDCluster) -> (String, String, i32) {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let port = match cluster.spec.load_balancer.port {
        0 => DEFAULT_API_SERVER_PORT,
        port => port,
    };
    (load_balancer_name(&namespace, &name), owner_key(&namespace, &name), port)
}

/// Add this machine's address to the API pool; `Some` means stop here
///
/// A membership problem never moves a Running machine back; it is
/// reported on the condition and retried.
async fn join_load_balancer(
    status: &mut VCDMachineStatus,
    cluster: &VCDCluster,
    vm: &ExternalObject,
    ctx: &MachineContext<'_>,
) -> Result<Option<Next>> {
    let (lb_name, cluster_owner, port) = load_balancer_ref(cluster);
    let address = vm.ip_addresses[0].clone();

    let result = ctx
        .adapter
        .ensure_state(ResourceKind::LoadBalancer, &lb_name, &cluster_owner, |lb| {
            if lb.members.contains(&address) {
                return None;
            }
            let mut members = lb.members.clone();
            members.push(address.clone());
            members.sort();
            Some(Operation::SetMembers { members, port })
        })
        .await;

    let outcome = match result {
        Err(Error::NotFound { .. }) => Step::Waiting(format!("load balancer '{lb_name}' does not exist yet")),
        other => step(other)?,
    };
    match outcome {
        Step::Done(_) => {
            mark_true(&mut status.conditions, LOAD_BALANCER_MEMBER_READY);
            Ok(None)
        }
        Step::Waiting(what) => {
            mark_false(
                &mut status.conditions,
                LOAD_BALANCER_MEMBER_READY,
                "JoiningLoadBalancer",
                ConditionSeverity::Info,
                what,
            );
            Ok(Some(Next::Poll))
        }
        Step::Failed(e) => {
            warn!(error = %e, "Could not join the API load balancer");
            mark_false(
                &mut status.conditions,
                LOAD_BALANCER_MEMBER_READY,
                e.reason(),
                ConditionSeverity::Error,
                e.to_string(),
            );
            Ok(Some(Next::After(ctx.config.requeue_ceiling())))
        }
    }
}

async fn delete_machine(
    machine: &VCDMachine,
    mut status: VCDMachineStatus,
    ctx: &MachineContext<'_>,
) -> Result<Outcome<VCDMachineStatus>> {
    let deps = machine_ready_dependencies(machine.spec.control_plane);
    if !has_finalizer(machine, MACHINE_FINALIZER) {
        return Ok(Outcome::new(status, Next::AwaitChange));
    }
    set_phase(&mut status, MachinePhase::Deleting);
    status.ready = false;

    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    let owner = owner_key(&namespace, &name);
    let vm_name = vm_name(&namespace, &name);

    let vm = ctx.adapter.observe(ResourceKind::Vm, &vm_name).await?;
    let owned_vm = vm.filter(|vm| vm.owner() == Some(owner.as_str()));

    if machine.spec.control_plane {
        if let (Some(cluster), Some(vm)) = (ctx.cluster, owned_vm.as_ref()) {
            if let Some(next) = leave_load_balancer(&mut status, cluster, vm, ctx).await? {
                status.ready = false;
                return Ok(Outcome::new(status, next));
            }
        }
    }

    if owned_vm.as_ref().is_some_and(|vm| vm.is_powered_on()) {
        let result = ctx
            .adapter
            .ensure_state(ResourceKind::Vm, &vm_name, &owner, |observed| {
                observed.is_powered_on().then_some(Operation::PowerOff)
            })
            .await;
        let outcome = match result {
            Err(Error::NotFound { .. }) => Step::Done(ExternalObject::default()),
            other => step(other)?,
        };
        if let Some(next) = teardown_blocked(&mut status, outcome, ctx) {
            return Ok(Outcome::new(status, next));
        }
    }

    let outcome = step(ctx.adapter.ensure_deleted(ResourceKind::Vm, &vm_name, &owner).await)?;
    if let Some(next) = teardown_blocked(&mut status, outcome, ctx) {
        return Ok(Outcome::new(status, next));
    }

    info!("VCDMachine VM removed");
    status.vm_id = None;
    status.addresses.clear();
    set_summary(&mut status.conditions, deps);
    status.ready = false;
    Ok(Outcome::released(status))
}

fn teardown_blocked<T>(
    status: &mut VCDMachineStatus,
    outcome: Step<T>,
    ctx: &MachineContext<'_>,
) -> Option<Next> {
    match outcome {
        Step::Done(_) => None,
        Step::Waiting(what) => {
            mark_false(&mut status.conditions, VM_PROVISIONED, "Deleting", ConditionSeverity::Info, what);
            Some(Next::Poll)
        }
        Step::Failed(e) => {
            warn!(error = %e, "VM teardown failed");
            mark_false(
                &mut status.conditions,
                VM_PROVISIONED,
                e.reason(),
                ConditionSeverity::Error,
                e.to_string(),
            );
            Some(Next::After(ctx.config.requeue_ceiling()))
        }
    }
}

/// Drop this machine's addresses from the API pool before the VM goes
async fn leave_load_balancer(
    status: &mut VCDMachineStatus,
    cluster: &VCDCluster,
    vm: &ExternalObject,
    ctx: &MachineContext<'_>,
) -> Result<Option<Next>> {
    let (lb_name, cluster_owner, port) = load_balancer_ref(cluster);
    let result = ctx
        .adapter
        .ensure_state(ResourceKind::LoadBalancer, &lb_name, &cluster_owner, |lb| {
            let members: Vec<String> = lb
                .members
                .iter()
                .filter(|m| !vm.ip_addresses.contains(m))
                .cloned()
                .collect();
            (members.len() != lb.members.len()).then_some(Operation::SetMembers { members, port })
        })
        .await;

    let outcome = match result {
        Err(Error::NotFound { .. }) => Step::Done(ExternalObject::default()),
        // The cluster's pool may already be gone or foreign; neither blocks the VM teardown
        Err(e) if e.class() == ErrorClass::Terminal => {
            warn!(error = %e, "Skipping load balancer membership removal");
            Step::Done(ExternalObject::default())
        }
        other => step(other)?,
    };
    match outcome {
        Step::Done(_) => {
            remove_condition(&mut status.conditions, LOAD_BALANCER_MEMBER_READY);
            Ok(None)
        }
        Step::Waiting(what) => {
            mark_false(
                &mut status.conditions,
                LOAD_BALANCER_MEMBER_READY,
                "LeavingLoadBalancer",
                ConditionSeverity::Info,
                what,
            );
            Ok(Some(Next::Poll))
        }
        Step::Failed(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_format() {
        assert_eq!(
            provider_id("urn:vcloud:vm:42"),
            "vmware-cloud-director://urn:vcloud:vm:42"
        );
    }

    #[test]
    fn test_failure_does_not_regress_deleting() {
        let mut status = VCDMachineStatus {
            phase: MachinePhase::Deleting,
            ..Default::default()
        };
        status.record_failure("TaskFailed", "boom");
        assert_eq!(status.phase, MachinePhase::Deleting);
        assert!(status.failure_reason.is_none());
    }

    #[test]
    fn test_failure_from_running_is_refused() {
        let mut status = VCDMachineStatus {
            phase: MachinePhase::Running,
            ..Default::default()
        };
        status.record_failure("TaskFailed", "boom");
        assert_eq!(status.phase, MachinePhase::Running);
    }
}
