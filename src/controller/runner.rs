//! Controller wiring for VCDCluster and VCDMachine
//!
//! Both controllers share one `InfraAdapter` and one requeue policy. The
//! cluster controller is re-triggered by machine changes (deletion is
//! gated on machine count) and the machine controller by cluster changes
//! (machines wait on the cluster's network and vApp).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn, Span};

use super::backoff::RequeueBackoff;
use super::cluster::{reconcile_cluster, ClusterContext};
use super::finalizers::{add_finalizer, has_finalizer, is_being_deleted, remove_finalizer};
use super::index::MachineIndex;
use super::lifecycle::{Next, Outcome};
use super::machine::{reconcile_machine, MachineContext};
use super::FIELD_MANAGER;
use crate::config::ReconcileConfig;
use crate::crd::{
    ClusterPhase, MachinePhase, VCDCluster, VCDMachine, API_GROUP, CLUSTER_FINALIZER,
    HUB_VERSION, MACHINE_FINALIZER,
};
use crate::error::{Error, Result};
use crate::vcd::{InfraAdapter, KeyedLocks};

const CLUSTER_CONTROLLER: &str = "vcdcluster";
const MACHINE_CONTROLLER: &str = "vcdmachine";

/// Key in the bootstrap Secret holding cloud-init data
const BOOTSTRAP_DATA_KEY: &str = "value";

/// Shared state for both controllers
pub struct ControllerState {
    pub client: Client,
    pub adapter: Arc<InfraAdapter>,
    pub machines: Arc<dyn MachineIndex>,
    pub config: ReconcileConfig,
    pub backoff: RequeueBackoff,
    /// One reconcile at a time per object, across both watch triggers
    pub in_flight: KeyedLocks,
    /// Last phase reported to the machine gauge, per machine
    pub machine_phases: Mutex<HashMap<String, MachinePhase>>,
}

impl ControllerState {
    pub fn new(
        client: Client,
        adapter: Arc<InfraAdapter>,
        machines: Arc<dyn MachineIndex>,
        config: ReconcileConfig,
    ) -> Self {
        let backoff = RequeueBackoff::new(config.requeue_floor(), config.requeue_ceiling());
        Self {
            client,
            adapter,
            machines,
            config,
            backoff,
            in_flight: KeyedLocks::new(),
            machine_phases: Mutex::new(HashMap::new()),
        }
    }
}

fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}/{}", K::kind(&()), obj.namespace().unwrap_or_default(), obj.name_any())
}

fn live_keys(clusters: &Store<VCDCluster>, machines: &Store<VCDMachine>) -> HashSet<String> {
    clusters
        .state()
        .iter()
        .map(|c| object_key(c.as_ref()))
        .chain(machines.state().iter().map(|m| object_key(m.as_ref())))
        .collect()
}

/// Drop requeue and gauge bookkeeping for objects that are gone
fn forget_departed(
    backoff: &RequeueBackoff,
    machine_phases: &Mutex<HashMap<String, MachinePhase>>,
    live: &HashSet<String>,
) {
    backoff.retain(|key| live.contains(key));
    let departed: Vec<String> = machine_phases
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .filter(|key| !live.contains(*key))
        .cloned()
        .collect();
    for key in departed {
        debug!(object = %key, "Forgetting departed VCDMachine");
        track_machine_phase(machine_phases, &key, None);
    }
}

/// Main entry point: run both controllers until a shutdown signal
///
/// `ready` is raised once the machine cache has synced.
pub async fn run_controllers(
    client: Client,
    adapter: Arc<InfraAdapter>,
    config: ReconcileConfig,
    ready: Arc<AtomicBool>,
) -> Result<()> {
    let clusters: Api<VCDCluster> = Api::all(client.clone());
    let machines: Api<VCDMachine> = Api::all(client.clone());

    info!("Starting VCDCluster and VCDMachine controllers");

    // Verify CRDs exist
    for (kind, listed) in [
        ("VCDCluster", clusters.list(&Default::default()).await.map(|_| ())),
        ("VCDMachine", machines.list(&Default::default()).await.map(|_| ())),
    ] {
        if let Err(e) = listed {
            error!("{kind} CRD not found. Please install the CRDs first: {:?}", e);
            return Err(Error::ConfigError(format!("{kind} CRD not installed")));
        }
        info!("{kind} CRD is available");
    }

    let (store, writer) = reflector::store::<VCDMachine>();
    let machine_cache = reflector::reflector(writer, watcher(machines.clone(), watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!("VCDMachine cache watch error: {e}");
            }
        });

    let state = Arc::new(ControllerState::new(
        client.clone(),
        adapter,
        Arc::new(store.clone()),
        config.clone(),
    ));
    let controller_config = controller::Config::default().concurrency(config.concurrency);

    let cluster_controller = Controller::new(clusters.clone(), watcher::Config::default());
    let cluster_store = cluster_controller.store();
    let cluster_controller = cluster_controller
        .with_config(controller_config.clone())
        .watches(machines.clone(), watcher::Config::default(), |machine: VCDMachine| {
            let namespace = machine.namespace()?;
            Some(ObjectRef::<VCDCluster>::new(&machine.spec.cluster_name).within(&namespace))
        })
        .shutdown_on_signal()
        .run(reconcile_cluster_object, cluster_error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled VCDCluster {}", obj.name),
                Err(e) => debug!("VCDCluster reconcile error: {e}"),
            }
        });

    let index = store.clone();
    let machine_controller = Controller::new(machines, watcher::Config::default())
        .with_config(controller_config)
        .watches(clusters, watcher::Config::default(), move |cluster: VCDCluster| {
            let namespace = cluster.namespace().unwrap_or_default();
            index.machines_for(&namespace, &cluster.name_any())
        })
        .shutdown_on_signal()
        .run(reconcile_machine_object, machine_error_policy, state.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled VCDMachine {}", obj.name),
                Err(e) => debug!("VCDMachine reconcile error: {e}"),
            }
        });

    // Deleted objects are never reconciled again, so their entries are swept here
    let sweep = {
        let machine_store = store.clone();
        let mut interval = tokio::time::interval(config.resync());
        async move {
            loop {
                interval.tick().await;
                let live = live_keys(&cluster_store, &machine_store);
                forget_departed(&state.backoff, &state.machine_phases, &live);
            }
        }
    };

    let controllers = async {
        // Cluster teardown counts machines from the cache; never act on a cold one
        if store.wait_until_ready().await.is_err() {
            error!("VCDMachine cache stopped before its first sync");
            return;
        }
        info!("VCDMachine cache synced");
        ready.store(true, Ordering::Relaxed);
        futures::join!(cluster_controller, machine_controller);
    };

    tokio::select! {
        _ = machine_cache => warn!("VCDMachine cache watch ended"),
        _ = controllers => info!("Controllers shut down"),
        _ = sweep => {}
    }
    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event<K>(client: &Client, obj: &K, event_type: &str, reason: &str, message: &str) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", obj.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: obj.object_ref(&()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Announce a phase change; event failures are logged, never fatal
async fn announce_phase<K>(client: &Client, obj: &K, failed: bool, phase: &str, detail: Option<&str>)
where
    K: Resource<DynamicType = ()>,
{
    let (event_type, message) = if failed {
        ("Warning", format!("Phase changed to {phase}: {}", detail.unwrap_or("unknown error")))
    } else {
        ("Normal", format!("Phase changed to {phase}"))
    };
    if let Err(e) = emit_event(client, obj, event_type, phase, &message).await {
        warn!("Failed to emit event: {e}");
    }
}

/// Server-side apply of the status subresource
///
/// Apply with force so cleared optional fields are removed rather than left behind.
async fn patch_status<K, S>(api: &Api<K>, obj: &K, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let patch = json!({
        "apiVersion": format!("{API_GROUP}/{HUB_VERSION}"),
        "kind": K::kind(&()),
        "status": status,
    });
    api.patch_status(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&patch),
    )
    .await?;
    Ok(())
}

fn to_action(ctx: &ControllerState, key: &str, generation: Option<i64>, next: Next) -> Action {
    match next {
        Next::Resync => {
            ctx.backoff.reset(key);
            Action::requeue(ctx.config.resync())
        }
        Next::Poll => Action::requeue(ctx.backoff.next_poll(key, generation)),
        Next::AwaitChange => {
            ctx.backoff.reset(key);
            Action::await_change()
        }
        Next::After(delay) => Action::requeue(delay),
    }
}

#[allow(unused_variables)]
fn record_duration(controller: &str, started: Instant) {
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(controller, started.elapsed().as_secs_f64());
}

#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile_cluster_object(cluster: Arc<VCDCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let key = object_key(cluster.as_ref());
    let _gate = ctx.in_flight.lock(&key).await;
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<VCDCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    if is_being_deleted(cluster.as_ref()) && !has_finalizer(cluster.as_ref(), CLUSTER_FINALIZER) {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    if !is_being_deleted(cluster.as_ref()) && !has_finalizer(cluster.as_ref(), CLUSTER_FINALIZER) {
        // The patch re-triggers this object; external calls start on that pass
        add_finalizer(&api, cluster.as_ref(), CLUSTER_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let machines = ctx.machines.count_for(&namespace, &cluster.name_any());
    let outcome = reconcile_cluster(
        &cluster,
        ClusterContext {
            adapter: &ctx.adapter,
            config: &ctx.config,
            now: Utc::now(),
            machines,
        },
    )
    .await?;
    let Outcome {
        status,
        next,
        release_finalizer,
    } = outcome;

    let previous = cluster.status.clone().unwrap_or_default();
    if previous != status {
        patch_status(&api, cluster.as_ref(), &status).await?;
    }
    if previous.phase != status.phase {
        info!(from = ?previous.phase, to = ?status.phase, "VCDCluster phase changed");
        announce_phase(
            &ctx.client,
            cluster.as_ref(),
            status.phase == ClusterPhase::Failed,
            &format!("{:?}", status.phase),
            status.failure_message.as_deref(),
        )
        .await;
    }

    if release_finalizer {
        remove_finalizer(&api, cluster.as_ref(), CLUSTER_FINALIZER).await?;
        ctx.backoff.reset(&key);
        record_duration(CLUSTER_CONTROLLER, started);
        return Ok(Action::await_change());
    }

    record_duration(CLUSTER_CONTROLLER, started);
    Ok(to_action(&ctx, &key, cluster.metadata.generation, next))
}

/// Read the bootstrap Secret; `None` until the bootstrap provider writes it
async fn bootstrap_data(client: &Client, machine: &VCDMachine) -> Result<Option<String>> {
    let Some(secret_name) = machine.spec.bootstrap.data_secret_name.as_deref() else {
        return Ok(None);
    };
    let namespace = machine.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let Some(secret) = secrets.get_opt(secret_name).await? else {
        debug!(secret = secret_name, "Bootstrap secret not found yet");
        return Ok(None);
    };
    let Some(raw) = secret
        .data
        .as_ref()
        .and_then(|data| data.get(BOOTSTRAP_DATA_KEY))
    else {
        return Ok(None);
    };
    match String::from_utf8(raw.0.clone()) {
        Ok(data) => Ok(Some(data)),
        Err(_) => {
            warn!(secret = secret_name, "Bootstrap data is not UTF-8");
            Ok(None)
        }
    }
}

#[allow(unused_variables)]
fn track_machine_phase(
    machine_phases: &Mutex<HashMap<String, MachinePhase>>,
    key: &str,
    phase: Option<MachinePhase>,
) {
    let previous = {
        let mut phases = machine_phases.lock().unwrap_or_else(PoisonError::into_inner);
        match phase {
            Some(phase) => phases.insert(key.to_string(), phase),
            None => phases.remove(key),
        }
    };
    #[cfg(feature = "metrics")]
    match (previous, phase) {
        (previous, Some(current)) => {
            super::metrics::record_machine_phase(previous.map(|p| p.as_str()), current.as_str())
        }
        (Some(previous), None) => super::metrics::forget_machine_phase(previous.as_str()),
        (None, None) => {}
    }
}

#[instrument(
    skip(machine, ctx),
    fields(name = %machine.name_any(), namespace = machine.namespace(), cluster = tracing::field::Empty)
)]
async fn reconcile_machine_object(machine: Arc<VCDMachine>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let key = object_key(machine.as_ref());
    let _gate = ctx.in_flight.lock(&key).await;
    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<VCDMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    if is_being_deleted(machine.as_ref()) && !has_finalizer(machine.as_ref(), MACHINE_FINALIZER) {
        track_machine_phase(&ctx.machine_phases, &key, None);
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    if !is_being_deleted(machine.as_ref()) && !has_finalizer(machine.as_ref(), MACHINE_FINALIZER) {
        add_finalizer(&api, machine.as_ref(), MACHINE_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let clusters: Api<VCDCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = clusters.get_opt(&machine.spec.cluster_name).await?;
    let bootstrap = bootstrap_data(&ctx.client, &machine).await?;
    Span::current().record("cluster", machine.spec.cluster_name.as_str());

    let outcome = reconcile_machine(
        &machine,
        MachineContext {
            adapter: &ctx.adapter,
            config: &ctx.config,
            now: Utc::now(),
            cluster: cluster.as_ref(),
            bootstrap_data: bootstrap.as_deref(),
        },
    )
    .await?;
    let Outcome {
        status,
        next,
        release_finalizer,
    } = outcome;

    let previous = machine.status.clone().unwrap_or_default();
    if previous != status {
        patch_status(&api, machine.as_ref(), &status).await?;
    }
    if previous.phase != status.phase {
        info!(from = previous.phase.as_str(), to = status.phase.as_str(), "VCDMachine phase changed");
        announce_phase(
            &ctx.client,
            machine.as_ref(),
            status.phase == MachinePhase::Failed,
            status.phase.as_str(),
            status.failure_message.as_deref(),
        )
        .await;
    }

    if release_finalizer {
        remove_finalizer(&api, machine.as_ref(), MACHINE_FINALIZER).await?;
        track_machine_phase(&ctx.machine_phases, &key, None);
        ctx.backoff.reset(&key);
        record_duration(MACHINE_CONTROLLER, started);
        return Ok(Action::await_change());
    }

    track_machine_phase(&ctx.machine_phases, &key, Some(status.phase));
    record_duration(MACHINE_CONTROLLER, started);
    Ok(to_action(&ctx, &key, machine.metadata.generation, next))
}

fn requeue_after_error<K: Resource<DynamicType = ()>>(controller: &str, obj: &K, error: &Error, ctx: &ControllerState) -> Action {
    let key = object_key(obj);
    let generation = obj.meta().generation;
    let class = error.class();

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(controller, class.as_str());

    let delay = match class {
        crate::error::ErrorClass::Conflict => ctx.backoff.next_conflict(&key, generation),
        _ => ctx.backoff.next_failure(&key, generation),
    };
    warn!(
        controller,
        object = %key,
        class = class.as_str(),
        retry_in = ?delay,
        "Reconcile failed: {error}"
    );
    Action::requeue(delay)
}

fn cluster_error_policy(cluster: Arc<VCDCluster>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    requeue_after_error(CLUSTER_CONTROLLER, cluster.as_ref(), error, &ctx)
}

fn machine_error_policy(machine: Arc<VCDMachine>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    requeue_after_error(MACHINE_CONTROLLER, machine.as_ref(), error, &ctx)
}
