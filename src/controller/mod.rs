//! Controller module for VCDCluster and VCDMachine reconciliation
//!
//! `cluster` and `machine` hold the per-object state machines; `runner`
//! wires them into kube-runtime controllers.

mod backoff;
mod cluster;
pub mod conditions;
mod finalizers;
mod index;
mod lifecycle;
mod machine;
#[cfg(feature = "metrics")]
pub mod metrics;
mod runner;

pub use backoff::{calculate_backoff, RequeueBackoff};
pub use cluster::{load_balancer_name, reconcile_cluster, ClusterContext, ClusterNames};
pub use index::MachineIndex;
pub use lifecycle::{Next, Outcome};
pub use machine::{provider_id, reconcile_machine, vm_name, MachineContext, PROVIDER_ID_PREFIX};
pub use runner::{run_controllers, ControllerState};

/// Field manager for every write this operator makes
pub const FIELD_MANAGER: &str = "capvcd-manager";
