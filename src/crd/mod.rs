//! Custom Resource Definitions for the Cloud Director infrastructure provider
//!
//! `v1beta1` is the hub and storage version; `v1alpha1` is still served and
//! converted through the hub by the conversion webhook.

pub mod conversion;
mod types;
pub mod v1alpha1;
pub mod v1beta1;


pub use conversion::{convert_object, Convertible, HUB_VERSION};
pub use types::*;
pub use v1beta1::{
    describe_errors, Bootstrap, ClusterNetwork, LoadBalancerSpec, SpecValidationError, TemplateRef,
    VCDCluster, VCDClusterSpec, VCDClusterStatus, VCDMachine, VCDMachineSpec, VCDMachineStatus,
};
