//! CAPVCD: Cluster API infrastructure provider for VMware Cloud Director
//!
//! Reconciles `VCDCluster` and `VCDMachine` resources into Cloud Director
//! networks, vApps, load balancers and virtual machines, and serves the
//! conversion webhook between the `v1alpha1` and `v1beta1` API versions.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;
pub mod vcd;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(feature = "conversion-webhook")]
pub mod webhook;

pub use crate::error::{Error, Result};
