//! Cloud Director access: REST client, task polling and the idempotent
//! adapter the reconcilers drive

pub mod adapter;
pub mod api;
pub mod client;
#[cfg(test)]
pub mod fake;
pub mod locks;
pub mod naming;
pub mod tasks;
pub mod types;

pub use adapter::{InfraAdapter, Progress};
pub use api::CloudDirectorApi;
pub use client::VcdClient;
pub use locks::KeyedLocks;
pub use tasks::TaskPoller;
pub use types::{
    EntityState, ExternalObject, Operation, PowerState, ResourceKind, ResourceRequest,
    ResourceSpec, Submission, Task, TaskHandle, TaskStatus, OWNER_METADATA_KEY,
};
