use async_trait::async_trait;

use super::types::{
    ExternalObject, Operation, ResourceKind, ResourceRequest, Submission, Task, TaskHandle,
};
use crate::error::Result;

/// Raw platform surface the adapter is written against
///
/// Implementations perform exactly one request per call and never retry;
/// retry and polling policy belongs to the adapter and the reconcilers.
#[async_trait]
pub trait CloudDirectorApi: Send + Sync {
    /// Look an object up by its exact name
    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<ExternalObject>>;

    async fn create(&self, request: &ResourceRequest) -> Result<Submission>;

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<Submission>;

    async fn act(&self, kind: ResourceKind, id: &str, operation: &Operation) -> Result<Submission>;

    async fn task(&self, handle: &TaskHandle) -> Result<Task>;
}
