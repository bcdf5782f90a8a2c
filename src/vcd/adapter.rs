//! Idempotent operations over the platform API
//!
//! Every mutating call follows the same shape: take the per-name lock,
//! look the object up by name, act only if observation says it is needed,
//! then follow the resulting task within the call deadline. A task that
//! outlives the deadline is reported as `InProgress`; the caller requeues
//! and the next pass re-derives where things stand from observed state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::CloudDirectorApi;
use super::locks::KeyedLocks;
use super::tasks::TaskPoller;
use super::types::{EntityState, ExternalObject, Operation, ResourceKind, ResourceRequest, Submission};
use crate::config::TaskPollConfig;
use crate::error::{Error, ErrorClass, Result};

/// Result of an adapter call that may still be running on the platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    Ready(T),
    /// Still in flight; the string says what is being waited on
    InProgress(String),
}

impl<T> Progress<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Progress::Ready(_))
    }
}

pub struct InfraAdapter {
    api: Arc<dyn CloudDirectorApi>,
    poller: TaskPoller,
    locks: KeyedLocks,
    call_deadline: Duration,
}

fn lock_key(kind: ResourceKind, name: &str) -> String {
    format!("{kind}/{name}")
}

fn check_owner(kind: ResourceKind, object: &ExternalObject, owner: &str) -> Result<()> {
    if object.owner() == Some(owner) {
        Ok(())
    } else {
        Err(Error::NotOwned {
            kind: kind.to_string(),
            name: object.name.clone(),
            expected: owner.to_string(),
            found: object.owner().map(str::to_string),
        })
    }
}

fn failed(kind: ResourceKind, object: &ExternalObject) -> Error {
    Error::ExternalFailed {
        kind: kind.to_string(),
        name: object.name.clone(),
        message: object
            .error_message
            .clone()
            .unwrap_or_else(|| "object reported a failed state".to_string()),
    }
}

#[allow(unused_variables)]
fn record_task(kind: ResourceKind, outcome: &str) {
    #[cfg(feature = "metrics")]
    crate::controller::metrics::inc_platform_task(kind.as_str(), outcome);
}

impl InfraAdapter {
    pub fn new(api: Arc<dyn CloudDirectorApi>, config: &TaskPollConfig) -> Self {
        Self {
            api,
            poller: TaskPoller::from_config(config),
            locks: KeyedLocks::new(),
            call_deadline: config.call_deadline(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.call_deadline
    }

    /// Plain lookup, no side effects
    pub async fn observe(&self, kind: ResourceKind, name: &str) -> Result<Option<ExternalObject>> {
        self.api.find(kind, name).await
    }

    /// Make sure the requested object exists and is ready
    ///
    /// An existing object is adopted only if it carries this owner's
    /// metadata; anything else is `Error::NotOwned`.
    pub async fn ensure_created(
        &self,
        request: &ResourceRequest,
    ) -> Result<Progress<ExternalObject>> {
        let kind = request.kind();
        let name = request.name();
        let _guard = self.locks.lock(&lock_key(kind, name)).await;
        let deadline = self.deadline();

        if let Some(existing) = self.api.find(kind, name).await? {
            check_owner(kind, &existing, &request.owner)?;
            return self.settled(kind, existing, deadline).await;
        }

        info!(%kind, name, "creating");
        let submission = self.api.create(request).await?;
        if submission == Submission::NotFound {
            return Err(Error::platform(
                404,
                "NOT_FOUND",
                format!("parent of {kind} '{name}' does not exist"),
            ));
        }
        if let Progress::InProgress(what) = self.follow(kind, submission, deadline).await? {
            return Ok(Progress::InProgress(what));
        }

        match self.api.find(kind, name).await? {
            Some(created) => {
                check_owner(kind, &created, &request.owner)?;
                self.settled(kind, created, deadline).await
            }
            None => Ok(Progress::InProgress(format!(
                "waiting for {kind} '{name}' to appear"
            ))),
        }
    }

    /// Make sure the named object is gone
    ///
    /// Objects that do not carry this owner's metadata are left in place.
    pub async fn ensure_deleted(
        &self,
        kind: ResourceKind,
        name: &str,
        owner: &str,
    ) -> Result<Progress<()>> {
        let _guard = self.locks.lock(&lock_key(kind, name)).await;
        let deadline = self.deadline();

        let Some(mut object) = self.api.find(kind, name).await? else {
            return Ok(Progress::Ready(()));
        };
        if object.owner() != Some(owner) {
            warn!(%kind, name, found = ?object.owner(), "not owned by {owner}; leaving it in place");
            return Ok(Progress::Ready(()));
        }
        if object.state == EntityState::Busy {
            match self.wait_until_settled(kind, name, deadline).await? {
                Progress::Ready(Some(settled)) => object = settled,
                Progress::Ready(None) => return Ok(Progress::Ready(())),
                Progress::InProgress(what) => return Ok(Progress::InProgress(what)),
            }
        }

        info!(%kind, name, "deleting");
        let submission = self.api.delete(kind, &object.id).await?;
        if submission == Submission::NotFound {
            return Ok(Progress::Ready(()));
        }
        if let Progress::InProgress(what) = self.follow(kind, submission, deadline).await? {
            return Ok(Progress::InProgress(what));
        }

        match self.api.find(kind, name).await? {
            None => Ok(Progress::Ready(())),
            Some(_) => Ok(Progress::InProgress(format!(
                "waiting for {kind} '{name}' to be removed"
            ))),
        }
    }

    /// Bring an existing object into a desired state
    ///
    /// `decide` sees the freshly observed object under the per-name lock
    /// and returns the operation still needed, if any. The object must
    /// exist; a missing object is `Error::NotFound`.
    pub async fn ensure_state<F>(
        &self,
        kind: ResourceKind,
        name: &str,
        owner: &str,
        decide: F,
    ) -> Result<Progress<ExternalObject>>
    where
        F: FnOnce(&ExternalObject) -> Option<Operation>,
    {
        let _guard = self.locks.lock(&lock_key(kind, name)).await;
        let deadline = self.deadline();
        let not_found = || Error::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        };

        let mut object = self.api.find(kind, name).await?.ok_or_else(not_found)?;
        check_owner(kind, &object, owner)?;
        match object.state {
            EntityState::Failed => return Err(failed(kind, &object)),
            EntityState::Busy => match self.wait_until_settled(kind, name, deadline).await? {
                Progress::Ready(Some(settled)) => object = settled,
                Progress::Ready(None) => return Err(not_found()),
                Progress::InProgress(what) => return Ok(Progress::InProgress(what)),
            },
            EntityState::Ready => {}
        }

        let Some(operation) = decide(&object) else {
            return Ok(Progress::Ready(object));
        };

        info!(%kind, name, verb = operation.verb(), "acting");
        let submission = self.api.act(kind, &object.id, &operation).await?;
        if submission == Submission::NotFound {
            return Err(not_found());
        }
        if let Progress::InProgress(what) = self.follow(kind, submission, deadline).await? {
            return Ok(Progress::InProgress(what));
        }

        let refreshed = self.api.find(kind, name).await?.ok_or_else(not_found)?;
        Ok(Progress::Ready(refreshed))
    }

    /// Follow a submission until it completes or the deadline passes
    async fn follow(
        &self,
        kind: ResourceKind,
        submission: Submission,
        deadline: Instant,
    ) -> Result<Progress<()>> {
        match submission {
            Submission::Task(handle) => {
                match self.poller.wait(self.api.as_ref(), &handle, deadline).await {
                    Ok(()) => {
                        record_task(kind, "success");
                        Ok(Progress::Ready(()))
                    }
                    Err(e) if e.class() == ErrorClass::Timeout => {
                        record_task(kind, "timeout");
                        debug!(operation = %handle.operation, "task outlived the call deadline");
                        Ok(Progress::InProgress(handle.operation))
                    }
                    Err(e) => {
                        record_task(kind, "error");
                        Err(e)
                    }
                }
            }
            Submission::Completed | Submission::AlreadyExists | Submission::NotFound => {
                Ok(Progress::Ready(()))
            }
            Submission::Busy => Ok(Progress::InProgress(format!(
                "another operation on this {kind} is in progress"
            ))),
        }
    }

    /// Ready objects pass through, failed ones are errors, busy ones are waited on
    async fn settled(
        &self,
        kind: ResourceKind,
        object: ExternalObject,
        deadline: Instant,
    ) -> Result<Progress<ExternalObject>> {
        match object.state {
            EntityState::Ready => Ok(Progress::Ready(object)),
            EntityState::Failed => Err(failed(kind, &object)),
            EntityState::Busy => match self.wait_until_settled(kind, &object.name, deadline).await? {
                Progress::Ready(Some(settled)) if settled.state == EntityState::Failed => {
                    Err(failed(kind, &settled))
                }
                Progress::Ready(Some(settled)) => Ok(Progress::Ready(settled)),
                Progress::Ready(None) => Ok(Progress::InProgress(format!(
                    "{kind} '{}' disappeared while busy",
                    object.name
                ))),
                Progress::InProgress(what) => Ok(Progress::InProgress(what)),
            },
        }
    }

    /// Poll a busy object until it leaves the busy state or vanishes
    async fn wait_until_settled(
        &self,
        kind: ResourceKind,
        name: &str,
        deadline: Instant,
    ) -> Result<Progress<Option<ExternalObject>>> {
        let operation = format!("{kind} '{name}' to settle");
        let api = self.api.as_ref();
        let polled = self
            .poller
            .poll_until(&operation, deadline, move || async move {
                Ok(match api.find(kind, name).await? {
                    Some(object) if object.state == EntityState::Busy => None,
                    other => Some(other),
                })
            })
            .await;

        match polled {
            Ok(object) => Ok(Progress::Ready(object)),
            Err(e) if e.class() == ErrorClass::Timeout => Ok(Progress::InProgress(operation)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcd::fake::FakeCloudDirector;
    use crate::vcd::types::{ResourceSpec, VAppRequest, OWNER_METADATA_KEY};

    const OWNER: &str = "tenant-a/c1";

    fn adapter(fake: &Arc<FakeCloudDirector>) -> InfraAdapter {
        let config = TaskPollConfig {
            poll_min_interval_ms: 10,
            poll_max_interval_ms: 50,
            call_deadline_secs: 2,
        };
        InfraAdapter::new(fake.clone(), &config)
    }

    fn vapp_request(owner: &str) -> ResourceRequest {
        named_vapp_request("tenant-a-c1", owner)
    }

    fn named_vapp_request(name: &str, owner: &str) -> ResourceRequest {
        ResourceRequest {
            owner: owner.to_string(),
            spec: ResourceSpec::VApp(VAppRequest {
                name: name.to_string(),
                vdc: "acme-vdc".to_string(),
                network_id: "urn:vcloud:network:1".to_string(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_adopt_without_second_create() {
        let fake = Arc::new(FakeCloudDirector::new());
        let adapter = adapter(&fake);

        let first = adapter.ensure_created(&vapp_request(OWNER)).await.unwrap();
        assert!(first.is_ready());
        let second = adapter.ensure_created(&vapp_request(OWNER)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.mutations(), vec!["create vapp tenant-a-c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_creates_of_one_name_issue_one_create() {
        let fake = Arc::new(FakeCloudDirector::new());
        fake.set_task_polls(5);
        let adapter = adapter(&fake);
        let request = vapp_request(OWNER);

        let (first, second) = tokio::join!(
            adapter.ensure_created(&request),
            adapter.ensure_created(&request)
        );

        let first = first.unwrap();
        assert!(first.is_ready());
        assert_eq!(second.unwrap(), first);
        assert_eq!(fake.mutations(), vec!["create vapp tenant-a-c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_names_are_created_in_parallel() {
        let alone = {
            let fake = Arc::new(FakeCloudDirector::new());
            fake.set_task_polls(5);
            let started = Instant::now();
            let created = adapter(&fake)
                .ensure_created(&named_vapp_request("tenant-a-c1", OWNER))
                .await
                .unwrap();
            assert!(created.is_ready());
            started.elapsed()
        };

        let fake = Arc::new(FakeCloudDirector::new());
        fake.set_task_polls(5);
        let adapter = adapter(&fake);
        let first_request = named_vapp_request("tenant-a-c1", OWNER);
        let second_request = named_vapp_request("tenant-b-c1", "tenant-b/c1");
        let started = Instant::now();
        let (first, second) = tokio::join!(
            adapter.ensure_created(&first_request),
            adapter.ensure_created(&second_request)
        );
        let together = started.elapsed();

        assert!(first.unwrap().is_ready());
        assert!(second.unwrap().is_ready());
        assert!(together < alone * 2, "{together:?} vs {alone:?} for one create");
        let mut mutations = fake.mutations();
        mutations.sort();
        assert_eq!(
            mutations,
            vec!["create vapp tenant-a-c1".to_string(), "create vapp tenant-b-c1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_object_of_other_owner_is_rejected() {
        let fake = Arc::new(FakeCloudDirector::new());
        fake.insert(
            ResourceKind::VApp,
            ExternalObject {
                id: "urn:vcloud:vapp:99".to_string(),
                name: "tenant-a-c1".to_string(),
                metadata: [(OWNER_METADATA_KEY.to_string(), "other/c1".to_string())].into(),
                ..Default::default()
            },
        );

        let err = adapter(&fake)
            .ensure_created(&vapp_request(OWNER))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ResourceNotOwned");
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_task_reports_in_progress_then_completes() {
        let fake = Arc::new(FakeCloudDirector::new());
        fake.set_task_polls(u32::MAX);
        let adapter = adapter(&fake);

        let progress = adapter.ensure_created(&vapp_request(OWNER)).await.unwrap();
        assert!(matches!(progress, Progress::InProgress(_)));

        fake.complete_all_tasks();
        let progress = adapter.ensure_created(&vapp_request(OWNER)).await.unwrap();
        assert!(progress.is_ready());
        assert_eq!(fake.mutations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_missing_object_is_success() {
        let fake = Arc::new(FakeCloudDirector::new());
        let progress = adapter(&fake)
            .ensure_deleted(ResourceKind::Vm, "tenant-a-m1", OWNER)
            .await
            .unwrap();
        assert_eq!(progress, Progress::Ready(()));
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_leaves_unowned_object() {
        let fake = Arc::new(FakeCloudDirector::new());
        fake.insert(
            ResourceKind::Network,
            ExternalObject {
                id: "urn:vcloud:network:5".to_string(),
                name: "shared-net".to_string(),
                ..Default::default()
            },
        );

        let progress = adapter(&fake)
            .ensure_deleted(ResourceKind::Network, "shared-net", OWNER)
            .await
            .unwrap();
        assert_eq!(progress, Progress::Ready(()));
        assert!(fake.object(ResourceKind::Network, "shared-net").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_state_skips_when_nothing_to_do() {
        let fake = Arc::new(FakeCloudDirector::new());
        let adapter = adapter(&fake);
        adapter.ensure_created(&vapp_request(OWNER)).await.unwrap();

        let progress = adapter
            .ensure_state(ResourceKind::VApp, "tenant-a-c1", OWNER, |_| None)
            .await
            .unwrap();
        assert!(progress.is_ready());
        assert_eq!(fake.mutations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_is_terminal() {
        let fake = Arc::new(FakeCloudDirector::new());
        fake.fail_tasks(ResourceKind::VApp, "storage policy unavailable");

        let err = adapter(&fake)
            .ensure_created(&vapp_request(OWNER))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Terminal);
        assert_eq!(err.reason(), "TaskFailed");
    }
}
