//! In-memory Cloud Director used by unit tests
//!
//! Mutating calls are recorded in order, create/delete/act answer with a
//! task that completes after a configurable number of polls, and
//! failures can be injected per resource kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::api::CloudDirectorApi;
use super::types::{
    EntityState, ExternalObject, Operation, PowerState, ResourceKind, ResourceRequest,
    ResourceSpec, Submission, Task, TaskHandle, TaskStatus, OWNER_METADATA_KEY,
};
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
enum Effect {
    Create,
    Delete,
    Act(Operation),
}

#[derive(Debug)]
struct PendingTask {
    kind: ResourceKind,
    name: String,
    effect: Effect,
    polls_left: u32,
    failure: Option<String>,
    result: Option<TaskStatus>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(ResourceKind, String), ExternalObject>,
    tasks: HashMap<String, PendingTask>,
    next_id: u64,
    mutations: Vec<String>,
    task_polls: u32,
    task_failures: HashMap<ResourceKind, String>,
    create_failures: HashMap<ResourceKind, (u16, String)>,
    lookup_failures: HashMap<ResourceKind, u16>,
    assign_addresses: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn name_of(&self, kind: ResourceKind, id: &str) -> Option<String> {
        self.objects
            .iter()
            .find(|((k, _), o)| *k == kind && o.id == id)
            .map(|((_, name), _)| name.clone())
    }

    fn submit(&mut self, kind: ResourceKind, name: &str, effect: Effect, operation: String) -> Submission {
        let href = format!("/api/task/{}", self.next_id());
        let failure = self.task_failures.get(&kind).cloned();
        self.tasks.insert(
            href.clone(),
            PendingTask {
                kind,
                name: name.to_string(),
                effect,
                polls_left: self.task_polls,
                failure,
                result: None,
            },
        );
        Submission::Task(TaskHandle { href, operation })
    }

    fn finish(&mut self, href: &str) -> TaskStatus {
        let Some(task) = self.tasks.get(href) else {
            return TaskStatus::Error;
        };
        if let Some(status) = task.result {
            return status;
        }
        let kind = task.kind;
        let name = task.name.clone();
        let effect = task.effect.clone();
        let failed = task.failure.is_some();
        let key = (kind, name);

        if failed {
            match effect {
                Effect::Create => {
                    self.objects.remove(&key);
                }
                Effect::Delete | Effect::Act(_) => {
                    if let Some(object) = self.objects.get_mut(&key) {
                        object.state = EntityState::Ready;
                    }
                }
            }
        } else {
            match effect {
                Effect::Create => {
                    if let Some(object) = self.objects.get_mut(&key) {
                        object.state = EntityState::Ready;
                    }
                }
                Effect::Delete => {
                    self.objects.remove(&key);
                }
                Effect::Act(operation) => {
                    let address = format!("10.0.0.{}", self.next_id());
                    let assign = self.assign_addresses;
                    if let Some(object) = self.objects.get_mut(&key) {
                        object.state = EntityState::Ready;
                        match operation {
                            Operation::PowerOn => {
                                object.power_state = Some(PowerState::PoweredOn);
                                if assign && object.ip_addresses.is_empty() {
                                    object.ip_addresses = vec![address];
                                }
                            }
                            Operation::PowerOff => {
                                object.power_state = Some(PowerState::PoweredOff);
                            }
                            Operation::Customize { .. } => object.guest_customized = true,
                            Operation::SetMembers { members, .. } => object.members = members,
                        }
                    }
                }
            }
        }

        let status = if failed {
            TaskStatus::Error
        } else {
            TaskStatus::Success
        };
        if let Some(task) = self.tasks.get_mut(href) {
            task.result = Some(status);
        }
        status
    }
}

pub struct FakeCloudDirector {
    state: Mutex<State>,
}

impl Default for FakeCloudDirector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloudDirector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                assign_addresses: true,
                ..Default::default()
            }),
        }
    }

    /// Number of `Running` answers before a task completes
    pub fn set_task_polls(&self, polls: u32) {
        self.state.lock().unwrap().task_polls = polls;
    }

    /// Whether powered-on VMs get an address
    pub fn set_assign_addresses(&self, assign: bool) {
        self.state.lock().unwrap().assign_addresses = assign;
    }

    pub fn insert(&self, kind: ResourceKind, object: ExternalObject) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind, object.name.clone()), object);
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<ExternalObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn remove(&self, kind: ResourceKind, name: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&(kind, name.to_string()));
    }

    pub fn update(&self, kind: ResourceKind, name: &str, f: impl FnOnce(&mut ExternalObject)) {
        if let Some(object) = self
            .state
            .lock()
            .unwrap()
            .objects
            .get_mut(&(kind, name.to_string()))
        {
            f(object);
        }
    }

    /// Every mutating call so far, e.g. "create vm tenant-a-m1"
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn fail_tasks(&self, kind: ResourceKind, message: &str) {
        self.state
            .lock()
            .unwrap()
            .task_failures
            .insert(kind, message.to_string());
    }

    pub fn fail_creates(&self, kind: ResourceKind, status: u16, message: &str) {
        self.state
            .lock()
            .unwrap()
            .create_failures
            .insert(kind, (status, message.to_string()));
    }

    pub fn fail_lookups(&self, kind: ResourceKind, status: u16) {
        self.state.lock().unwrap().lookup_failures.insert(kind, status);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.task_failures.clear();
        state.create_failures.clear();
        state.lookup_failures.clear();
    }

    pub fn complete_all_tasks(&self) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.result.is_none())
            .map(|(href, _)| href.clone())
            .collect();
        for href in pending {
            state.finish(&href);
        }
    }
}

fn initial_object(id: String, request: &ResourceRequest, vip_suffix: u64) -> ExternalObject {
    let mut object = ExternalObject {
        id,
        name: request.name().to_string(),
        state: EntityState::Busy,
        metadata: [(OWNER_METADATA_KEY.to_string(), request.owner.clone())].into(),
        ..Default::default()
    };
    match &request.spec {
        ResourceSpec::Vm(_) => object.power_state = Some(PowerState::PoweredOff),
        ResourceSpec::LoadBalancer(lb) => {
            object.virtual_ip = Some(
                lb.virtual_ip
                    .clone()
                    .unwrap_or_else(|| format!("203.0.113.{vip_suffix}")),
            );
        }
        ResourceSpec::Network(_) | ResourceSpec::VApp(_) => {}
    }
    object
}

#[async_trait]
impl CloudDirectorApi for FakeCloudDirector {
    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<ExternalObject>> {
        let state = self.state.lock().unwrap();
        if let Some(status) = state.lookup_failures.get(&kind) {
            return Err(Error::platform(*status, "", "injected lookup failure"));
        }
        Ok(state.objects.get(&(kind, name.to_string())).cloned())
    }

    async fn create(&self, request: &ResourceRequest) -> Result<Submission> {
        let mut state = self.state.lock().unwrap();
        let kind = request.kind();
        let name = request.name().to_string();
        let operation = format!("create {kind} {name}");
        state.mutations.push(operation.clone());

        if let Some((status, message)) = state.create_failures.get(&kind).cloned() {
            return Err(Error::platform(status, "", message));
        }
        if state.objects.contains_key(&(kind, name.clone())) {
            return Ok(Submission::AlreadyExists);
        }

        let n = state.next_id();
        let object = initial_object(format!("urn:vcloud:{}:{n}", kind.as_str()), request, n);
        state.objects.insert((kind, name.clone()), object);
        Ok(state.submit(kind, &name, Effect::Create, operation))
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<Submission> {
        let mut state = self.state.lock().unwrap();
        let Some(name) = state.name_of(kind, id) else {
            return Ok(Submission::NotFound);
        };
        let operation = format!("delete {kind} {name}");
        state.mutations.push(operation.clone());
        if let Some(object) = state.objects.get_mut(&(kind, name.clone())) {
            object.state = EntityState::Busy;
        }
        Ok(state.submit(kind, &name, Effect::Delete, operation))
    }

    async fn act(&self, kind: ResourceKind, id: &str, operation: &Operation) -> Result<Submission> {
        let mut state = self.state.lock().unwrap();
        let Some(name) = state.name_of(kind, id) else {
            return Ok(Submission::NotFound);
        };
        let description = format!("{} {kind} {name}", operation.verb());
        state.mutations.push(description.clone());
        if let Some(object) = state.objects.get_mut(&(kind, name.clone())) {
            object.state = EntityState::Busy;
        }
        Ok(state.submit(kind, &name, Effect::Act(operation.clone()), description))
    }

    async fn task(&self, handle: &TaskHandle) -> Result<Task> {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&handle.href) else {
            return Err(Error::platform(404, "", "unknown task"));
        };
        if task.result.is_none() && task.polls_left > 0 {
            task.polls_left -= 1;
            return Ok(Task {
                status: TaskStatus::Running,
                message: None,
            });
        }
        let message = task.failure.clone();
        let status = state.finish(&handle.href);
        Ok(Task { status, message })
    }
}
