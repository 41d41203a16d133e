//! In-memory Store/Mutator/event implementations for tests
//!
//! `FakeStore` holds objects in maps keyed by `namespace/name`. A
//! `FakeMutator` records every write it receives; constructed with
//! [`FakeMutator::applying`], it also applies creates, deletes, and status
//! commits back to the store, so a test can run a tick, let the "cluster"
//! converge, and run the next one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use kube::runtime::events::EventType;

use trainops_common::crd::{TrainJob, TrainJobStatus};
use trainops_common::events::EventPublisher;
use trainops_common::Result;

use crate::store::{controller_owned_by, Mutator, Store};

// =============================================================================
// FakeStore
// =============================================================================

/// In-memory [`Store`]
#[derive(Default)]
pub struct FakeStore {
    jobs: Mutex<BTreeMap<String, TrainJob>>,
    pods: Mutex<BTreeMap<String, Pod>>,
    services: Mutex<BTreeMap<String, Service>>,
}

fn key_of(namespace: Option<&str>, name: Option<&str>) -> String {
    format!(
        "{}/{}",
        namespace.unwrap_or_default(),
        name.unwrap_or_default()
    )
}

impl FakeStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job
    pub fn put_job(&self, job: TrainJob) {
        let key = key_of(
            job.metadata.namespace.as_deref(),
            job.metadata.name.as_deref(),
        );
        self.jobs.lock().unwrap().insert(key, job);
    }

    /// Remove a job
    pub fn remove_job(&self, namespace: &str, name: &str) {
        self.jobs
            .lock()
            .unwrap()
            .remove(&format!("{namespace}/{name}"));
    }

    /// Insert or replace a pod
    pub fn put_pod(&self, pod: Pod) {
        let key = key_of(
            pod.metadata.namespace.as_deref(),
            pod.metadata.name.as_deref(),
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    /// Remove a pod
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&format!("{namespace}/{name}"));
    }

    /// Insert or replace a service
    pub fn put_service(&self, service: Service) {
        let key = key_of(
            service.metadata.namespace.as_deref(),
            service.metadata.name.as_deref(),
        );
        self.services.lock().unwrap().insert(key, service);
    }

    /// Remove a service
    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.services
            .lock()
            .unwrap()
            .remove(&format!("{namespace}/{name}"));
    }

    /// Every pod in the store, ownership ignored (assertions)
    pub fn all_pods(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().values().cloned().collect()
    }

    /// Every service in the store, ownership ignored (assertions)
    pub fn all_services(&self) -> Vec<Service> {
        self.services.lock().unwrap().values().cloned().collect()
    }
}

impl Store for FakeStore {
    fn get_job(&self, namespace: &str, name: &str) -> Option<TrainJob> {
        self.jobs
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    fn list_jobs(&self) -> Vec<TrainJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    fn list_pods(&self, job: &TrainJob) -> Vec<Pod> {
        self.pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| pod.metadata.namespace == job.metadata.namespace)
            .filter(|pod| {
                controller_owned_by(
                    pod.metadata.owner_references.as_deref().unwrap_or_default(),
                    job,
                )
            })
            .cloned()
            .collect()
    }

    fn list_services(&self, job: &TrainJob) -> Vec<Service> {
        self.services
            .lock()
            .unwrap()
            .values()
            .filter(|svc| svc.metadata.namespace == job.metadata.namespace)
            .filter(|svc| {
                controller_owned_by(
                    svc.metadata.owner_references.as_deref().unwrap_or_default(),
                    job,
                )
            })
            .cloned()
            .collect()
    }
}

// =============================================================================
// FakeMutator
// =============================================================================

/// One write received by a [`FakeMutator`]
#[derive(Clone, Debug)]
pub enum Action {
    /// A pod creation
    CreatePod {
        namespace: String,
        pod: Box<Pod>,
    },
    /// A pod deletion
    DeletePod { namespace: String, name: String },
    /// A service creation
    CreateService {
        namespace: String,
        service: Box<Service>,
    },
    /// A service deletion
    DeleteService { namespace: String, name: String },
    /// A PodGroup create-or-update
    SyncPodGroup { job: String, min_member: i32 },
    /// A PodGroup deletion
    DeletePodGroup { job: String },
    /// A status commit
    UpdateJobStatus {
        job: String,
        status: Box<Option<TrainJobStatus>>,
    },
    /// A job deletion
    DeleteJob { namespace: String, name: String },
}

/// Recording [`Mutator`], optionally applying writes back to a [`FakeStore`]
#[derive(Default)]
pub struct FakeMutator {
    actions: Mutex<Vec<Action>>,
    store: Option<Arc<FakeStore>>,
}

impl FakeMutator {
    /// Record writes without applying them anywhere
    pub fn new() -> Self {
        Self::default()
    }

    /// Record writes and apply them to the given store
    pub fn applying(store: Arc<FakeStore>) -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            store: Some(store),
        }
    }

    /// Everything recorded so far
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    /// Drop the recorded history (between ticks)
    pub fn clear(&self) {
        self.actions.lock().unwrap().clear();
    }

    /// Names of pods created so far, sorted
    pub fn created_pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions()
            .iter()
            .filter_map(|a| match a {
                Action::CreatePod { pod, .. } => pod.metadata.name.clone(),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Names of pods deleted so far, sorted
    pub fn deleted_pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions()
            .iter()
            .filter_map(|a| match a {
                Action::DeletePod { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Names of services created so far, sorted
    pub fn created_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions()
            .iter()
            .filter_map(|a| match a {
                Action::CreateService { service, .. } => service.metadata.name.clone(),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// The created pod with the given name, if any
    pub fn created_pod(&self, name: &str) -> Option<Pod> {
        self.actions().iter().find_map(|a| match a {
            Action::CreatePod { pod, .. } if pod.metadata.name.as_deref() == Some(name) => {
                Some((**pod).clone())
            }
            _ => None,
        })
    }

    fn record(&self, action: Action) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl Mutator for FakeMutator {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        self.record(Action::CreatePod {
            namespace: namespace.to_string(),
            pod: Box::new(pod.clone()),
        });
        if let Some(store) = &self.store {
            store.put_pod(pod.clone());
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(Action::DeletePod {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(store) = &self.store {
            store.remove_pod(namespace, name);
        }
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        self.record(Action::CreateService {
            namespace: namespace.to_string(),
            service: Box::new(service.clone()),
        });
        if let Some(store) = &self.store {
            store.put_service(service.clone());
        }
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(Action::DeleteService {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(store) = &self.store {
            store.remove_service(namespace, name);
        }
        Ok(())
    }

    async fn sync_pod_group(&self, job: &TrainJob, min_member: i32) -> Result<()> {
        self.record(Action::SyncPodGroup {
            job: job.metadata.name.clone().unwrap_or_default(),
            min_member,
        });
        Ok(())
    }

    async fn delete_pod_group(&self, job: &TrainJob) -> Result<()> {
        self.record(Action::DeletePodGroup {
            job: job.metadata.name.clone().unwrap_or_default(),
        });
        Ok(())
    }

    async fn update_job_status(&self, job: &TrainJob) -> Result<()> {
        self.record(Action::UpdateJobStatus {
            job: job.metadata.name.clone().unwrap_or_default(),
            status: Box::new(job.status.clone()),
        });
        if let Some(store) = &self.store {
            let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
            let name = job.metadata.name.as_deref().unwrap_or_default();
            if let Some(mut stored) = store.get_job(namespace, name) {
                stored.status = job.status.clone();
                store.put_job(stored);
            }
        }
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(Action::DeleteJob {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(store) = &self.store {
            store.remove_job(namespace, name);
        }
        Ok(())
    }
}

// =============================================================================
// Recording events
// =============================================================================

/// One event received by a [`RecordingEventPublisher`]
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    /// Whether the event was a Warning
    pub warning: bool,
    /// Machine-readable reason
    pub reason: String,
    /// Action string
    pub action: String,
    /// Optional note
    pub note: Option<String>,
}

/// [`EventPublisher`] capturing events for assertions
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Reasons recorded so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
