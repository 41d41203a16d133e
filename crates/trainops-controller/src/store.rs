//! Read and write seams between the core and the cluster
//!
//! [`Store`] serves snapshots out of the shared informer caches — reads are
//! in-memory and never block. [`Mutator`] issues the actual API writes and
//! is the only place a worker suspends. Production implementations are
//! backed by kube reflector stores and a kube client; the in-memory pair in
//! [`crate::fake`] backs the test suite.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store as ReflectorStore};
use kube::Client;

use trainops_common::crd::TrainJob;
use trainops_common::error::is_not_found;
use trainops_common::{Error, Result, CONTROLLER_NAME};

use crate::meta::train_job_controller_ref;
use crate::podgroup::{pod_group_api_resource, pod_group_for};

// =============================================================================
// Traits
// =============================================================================

/// Cache-backed reads. All methods return deep-copied snapshots the caller
/// may freely mutate.
pub trait Store: Send + Sync {
    /// Look up one job by namespace and name
    fn get_job(&self, namespace: &str, name: &str) -> Option<TrainJob>;

    /// All jobs currently in the cache (used by the periodic resync)
    fn list_jobs(&self) -> Vec<TrainJob>;

    /// Pods controller-owned by the given job
    fn list_pods(&self, job: &TrainJob) -> Vec<Pod>;

    /// Services controller-owned by the given job
    fn list_services(&self, job: &TrainJob) -> Vec<Service>;
}

/// Cluster writes. Deletions are idempotent: removing an object that is
/// already gone succeeds.
#[async_trait]
pub trait Mutator: Send + Sync {
    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    /// Delete a pod by name
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// Delete a service by name
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create or update the job's PodGroup with the given quorum size
    async fn sync_pod_group(&self, job: &TrainJob, min_member: i32) -> Result<()>;

    /// Delete the job's PodGroup
    async fn delete_pod_group(&self, job: &TrainJob) -> Result<()>;

    /// Commit the job's status subresource.
    ///
    /// Stale updates surface as a Conflict error, which re-enqueues the key.
    async fn update_job_status(&self, job: &TrainJob) -> Result<()>;

    /// Delete the job object itself (finished-job TTL)
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Whether `owner_refs` names `job` as controller
pub(crate) fn controller_owned_by(
    owner_refs: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference],
    job: &TrainJob,
) -> bool {
    let Some(job_uid) = job.metadata.uid.as_deref() else {
        return false;
    };
    train_job_controller_ref(owner_refs).is_some_and(|or| or.uid == job_uid)
}

// =============================================================================
// Reflector-backed Store
// =============================================================================

/// [`Store`] served from three kube reflector caches
pub struct KubeStore {
    jobs: ReflectorStore<TrainJob>,
    pods: ReflectorStore<Pod>,
    services: ReflectorStore<Service>,
}

impl KubeStore {
    /// Wrap already-running reflector stores
    pub fn new(
        jobs: ReflectorStore<TrainJob>,
        pods: ReflectorStore<Pod>,
        services: ReflectorStore<Service>,
    ) -> Self {
        Self {
            jobs,
            pods,
            services,
        }
    }

    /// Wait for all three caches to complete their initial list.
    ///
    /// Startup must not launch workers before this resolves; diffing against
    /// a half-filled cache would recreate pods that already exist.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let ready = async {
            self.jobs.wait_until_ready().await?;
            self.pods.wait_until_ready().await?;
            self.services.wait_until_ready().await
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::internal_with_context(
                "store",
                "reflector writer dropped before caches synced",
            )),
            Err(_) => Err(Error::internal_with_context(
                "store",
                format!("timed out after {timeout:?} waiting for caches to sync"),
            )),
        }
    }
}

impl Store for KubeStore {
    fn get_job(&self, namespace: &str, name: &str) -> Option<TrainJob> {
        let obj_ref = ObjectRef::new(name).within(namespace);
        self.jobs.get(&obj_ref).map(|arc| (*arc).clone())
    }

    fn list_jobs(&self) -> Vec<TrainJob> {
        self.jobs.state().iter().map(|arc| (**arc).clone()).collect()
    }

    fn list_pods(&self, job: &TrainJob) -> Vec<Pod> {
        let namespace = job.metadata.namespace.as_deref();
        self.pods
            .state()
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == namespace)
            .filter(|pod| {
                controller_owned_by(
                    pod.metadata.owner_references.as_deref().unwrap_or_default(),
                    job,
                )
            })
            .map(|arc| (**arc).clone())
            .collect()
    }

    fn list_services(&self, job: &TrainJob) -> Vec<Service> {
        let namespace = job.metadata.namespace.as_deref();
        self.services
            .state()
            .iter()
            .filter(|svc| svc.metadata.namespace.as_deref() == namespace)
            .filter(|svc| {
                controller_owned_by(
                    svc.metadata.owner_references.as_deref().unwrap_or_default(),
                    job,
                )
            })
            .map(|arc| (**arc).clone())
            .collect()
    }
}

// =============================================================================
// Client-backed Mutator
// =============================================================================

/// [`Mutator`] issuing writes through a kube client
pub struct KubeMutator {
    client: Client,
}

impl KubeMutator {
    /// Mutator using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn job_name_and_namespace<'a>(&self, job: &'a TrainJob) -> Result<(&'a str, &'a str)> {
        let name = job
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::invalid_job("<unnamed>", "job has no name"))?;
        let namespace = job
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::invalid_job(name, "job has no namespace"))?;
        Ok((name, namespace))
    }
}

/// Map a delete result so that an already-gone object counts as success
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Mutator for KubeMutator {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn sync_pod_group(&self, job: &TrainJob, min_member: i32) -> Result<()> {
        let (name, namespace) = self.job_name_and_namespace(job)?;
        let pod_group = pod_group_for(job, min_member)?;
        let ar = pod_group_api_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        api.patch(
            name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&pod_group),
        )
        .await?;
        Ok(())
    }

    async fn delete_pod_group(&self, job: &TrainJob) -> Result<()> {
        let (name, namespace) = self.job_name_and_namespace(job)?;
        let ar = pod_group_api_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn update_job_status(&self, job: &TrainJob) -> Result<()> {
        let (name, namespace) = self.job_name_and_namespace(job)?;
        let api: Api<TrainJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": job.status });
        api.patch_status(
            name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<TrainJob> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }
}
