//! Event dispatch and worker loops
//!
//! Translates cache add/update/delete callbacks for jobs, pods, and
//! services into a deduplicated stream of job keys, settles expectation
//! observations, and drives N worker loops over the work queue. Pod and
//! service events reach their job through the controller owner reference —
//! the back-edge is a key string, never a pointer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use trainops_common::crd::{ReplicaType, TrainJob};
use trainops_common::events::{actions, reasons, EventPublisher};
use trainops_common::{metrics, Error, LABEL_REPLICA_TYPE};

use crate::config::ControllerConfig;
use crate::expectations::{Expectations, ResourceKind};
use crate::job::JobReconciler;
use crate::meta::{job_key, split_key, train_job_controller_ref};
use crate::queue::WorkQueue;
use crate::store::Store;

/// Wires cache events, the work queue, and the reconciler together
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<JobReconciler>,
    expectations: Arc<Expectations>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventPublisher>,
    config: ControllerConfig,
    /// UIDs already seen, to tell a first-sight apply from an update
    known_pods: Mutex<HashSet<String>>,
    known_services: Mutex<HashSet<String>>,
}

impl Dispatcher {
    /// Assemble the dispatcher around an existing reconciler
    pub fn new(
        reconciler: Arc<JobReconciler>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            expectations: reconciler.expectations(),
            reconciler,
            store,
            events,
            config,
            known_pods: Mutex::new(HashSet::new()),
            known_services: Mutex::new(HashSet::new()),
        }
    }

    /// The shared work queue (tests and shutdown wiring)
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Request shutdown: stop intake, drain, let workers finish their ticks
    pub fn shutdown(&self) {
        info!("shutting down work queue");
        self.queue.shut_down();
    }

    // =========================================================================
    // Cache event handlers
    // =========================================================================

    /// A job appeared or changed in the cache
    pub fn job_applied(&self, job: &TrainJob) {
        if let Some(key) = job_key(job) {
            self.queue.add(&key);
        }
    }

    /// A job disappeared from the cache.
    ///
    /// Enqueued so the worker observes the disappearance and cleans up its
    /// expectation state.
    pub fn job_deleted(&self, job: &TrainJob) {
        if let Some(key) = job_key(job) {
            self.queue.add(&key);
        }
    }

    /// A pod appeared or changed in the cache
    pub fn pod_applied(&self, pod: &Pod) {
        let Some(key) = owned_job_key(pod.meta()) else {
            return;
        };
        let first_sight = self.known_pods.lock().unwrap().insert(uid_of(pod.meta()));
        if first_sight {
            if let Some(rtype) = replica_type_of(pod.labels().get(LABEL_REPLICA_TYPE)) {
                self.expectations
                    .creation_observed(&key, rtype, ResourceKind::Pod);
            }
        }
        self.queue.add(&key);
    }

    /// A pod disappeared from the cache
    pub fn pod_deleted(&self, pod: &Pod) {
        let Some(key) = owned_job_key(pod.meta()) else {
            return;
        };
        self.known_pods.lock().unwrap().remove(&uid_of(pod.meta()));
        if let Some(rtype) = replica_type_of(pod.labels().get(LABEL_REPLICA_TYPE)) {
            self.expectations
                .deletion_observed(&key, rtype, ResourceKind::Pod);
        }
        self.queue.add(&key);
    }

    /// A service appeared or changed in the cache
    pub fn service_applied(&self, service: &Service) {
        let Some(key) = owned_job_key(service.meta()) else {
            return;
        };
        let first_sight = self
            .known_services
            .lock()
            .unwrap()
            .insert(uid_of(service.meta()));
        if first_sight {
            if let Some(rtype) = replica_type_of(service.labels().get(LABEL_REPLICA_TYPE)) {
                self.expectations
                    .creation_observed(&key, rtype, ResourceKind::Service);
            }
        }
        self.queue.add(&key);
    }

    /// A service disappeared from the cache
    pub fn service_deleted(&self, service: &Service) {
        let Some(key) = owned_job_key(service.meta()) else {
            return;
        };
        self.known_services
            .lock()
            .unwrap()
            .remove(&uid_of(service.meta()));
        if let Some(rtype) = replica_type_of(service.labels().get(LABEL_REPLICA_TYPE)) {
            self.expectations
                .deletion_observed(&key, rtype, ResourceKind::Service);
        }
        self.queue.add(&key);
    }

    // =========================================================================
    // Worker loops
    // =========================================================================

    /// One worker: pop keys in a tight loop until shutdown
    pub async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.next().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!("worker exiting");
    }

    async fn process(&self, key: &str) {
        let requeues = self.queue.num_requeues(key);
        let timer = metrics::ReconcileTimer::start();
        match self.reconciler.sync_job(key, requeues).await {
            Ok(forget) => {
                timer.success();
                if forget {
                    self.queue.forget(key);
                }
            }
            Err(e) if e.is_retryable() => {
                timer.error();
                warn!(key, error = %e, "error syncing job, requeuing with backoff");
                self.queue.clone().add_rate_limited(key);
            }
            Err(e) => {
                timer.error();
                error!(key, error = %e, "dropping job key after non-retryable error");
                if matches!(e, Error::InvalidJob { .. } | Error::Serialization { .. }) {
                    self.events
                        .publish(
                            &object_ref_for_key(key),
                            EventType::Warning,
                            reasons::FAILED_MARSHAL_TRAIN_JOB,
                            actions::RECONCILE,
                            Some(format!("Failed to unmarshal the object to TrainJob: {e}")),
                        )
                        .await;
                }
                self.queue.forget(key);
            }
        }
    }

    /// Spawn the configured number of workers
    pub fn spawn_workers(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        info!(workers = self.config.worker_threads, "starting workers");
        (0..self.config.worker_threads.max(1))
            .map(|_| tokio::spawn(Arc::clone(&self).run_worker()))
            .collect()
    }

    /// Periodically re-enqueue every known job, keeping the loop
    /// level-triggered even when watch events are missed.
    pub async fn run_resync(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.resync_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the caches just synced, so skip it
        tick.tick().await;
        loop {
            tick.tick().await;
            if self.queue.is_shutting_down() {
                return;
            }
            let jobs = self.store.list_jobs();
            debug!(jobs = jobs.len(), "resync enqueue");
            for job in &jobs {
                if let Some(key) = job_key(job) {
                    self.queue.add(&key);
                }
            }
        }
    }
}

fn uid_of(meta: &kube::core::ObjectMeta) -> String {
    meta.uid.clone().unwrap_or_default()
}

fn replica_type_of(label: Option<&String>) -> Option<ReplicaType> {
    label.and_then(|l| ReplicaType::from_lower(l))
}

/// Resolve an owned object to its job's work-queue key
fn owned_job_key(meta: &kube::core::ObjectMeta) -> Option<String> {
    let namespace = meta.namespace.as_deref()?;
    let owner = train_job_controller_ref(meta.owner_references.as_deref().unwrap_or_default())?;
    Some(format!("{namespace}/{}", owner.name))
}

/// Best-effort object reference for events about a key whose object could
/// not be decoded
fn object_ref_for_key(key: &str) -> ObjectReference {
    let (namespace, name) = split_key(key)
        .map(|(ns, n)| (ns.to_string(), n.to_string()))
        .unwrap_or_default();
    ObjectReference {
        api_version: Some(TrainJob::api_version(&()).into_owned()),
        kind: Some(TrainJob::kind(&()).into_owned()),
        namespace: Some(namespace),
        name: Some(name),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeMutator, FakeStore};
    use crate::meta::owner_reference;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use trainops_common::crd::TrainJobSpec;
    use trainops_common::events::NoopEventPublisher;
    use trainops_common::{LABEL_REPLICA_INDEX, LABEL_REPLICA_TYPE};

    fn test_job() -> TrainJob {
        let mut job = TrainJob::new("mnist", TrainJobSpec::default());
        job.metadata = ObjectMeta {
            name: Some("mnist".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("job-uid".to_string()),
            ..Default::default()
        };
        job
    }

    fn owned_pod(job: &TrainJob, name: &str, uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_REPLICA_TYPE.to_string(), "worker".to_string()),
                    (LABEL_REPLICA_INDEX.to_string(), "0".to_string()),
                ])),
                owner_references: Some(vec![owner_reference(job)]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn dispatcher() -> Dispatcher {
        let store = Arc::new(FakeStore::new());
        let mutator = Arc::new(FakeMutator::new());
        let events = Arc::new(NoopEventPublisher);
        let expectations = Arc::new(Expectations::new());
        let reconciler = Arc::new(JobReconciler::new(
            store.clone(),
            mutator,
            events.clone(),
            expectations,
            ControllerConfig::default(),
        ));
        Dispatcher::new(reconciler, store, events, ControllerConfig::default())
    }

    #[tokio::test]
    async fn job_events_enqueue_the_key() {
        let dispatcher = dispatcher();
        let job = test_job();
        dispatcher.job_applied(&job);
        dispatcher.job_applied(&job);
        assert_eq!(dispatcher.queue().len(), 1);
        assert_eq!(
            dispatcher.queue().next().await.as_deref(),
            Some("default/mnist")
        );
    }

    #[tokio::test]
    async fn first_pod_sighting_settles_a_creation_expectation() {
        let dispatcher = dispatcher();
        let job = test_job();
        let key = "default/mnist";
        dispatcher
            .expectations
            .expect_creations(key, ReplicaType::Worker, ResourceKind::Pod, 1);
        assert!(!dispatcher.expectations.satisfied(key));

        let pod = owned_pod(&job, "mnist-worker-0", "pod-uid-0");
        dispatcher.pod_applied(&pod);
        assert!(dispatcher.expectations.satisfied(key));

        // A later update of the same pod is not another creation
        dispatcher
            .expectations
            .expect_creations(key, ReplicaType::Worker, ResourceKind::Pod, 1);
        dispatcher.pod_applied(&pod);
        assert!(!dispatcher.expectations.satisfied(key));
    }

    #[tokio::test]
    async fn pod_deletion_settles_a_deletion_expectation() {
        let dispatcher = dispatcher();
        let job = test_job();
        let key = "default/mnist";
        let pod = owned_pod(&job, "mnist-worker-0", "pod-uid-0");
        dispatcher.pod_applied(&pod);

        dispatcher
            .expectations
            .expect_deletions(key, ReplicaType::Worker, ResourceKind::Pod, 1);
        assert!(!dispatcher.expectations.satisfied(key));

        dispatcher.pod_deleted(&pod);
        assert!(dispatcher.expectations.satisfied(key));
    }

    #[tokio::test]
    async fn unowned_pods_are_ignored() {
        let dispatcher = dispatcher();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("stray".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("stray-uid".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        dispatcher.pod_applied(&pod);
        assert!(dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn service_events_resolve_through_owner() {
        let dispatcher = dispatcher();
        let job = test_job();
        let service = Service {
            metadata: ObjectMeta {
                name: Some("mnist-worker-0".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("svc-uid-0".to_string()),
                labels: Some(BTreeMap::from([(
                    LABEL_REPLICA_TYPE.to_string(),
                    "worker".to_string(),
                )])),
                owner_references: Some(vec![owner_reference(&job)]),
                ..Default::default()
            },
            ..Default::default()
        };
        dispatcher
            .expectations
            .expect_creations("default/mnist", ReplicaType::Worker, ResourceKind::Service, 1);
        dispatcher.service_applied(&service);
        assert!(dispatcher.expectations.satisfied("default/mnist"));
        assert_eq!(dispatcher.queue().len(), 1);
    }
}
