//! Job reconciliation
//!
//! One `sync_job` call is a single level-triggered pass for one job key:
//! snapshot the job from the cache, gate on expectations, detect terminal
//! states, enforce backoff and deadline budgets, fan out per replica group,
//! and commit status only when it actually changed.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use trainops_common::crd::{
    apply_defaults, CleanPodPolicy, JobConditionType, TrainJob, TrainJobStatus,
};
use trainops_common::events::{actions, reasons, EventPublisher};
use trainops_common::{metrics, Result, LABEL_REPLICA_TYPE};

use crate::config::ControllerConfig;
use crate::expectations::Expectations;
use crate::meta::{job_object_ref, split_key};
use crate::status::{append_condition, fold_active_into_succeeded, transition, ReconcileOutcome};
use crate::store::{Mutator, Store};

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

fn is_active(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Pending" | "Running")
}

/// Reconciles one TrainJob per call, against the [`Store`]/[`Mutator`] seams
pub struct JobReconciler {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) mutator: Arc<dyn Mutator>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) expectations: Arc<Expectations>,
    pub(crate) config: ControllerConfig,
}

impl JobReconciler {
    /// Assemble a reconciler from its collaborators.
    ///
    /// All wiring is explicit; the core holds no global state.
    pub fn new(
        store: Arc<dyn Store>,
        mutator: Arc<dyn Mutator>,
        events: Arc<dyn EventPublisher>,
        expectations: Arc<Expectations>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            mutator,
            events,
            expectations,
            config,
        }
    }

    /// Shared expectation registry (wired into the dispatcher's observers)
    pub fn expectations(&self) -> Arc<Expectations> {
        self.expectations.clone()
    }

    /// Run one reconcile pass for the job key `namespace/name`.
    ///
    /// Returns whether the dispatcher should forget the key's failure
    /// history. Must not be invoked concurrently with the same key; the
    /// work queue guarantees that.
    pub async fn sync_job(&self, key: &str, previous_requeues: u32) -> Result<bool> {
        let started = Instant::now();
        let (namespace, name) = split_key(key)?;

        let Some(mut job) = self.store.get_job(namespace, name) else {
            info!(key, "job has been deleted");
            metrics::record_job_deleted();
            self.expectations.forget(key);
            return Ok(true);
        };

        // Reconcile on every event for dynamic-worker jobs; everyone else
        // waits out their in-flight creations and deletions.
        let needs_sync = job.spec.enable_dynamic_worker || self.expectations.satisfied(key);
        if !needs_sync {
            return Ok(true);
        }

        // The job is being torn down; cascade deletion owns the pods now.
        if job.metadata.deletion_timestamp.is_some() {
            return Ok(true);
        }

        apply_defaults(&mut job.spec);

        let result = self.reconcile_job(&mut job, key, previous_requeues).await;
        info!(key, elapsed = ?started.elapsed(), "finished syncing job");
        result.map(|_| true)
    }

    async fn reconcile_job(
        &self,
        job: &mut TrainJob,
        key: &str,
        previous_requeues: u32,
    ) -> Result<()> {
        let old_status = job.status.clone();
        let pods = self.store.list_pods(job);
        let services = self.store.list_services(job);

        let status = job.status.get_or_insert_with(TrainJobStatus::default);

        // Terminal shortcut: nothing left to drive, only to clean up
        if status.is_succeeded() || status.is_failed() {
            let succeeded = status.is_succeeded();
            self.cleanup_finished_job(job, key, &pods).await?;
            if succeeded {
                // The pods are gone; replicas still counted active finished with them
                if let Some(status) = job.status.as_mut() {
                    fold_active_into_succeeded(status);
                }
            }
            return self.commit_status_if_changed(job, &old_status).await;
        }

        // First reconcile stamps the start time, the deadline baseline
        if status.start_time.is_none() {
            status.start_time = Some(Utc::now());
        }

        let name = job.name_any();
        let active = pods.iter().filter(|p| is_active(p)).count() as i32;
        let failed = pods.iter().filter(|p| pod_phase(p) == "Failed").count() as i32;
        let total_replicas = job.spec.total_replicas();
        let prev_failed = old_status
            .as_ref()
            .map(TrainJobStatus::total_failed)
            .unwrap_or(0);

        let mut failure = None;
        if let Some(limit) = job.spec.backoff_limit {
            // A new failure while not all replicas are active, with the
            // requeue budget spent, trips the limit even before restart
            // counts accumulate.
            let job_has_new_failure = failed > prev_failed;
            let exceeds_backoff = job_has_new_failure
                && active != total_replicas
                && (previous_requeues as i32 + 1) > limit;

            if exceeds_backoff || self.past_backoff_limit(job, &pods) {
                failure = Some((
                    reasons::BACKOFF_LIMIT_EXCEEDED,
                    format!("TrainJob {name} has failed because it has reached the specified backoff limit"),
                ));
            }
        }
        if failure.is_none() && self.past_active_deadline(job) {
            failure = Some((
                reasons::DEADLINE_EXCEEDED,
                format!("TrainJob {name} has failed because it was active longer than specified deadline"),
            ));
        }

        if let Some((reason, message)) = failure {
            self.delete_pods_and_services(job, &pods).await?;
            self.cleanup_finished_job(job, key, &[]).await?;

            self.events
                .publish(
                    &job_object_ref(job),
                    EventType::Normal,
                    reasons::TRAIN_JOB_FAILED,
                    actions::CLEANUP,
                    Some(message.clone()),
                )
                .await;

            let status = job.status.get_or_insert_with(TrainJobStatus::default);
            if status.completion_time.is_none() {
                status.completion_time = Some(Utc::now());
            }
            append_condition(status, JobConditionType::Failed, reason, message);
            return self.commit_status_if_changed(job, &old_status).await;
        }

        // Normal path: gang quorum first, then per-group diffing
        if self.config.enable_gang_scheduling {
            if let Err(e) = self.mutator.sync_pod_group(job, total_replicas).await {
                warn!(job = %name, error = %e, "failed to sync pod group");
            }
        }

        let groups = job.spec.replica_groups.clone();
        let mut outcome = ReconcileOutcome::default();
        for (rtype, group) in &groups {
            let group_outcome = self
                .reconcile_pods(job, key, &pods, *rtype, group)
                .await
                .inspect_err(|e| warn!(job = %name, rtype = %rtype, error = %e, "pod reconcile error"))?;
            outcome.merge(group_outcome);

            self.reconcile_services(job, key, &services, *rtype, group)
                .await
                .inspect_err(|e| warn!(job = %name, rtype = %rtype, error = %e, "service reconcile error"))?;
        }

        transition(job, &outcome);
        self.commit_status_if_changed(job, &old_status).await
    }

    /// Tear down everything owned by a finished job
    async fn cleanup_finished_job(&self, job: &mut TrainJob, key: &str, pods: &[Pod]) -> Result<()> {
        self.delete_pods_and_services(job, pods).await?;

        if self.config.enable_gang_scheduling {
            self.mutator.delete_pod_group(job).await?;
        }

        // A zero TTL removes the job object itself right away; longer TTLs
        // are left to a future sweep.
        if job.spec.ttl_seconds_after_finished == Some(0) {
            if let (Some(namespace), Some(name)) =
                (job.metadata.namespace.as_deref(), job.metadata.name.as_deref())
            {
                self.mutator.delete_job(namespace, name).await?;
            }
        }

        self.expectations.forget(key);
        Ok(())
    }

    /// Delete owned pods (and their same-named services) per the clean-pod policy
    async fn delete_pods_and_services(&self, job: &TrainJob, pods: &[Pod]) -> Result<()> {
        if pods.is_empty() {
            return Ok(());
        }
        let policy = job.spec.effective_clean_pod_policy();
        if policy == CleanPodPolicy::None {
            return Ok(());
        }
        let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
        for pod in pods {
            if policy == CleanPodPolicy::Running && !is_active(pod) {
                continue;
            }
            let name = pod.name_any();
            self.mutator.delete_pod(namespace, &name).await?;
            // Pod and service share a name, so the service is addressed
            // through the pod's.
            self.mutator.delete_service(namespace, &name).await?;
        }
        Ok(())
    }

    /// Whether summed container restarts exceed the backoff limit.
    ///
    /// Only groups whose restart policy lets the kubelet restart containers
    /// (OnFailure, Always) accumulate restart counts.
    fn past_backoff_limit(&self, job: &TrainJob, pods: &[Pod]) -> bool {
        let Some(limit) = job.spec.backoff_limit else {
            return false;
        };

        let mut restarts = 0i32;
        for (rtype, group) in &job.spec.replica_groups {
            if !group.effective_restart_policy().counts_toward_backoff() {
                warn!(
                    job = %job.name_any(),
                    rtype = %rtype,
                    "restart policy is not OnFailure or Always, not counted in backoff limit"
                );
                continue;
            }
            for pod in pods {
                let type_matches = pod.labels().get(LABEL_REPLICA_TYPE).map(String::as_str)
                    == Some(rtype.as_lower());
                if !type_matches || !is_active(pod) {
                    continue;
                }
                let Some(status) = pod.status.as_ref() else {
                    continue;
                };
                for cs in status.init_container_statuses.iter().flatten() {
                    restarts += cs.restart_count;
                }
                for cs in status.container_statuses.iter().flatten() {
                    restarts += cs.restart_count;
                }
            }
        }

        if limit == 0 {
            restarts > 0
        } else {
            restarts >= limit
        }
    }

    /// Whether the job has outlived its active deadline
    fn past_active_deadline(&self, job: &TrainJob) -> bool {
        let Some(deadline) = job.spec.active_deadline_seconds else {
            return false;
        };
        let Some(start) = job.status.as_ref().and_then(|s| s.start_time) else {
            return false;
        };
        (Utc::now() - start).num_seconds() >= deadline
    }

    /// Commit status only when it differs from the tick's starting snapshot
    async fn commit_status_if_changed(
        &self,
        job: &TrainJob,
        old_status: &Option<TrainJobStatus>,
    ) -> Result<()> {
        if &job.status == old_status {
            return Ok(());
        }
        self.mutator.update_job_status(job).await
    }
}
