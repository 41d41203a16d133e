//! Pod reconciliation for one replica group
//!
//! Diffs declared slots against observed pods: creates missing occupants
//! (with topology, labels, owner reference, and the mapped restart policy),
//! removes duplicates and scale-down leftovers, applies the ExitCode
//! restart policy, and accumulates per-group status counters.

use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use trainops_common::crd::{ReplicaGroupSpec, ReplicaStatus, ReplicaType, RestartPolicy, TrainJob};
use trainops_common::error::is_timeout;
use trainops_common::events::{actions, reasons};
use trainops_common::{Error, Result, DEFAULT_CONTAINER_NAME, LABEL_REPLICA_TYPE};

use crate::expectations::ResourceKind;
use crate::job::JobReconciler;
use crate::meta::{job_object_ref, owner_reference, replica_labels, replica_name};
use crate::slots::group_by_slot;
use crate::status::ReconcileOutcome;
use crate::tf_config::{cluster_topology_env, TF_CONFIG_ENV};

/// Whether a container exit code warrants pod recreation under the
/// ExitCode policy.
///
/// Codes 1-127 are program-level failures worth retrying; 128+N means the
/// container died to signal N (OOM kill, eviction), which recreation will
/// not fix.
pub fn is_retryable_exit_code(code: i32) -> bool {
    (1..=127).contains(&code)
}

/// Exit code of the trainer container, if it has terminated
fn trainer_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter(|cs| cs.name == DEFAULT_CONTAINER_NAME)
        .find_map(|cs| cs.state.as_ref()?.terminated.as_ref())
        .map(|t| t.exit_code)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

impl JobReconciler {
    /// Reconcile the pods of one replica group.
    ///
    /// Resets and refills the group's status counters for this tick and
    /// returns the accumulated outcome flags.
    pub(crate) async fn reconcile_pods(
        &self,
        job: &mut TrainJob,
        key: &str,
        pods: &[Pod],
        rtype: ReplicaType,
        group: &ReplicaGroupSpec,
    ) -> Result<ReconcileOutcome> {
        let namespace = job
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::invalid_job(job.name_any(), "job has no namespace"))?;

        let type_pods: Vec<Pod> = pods
            .iter()
            .filter(|p| p.labels().get(LABEL_REPLICA_TYPE).map(String::as_str) == Some(rtype.as_lower()))
            .cloned()
            .collect();

        let replicas = group.replica_count();
        let mut outcome = ReconcileOutcome {
            observed_pods: type_pods.len(),
            ..Default::default()
        };

        // Counters are recomputed from scratch every tick
        *job.status
            .get_or_insert_with(Default::default)
            .replica_status_mut(rtype) = ReplicaStatus::default();

        let slots = group_by_slot(type_pods, replicas);
        for (index, mut occupants) in slots.into_iter().enumerate() {
            if occupants.len() > 1 {
                self.delete_surplus_pods(job, key, rtype, index, &namespace, &mut occupants)
                    .await?;
            }

            let Some(pod) = occupants.into_iter().next() else {
                if (index as i32) < replicas {
                    info!(job = %job.name_any(), rtype = %rtype, index, "creating pod for empty slot");
                    self.create_new_pod(job, key, rtype, index, group, &namespace)
                        .await?;
                }
                continue;
            };

            if index as i32 >= replicas {
                // Scale-down leftover; the slot is no longer declared
                info!(job = %job.name_any(), pod = %pod.name_any(), index, "deleting pod beyond declared replicas");
                self.expectations
                    .expect_deletions(key, rtype, ResourceKind::Pod, 1);
                self.mutator.delete_pod(&namespace, &pod.name_any()).await?;
                continue;
            }

            let phase = pod_phase(&pod);
            let exit_code = trainer_exit_code(&pod);
            if let Some(code) = exit_code {
                info!(pod = %pod.name_any(), code, "trainer container exited");
                self.events
                    .publish(
                        &job_object_ref(job),
                        EventType::Normal,
                        reasons::EXITED_WITH_CODE,
                        actions::RECONCILE,
                        Some(format!(
                            "Pod: {}.{} exited with code {}",
                            namespace,
                            pod.name_any(),
                            code
                        )),
                    )
                    .await;
            }

            if group.effective_restart_policy() == RestartPolicy::ExitCode
                && phase == "Failed"
                && exit_code.is_some_and(is_retryable_exit_code)
            {
                info!(pod = %pod.name_any(), "restarting pod after retryable exit");
                self.expectations
                    .expect_deletions(key, rtype, ResourceKind::Pod, 1);
                self.mutator.delete_pod(&namespace, &pod.name_any()).await?;
                outcome.restart = true;
            }

            if rtype.is_worker() && index == 0 && phase == "Succeeded" && exit_code == Some(0) {
                outcome.worker0_completed = true;
            }

            if phase == "Running" {
                outcome.any_running = true;
            }

            let counters = job
                .status
                .get_or_insert_with(Default::default)
                .replica_status_mut(rtype);
            match phase {
                "Pending" | "Running" => counters.active += 1,
                "Succeeded" => counters.succeeded += 1,
                "Failed" => counters.failed += 1,
                _ => {}
            }
        }

        Ok(outcome)
    }

    /// Remove all but the oldest occupant of an over-full slot
    async fn delete_surplus_pods(
        &self,
        job: &TrainJob,
        key: &str,
        rtype: ReplicaType,
        index: usize,
        namespace: &str,
        occupants: &mut Vec<Pod>,
    ) -> Result<()> {
        warn!(
            job = %job.name_any(),
            rtype = %rtype,
            index,
            count = occupants.len(),
            "slot has more than one pod, deleting extras"
        );
        occupants.sort_by_key(|p| p.metadata.creation_timestamp.clone().map(|t| t.0));
        for extra in occupants.drain(1..) {
            self.events
                .publish(
                    &job_object_ref(job),
                    EventType::Warning,
                    reasons::DUPLICATE_POD,
                    actions::DELETE,
                    Some(format!(
                        "Deleting duplicate pod {} for slot {}-{}",
                        extra.name_any(),
                        rtype.as_lower(),
                        index
                    )),
                )
                .await;
            self.expectations
                .expect_deletions(key, rtype, ResourceKind::Pod, 1);
            self.mutator.delete_pod(namespace, &extra.name_any()).await?;
        }
        Ok(())
    }

    /// Create the pod for an empty declared slot
    async fn create_new_pod(
        &self,
        job: &TrainJob,
        key: &str,
        rtype: ReplicaType,
        index: usize,
        group: &ReplicaGroupSpec,
        namespace: &str,
    ) -> Result<()> {
        let job_name = job.name_any();

        // If a Chief/Master is declared its pods carry the master role;
        // otherwise Worker slot 0 is elected.
        let master_role = if job.spec.contains_chief_or_master() {
            rtype.is_master_eligible()
        } else {
            rtype.is_worker() && index == 0
        };

        // Recorded before the RPC so the earliest observation races safely
        self.expectations
            .expect_creations(key, rtype, ResourceKind::Pod, 1);

        let template = group.template.clone();
        let mut pod_spec = template.spec.unwrap_or_default();

        let topology = cluster_topology_env(job, rtype, index)?;
        if !topology.is_empty() {
            for container in &mut pod_spec.containers {
                container.env.get_or_insert_with(Vec::new).push(EnvVar {
                    name: TF_CONFIG_ENV.to_string(),
                    value: Some(topology.clone()),
                    value_from: None,
                });
            }
        }

        if pod_spec
            .restart_policy
            .as_deref()
            .is_some_and(|p| !p.is_empty())
        {
            let msg = "Restart policy in pod template will be overwritten by restart policy in replica spec";
            warn!(job = %job_name, rtype = %rtype, "{msg}");
            self.events
                .publish(
                    &job_object_ref(job),
                    EventType::Warning,
                    reasons::SETTED_POD_TEMPLATE_RESTART_POLICY,
                    actions::CREATE,
                    Some(msg.to_string()),
                )
                .await;
        }
        pod_spec.restart_policy = Some(group.effective_restart_policy().pod_level().to_string());

        // Under gang scheduling a user-chosen scheduler is respected but
        // warned about; otherwise the gang scheduler takes the pod.
        if self.config.enable_gang_scheduling {
            if self.non_gang_scheduler_set(job) {
                let msg = "Another scheduler is specified when gang-scheduling is enabled and it will not be overwritten";
                warn!(job = %job_name, "{msg}");
                self.events
                    .publish(
                        &job_object_ref(job),
                        EventType::Warning,
                        reasons::SETTED_POD_TEMPLATE_SCHEDULER_NAME,
                        actions::CREATE,
                        Some(msg.to_string()),
                    )
                    .await;
            } else {
                pod_spec.scheduler_name = Some(self.config.gang_scheduler_name.clone());
            }
        }

        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.extend(replica_labels(&job_name, rtype, index, master_role));

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(replica_name(&job_name, rtype, index)),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                annotations: template.metadata.and_then(|m| m.annotations),
                owner_references: Some(vec![owner_reference(job)]),
                ..Default::default()
            },
            spec: Some(pod_spec),
            ..Default::default()
        };

        match self.mutator.create_pod(namespace, &pod).await {
            Ok(()) => Ok(()),
            // The create may still have landed; the watch observation or
            // the expectation expiry settles it either way.
            Err(Error::Kube { source }) if is_timeout(&source) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether any template picks a scheduler other than the gang scheduler
    pub(crate) fn non_gang_scheduler_set(&self, job: &TrainJob) -> bool {
        job.spec.replica_groups.values().any(|group| {
            group
                .template
                .spec
                .as_ref()
                .and_then(|s| s.scheduler_name.as_deref())
                .is_some_and(|name| !name.is_empty() && name != self.config.gang_scheduler_name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_failures_are_retryable() {
        assert!(is_retryable_exit_code(1));
        assert!(is_retryable_exit_code(2));
        assert!(is_retryable_exit_code(127));
    }

    #[test]
    fn signal_exits_are_not_retryable() {
        assert!(!is_retryable_exit_code(128));
        assert!(!is_retryable_exit_code(137)); // SIGKILL
        assert!(!is_retryable_exit_code(143)); // SIGTERM
    }

    #[test]
    fn clean_exit_is_not_retryable() {
        assert!(!is_retryable_exit_code(0));
        assert!(!is_retryable_exit_code(-1));
    }
}
