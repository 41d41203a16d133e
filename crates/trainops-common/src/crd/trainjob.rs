//! TrainJob CRD types
//!
//! Defines `TrainJob` — a distributed training job composed of named replica
//! groups (Chief, Master, Worker, PS, Evaluator), each with its own pod
//! template, replica count, and restart policy. The controller drives pods
//! and per-pod services toward this spec and publishes status back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerPort, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_CONTAINER_NAME, DEFAULT_PORT, DEFAULT_PORT_NAME};

use super::types::{
    CleanPodPolicy, JobCondition, JobConditionType, ReplicaStatus, ReplicaType, RestartPolicy,
};

// =============================================================================
// Replica group
// =============================================================================

/// One named replica group within a TrainJob.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupSpec {
    /// Number of replica slots for this group. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template stamped out for each slot
    pub template: PodTemplateSpec,

    /// Restart policy for pods of this group. Defaults to Never.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

impl ReplicaGroupSpec {
    /// Declared replica count, after defaulting
    pub fn replica_count(&self) -> i32 {
        self.replicas.unwrap_or(1).max(0)
    }

    /// Effective restart policy, after defaulting
    pub fn effective_restart_policy(&self) -> RestartPolicy {
        self.restart_policy.unwrap_or_default()
    }

    /// Port replicas listen on, read from the trainer container's named port.
    ///
    /// Falls back to the default port when the template declares none.
    pub fn port(&self) -> i32 {
        let containers = self
            .template
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();
        containers
            .iter()
            .filter(|c| c.name == DEFAULT_CONTAINER_NAME)
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(DEFAULT_PORT_NAME))
            .map(|p| p.container_port)
            .unwrap_or(DEFAULT_PORT)
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Distributed training job managed by the trainops controller
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trainops.dev",
    version = "v1alpha1",
    kind = "TrainJob",
    plural = "trainjobs",
    shortname = "tj",
    namespaced,
    status = "TrainJobStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[-1:].type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobSpec {
    /// Replica groups keyed by role
    #[serde(default)]
    pub replica_groups: BTreeMap<ReplicaType, ReplicaGroupSpec>,

    /// Budget of container restarts before the job is failed.
    /// Zero means any observed restart fails the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Wall-clock budget in seconds, measured from the job's start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Reconcile on every event even while creations/deletions are in flight.
    /// Required for scaling the Worker group of a live job.
    #[serde(default)]
    pub enable_dynamic_worker: bool,

    /// Which pods survive terminal cleanup. Defaults to Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    /// Seconds to retain the job object after it finishes.
    /// Zero deletes the job immediately after terminal cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

impl TrainJobSpec {
    /// Whether a Chief or Master group is declared.
    ///
    /// Controls master-role election: without one, Worker slot 0 is elected.
    pub fn contains_chief_or_master(&self) -> bool {
        self.replica_groups
            .keys()
            .any(|rt| rt.is_master_eligible())
    }

    /// Sum of declared replicas across all groups
    pub fn total_replicas(&self) -> i32 {
        self.replica_groups
            .values()
            .map(ReplicaGroupSpec::replica_count)
            .sum()
    }

    /// Effective clean-pod policy, after defaulting
    pub fn effective_clean_pod_policy(&self) -> CleanPodPolicy {
        self.clean_pod_policy.unwrap_or_default()
    }
}

/// Status of a TrainJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobStatus {
    /// Per-group observed pod counts
    #[serde(default)]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,

    /// Append-only condition history. The last entry defines the phase.
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    /// Set on the first successful reconcile, never rewritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set once on the terminal transition, never rewritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TrainJobStatus {
    /// The most recent condition, if any
    pub fn last_condition(&self) -> Option<&JobCondition> {
        self.conditions.last()
    }

    /// Current phase as defined by the last condition
    pub fn phase(&self) -> Option<JobConditionType> {
        self.last_condition().map(|c| c.type_)
    }

    /// Whether the job finished successfully
    pub fn is_succeeded(&self) -> bool {
        self.phase() == Some(JobConditionType::Succeeded)
    }

    /// Whether the job failed permanently
    pub fn is_failed(&self) -> bool {
        self.phase() == Some(JobConditionType::Failed)
    }

    /// Whether the job reached a terminal phase
    pub fn is_terminal(&self) -> bool {
        self.phase().is_some_and(|p| p.is_terminal())
    }

    /// Whether a condition of the given type was ever recorded
    pub fn has_condition(&self, type_: JobConditionType) -> bool {
        self.conditions.iter().any(|c| c.type_ == type_)
    }

    /// Sum of failed pods across all groups
    pub fn total_failed(&self) -> i32 {
        self.replica_statuses.values().map(|rs| rs.failed).sum()
    }

    /// Mutable per-group counters, created on first touch
    pub fn replica_status_mut(&mut self, rtype: ReplicaType) -> &mut ReplicaStatus {
        self.replica_statuses.entry(rtype).or_default()
    }
}

// =============================================================================
// Defaulting
// =============================================================================

/// Apply schema defaults to a TrainJob spec in place.
///
/// Fills replica counts, restart policies, the clean-pod policy, and makes
/// sure the trainer container of every template exposes the default port so
/// topology descriptors and services agree on an address.
pub fn apply_defaults(spec: &mut TrainJobSpec) {
    if spec.clean_pod_policy.is_none() {
        spec.clean_pod_policy = Some(CleanPodPolicy::Running);
    }
    for group in spec.replica_groups.values_mut() {
        if group.replicas.is_none() {
            group.replicas = Some(1);
        }
        if group.restart_policy.is_none() {
            group.restart_policy = Some(RestartPolicy::Never);
        }
        ensure_default_port(&mut group.template);
    }
}

/// Add the default named port to the trainer container when it has none
fn ensure_default_port(template: &mut PodTemplateSpec) {
    let Some(pod_spec) = template.spec.as_mut() else {
        return;
    };
    for container in &mut pod_spec.containers {
        if container.name != DEFAULT_CONTAINER_NAME {
            continue;
        }
        let ports = container.ports.get_or_insert_with(Vec::new);
        let has_port = ports
            .iter()
            .any(|p| p.name.as_deref() == Some(DEFAULT_PORT_NAME));
        if !has_port {
            ports.push(ContainerPort {
                name: Some(DEFAULT_PORT_NAME.to_string()),
                container_port: DEFAULT_PORT,
                ..Default::default()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn template_with_trainer() -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DEFAULT_CONTAINER_NAME.to_string(),
                    image: Some("tensorflow/tensorflow:2.15.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_group(replicas: i32) -> ReplicaGroupSpec {
        ReplicaGroupSpec {
            replicas: Some(replicas),
            template: template_with_trainer(),
            restart_policy: None,
        }
    }

    #[test]
    fn defaulting_fills_replicas_and_policies() {
        let mut spec = TrainJobSpec {
            replica_groups: BTreeMap::from([(
                ReplicaType::Worker,
                ReplicaGroupSpec {
                    replicas: None,
                    template: template_with_trainer(),
                    restart_policy: None,
                },
            )]),
            ..Default::default()
        };

        apply_defaults(&mut spec);

        let group = &spec.replica_groups[&ReplicaType::Worker];
        assert_eq!(group.replicas, Some(1));
        assert_eq!(group.restart_policy, Some(RestartPolicy::Never));
        assert_eq!(spec.clean_pod_policy, Some(CleanPodPolicy::Running));
    }

    #[test]
    fn defaulting_injects_trainer_port() {
        let mut spec = TrainJobSpec {
            replica_groups: BTreeMap::from([(ReplicaType::Worker, worker_group(1))]),
            ..Default::default()
        };

        apply_defaults(&mut spec);

        let group = &spec.replica_groups[&ReplicaType::Worker];
        assert_eq!(group.port(), DEFAULT_PORT);
        let ports = group.template.spec.as_ref().unwrap().containers[0]
            .ports
            .as_ref()
            .unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some(DEFAULT_PORT_NAME));
    }

    #[test]
    fn defaulting_keeps_user_declared_port() {
        let mut template = template_with_trainer();
        template.spec.as_mut().unwrap().containers[0].ports = Some(vec![ContainerPort {
            name: Some(DEFAULT_PORT_NAME.to_string()),
            container_port: 5000,
            ..Default::default()
        }]);
        let mut spec = TrainJobSpec {
            replica_groups: BTreeMap::from([(
                ReplicaType::PS,
                ReplicaGroupSpec {
                    replicas: Some(2),
                    template,
                    restart_policy: None,
                },
            )]),
            ..Default::default()
        };

        apply_defaults(&mut spec);

        assert_eq!(spec.replica_groups[&ReplicaType::PS].port(), 5000);
    }

    #[test]
    fn chief_or_master_detection() {
        let mut spec = TrainJobSpec {
            replica_groups: BTreeMap::from([(ReplicaType::Worker, worker_group(2))]),
            ..Default::default()
        };
        assert!(!spec.contains_chief_or_master());

        spec.replica_groups
            .insert(ReplicaType::Chief, worker_group(1));
        assert!(spec.contains_chief_or_master());
        assert_eq!(spec.total_replicas(), 3);
    }

    #[test]
    fn phase_follows_last_condition() {
        let mut status = TrainJobStatus::default();
        assert_eq!(status.phase(), None);
        assert!(!status.is_terminal());

        status
            .conditions
            .push(JobCondition::new(JobConditionType::Created, "r", "m"));
        status
            .conditions
            .push(JobCondition::new(JobConditionType::Running, "r", "m"));
        assert_eq!(status.phase(), Some(JobConditionType::Running));
        assert!(status.has_condition(JobConditionType::Created));

        status
            .conditions
            .push(JobCondition::new(JobConditionType::Succeeded, "r", "m"));
        assert!(status.is_succeeded());
        assert!(status.is_terminal());
        assert!(!status.is_failed());
    }
}
