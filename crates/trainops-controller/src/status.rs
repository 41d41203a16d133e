//! Status transition logic
//!
//! Computes the next condition set from the per-group outcomes of one
//! reconcile tick. Conditions are append-only and idempotent: re-appending
//! the `(type, reason)` of the current last entry is a no-op, and once a
//! terminal condition is last, nothing further is ever appended.

use chrono::Utc;
use tracing::info;

use trainops_common::crd::{JobCondition, JobConditionType, TrainJob, TrainJobStatus};
use trainops_common::events::reasons;

/// Accumulated per-group outcomes of one reconcile tick
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileOutcome {
    /// A pod was deleted for recreation under the ExitCode policy
    pub restart: bool,
    /// Worker slot 0 exited cleanly
    pub worker0_completed: bool,
    /// At least one pod is in the Running phase
    pub any_running: bool,
    /// Total pods observed across all groups
    pub observed_pods: usize,
}

impl ReconcileOutcome {
    /// Merge one group's outcome into the job-wide accumulator
    pub fn merge(&mut self, other: ReconcileOutcome) {
        self.restart |= other.restart;
        self.worker0_completed |= other.worker0_completed;
        self.any_running |= other.any_running;
        self.observed_pods += other.observed_pods;
    }
}

/// Append a condition unless it repeats the current last entry.
///
/// Returns whether the condition was actually appended.
pub fn append_condition(
    status: &mut TrainJobStatus,
    type_: JobConditionType,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    if let Some(last) = status.conditions.last() {
        if last.type_ == type_ && last.reason == reason {
            return false;
        }
    }
    status
        .conditions
        .push(JobCondition::new(type_, reason, message));
    true
}

/// Fold remaining active counts into succeeded after a successful finish.
///
/// The pods are gone (or going); counting them active forever would
/// misreport a finished job.
pub fn fold_active_into_succeeded(status: &mut TrainJobStatus) {
    for rs in status.replica_statuses.values_mut() {
        rs.succeeded += rs.active;
        rs.active = 0;
    }
}

/// Whether a declared Chief/Master group has run all its pods to success
fn chief_or_master_succeeded(job: &TrainJob) -> bool {
    let Some(status) = job.status.as_ref() else {
        return false;
    };
    let mut found = false;
    for (rtype, group) in &job.spec.replica_groups {
        if !rtype.is_master_eligible() || group.replica_count() == 0 {
            continue;
        }
        found = true;
        let succeeded = status
            .replica_statuses
            .get(rtype)
            .map(|rs| rs.succeeded)
            .unwrap_or(0);
        if succeeded < group.replica_count() {
            return false;
        }
    }
    found
}

/// Apply the tick's outcome to the job's conditions.
///
/// Precedence: success beats running beats restarting beats created. A job
/// whose last condition is terminal is never transitioned again.
pub fn transition(job: &mut TrainJob, outcome: &ReconcileOutcome) {
    let succeeded = outcome.worker0_completed || chief_or_master_succeeded(job);
    let name = job.metadata.name.clone().unwrap_or_default();
    let status = job.status.get_or_insert_with(TrainJobStatus::default);

    if status.is_terminal() {
        return;
    }

    if succeeded {
        if append_condition(
            status,
            JobConditionType::Succeeded,
            reasons::TRAIN_JOB_SUCCEEDED,
            format!("TrainJob {name} successfully completed."),
        ) {
            info!(job = %name, "job succeeded");
        }
        if status.completion_time.is_none() {
            status.completion_time = Some(Utc::now());
        }
        fold_active_into_succeeded(status);
    } else if outcome.any_running {
        if !status.has_condition(JobConditionType::Running) {
            append_condition(
                status,
                JobConditionType::Running,
                reasons::TRAIN_JOB_RUNNING,
                format!("TrainJob {name} is running."),
            );
        }
        if status.start_time.is_none() {
            status.start_time = Some(Utc::now());
        }
    } else if outcome.restart {
        append_condition(
            status,
            JobConditionType::Restarting,
            reasons::POD_RESTARTING,
            format!("TrainJob {name} is restarting a failed pod."),
        );
    } else if outcome.observed_pods == 0 {
        append_condition(
            status,
            JobConditionType::Created,
            reasons::TRAIN_JOB_CREATED,
            format!("TrainJob {name} is created."),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use trainops_common::crd::{
        ReplicaGroupSpec, ReplicaStatus, ReplicaType, TrainJobSpec,
    };

    fn job_with(groups: BTreeMap<ReplicaType, ReplicaGroupSpec>) -> TrainJob {
        let mut job = TrainJob::new(
            "mnist",
            TrainJobSpec {
                replica_groups: groups,
                ..Default::default()
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.status = Some(TrainJobStatus::default());
        job
    }

    fn group(replicas: i32) -> ReplicaGroupSpec {
        ReplicaGroupSpec {
            replicas: Some(replicas),
            template: Default::default(),
            restart_policy: None,
        }
    }

    #[test]
    fn repeating_last_condition_is_a_noop() {
        let mut status = TrainJobStatus::default();
        assert!(append_condition(
            &mut status,
            JobConditionType::Created,
            reasons::TRAIN_JOB_CREATED,
            "m"
        ));
        assert!(!append_condition(
            &mut status,
            JobConditionType::Created,
            reasons::TRAIN_JOB_CREATED,
            "m"
        ));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn different_reason_appends() {
        let mut status = TrainJobStatus::default();
        append_condition(&mut status, JobConditionType::Failed, "A", "m");
        append_condition(&mut status, JobConditionType::Failed, "B", "m");
        assert_eq!(status.conditions.len(), 2);
    }

    #[test]
    fn empty_tick_appends_created() {
        let mut job = job_with(BTreeMap::from([(ReplicaType::Worker, group(2))]));
        transition(&mut job, &ReconcileOutcome::default());
        let status = job.status.as_ref().unwrap();
        assert_eq!(status.phase(), Some(JobConditionType::Created));
    }

    #[test]
    fn running_pod_appends_running_once() {
        let mut job = job_with(BTreeMap::from([(ReplicaType::Worker, group(2))]));
        let outcome = ReconcileOutcome {
            any_running: true,
            observed_pods: 2,
            ..Default::default()
        };
        transition(&mut job, &outcome);
        transition(&mut job, &outcome);
        let status = job.status.as_ref().unwrap();
        assert_eq!(status.phase(), Some(JobConditionType::Running));
        assert_eq!(status.conditions.len(), 1);
        assert!(status.start_time.is_some());
    }

    #[test]
    fn restart_does_not_clear_running_history() {
        let mut job = job_with(BTreeMap::from([(ReplicaType::Worker, group(2))]));
        transition(
            &mut job,
            &ReconcileOutcome {
                any_running: true,
                observed_pods: 2,
                ..Default::default()
            },
        );
        transition(
            &mut job,
            &ReconcileOutcome {
                restart: true,
                any_running: true,
                observed_pods: 2,
                ..Default::default()
            },
        );
        let status = job.status.as_ref().unwrap();
        assert_eq!(status.phase(), Some(JobConditionType::Restarting));
        assert!(status.has_condition(JobConditionType::Running));
    }

    #[test]
    fn worker0_completion_wins_over_running() {
        let mut job = job_with(BTreeMap::from([(ReplicaType::Worker, group(2))]));
        job.status
            .as_mut()
            .unwrap()
            .replica_statuses
            .insert(
                ReplicaType::Worker,
                ReplicaStatus {
                    active: 1,
                    succeeded: 1,
                    failed: 0,
                },
            );
        transition(
            &mut job,
            &ReconcileOutcome {
                worker0_completed: true,
                any_running: true,
                observed_pods: 2,
                ..Default::default()
            },
        );
        let status = job.status.as_ref().unwrap();
        assert!(status.is_succeeded());
        assert!(status.completion_time.is_some());
        // active folded into succeeded
        let ws = status.replica_statuses[&ReplicaType::Worker];
        assert_eq!(ws.active, 0);
        assert_eq!(ws.succeeded, 2);
    }

    #[test]
    fn chief_success_finishes_the_job() {
        let mut job = job_with(BTreeMap::from([
            (ReplicaType::Chief, group(1)),
            (ReplicaType::Worker, group(2)),
        ]));
        job.status.as_mut().unwrap().replica_statuses.insert(
            ReplicaType::Chief,
            ReplicaStatus {
                active: 0,
                succeeded: 1,
                failed: 0,
            },
        );
        transition(
            &mut job,
            &ReconcileOutcome {
                observed_pods: 2,
                any_running: true,
                ..Default::default()
            },
        );
        assert!(job.status.as_ref().unwrap().is_succeeded());
    }

    #[test]
    fn zero_replica_chief_cannot_claim_success() {
        let mut job = job_with(BTreeMap::from([
            (ReplicaType::Chief, group(0)),
            (ReplicaType::Worker, group(2)),
        ]));
        transition(
            &mut job,
            &ReconcileOutcome {
                any_running: true,
                observed_pods: 2,
                ..Default::default()
            },
        );
        assert!(!job.status.as_ref().unwrap().is_succeeded());
    }

    #[test]
    fn terminal_jobs_never_transition_again() {
        let mut job = job_with(BTreeMap::from([(ReplicaType::Worker, group(1))]));
        let status = job.status.as_mut().unwrap();
        append_condition(
            status,
            JobConditionType::Failed,
            reasons::DEADLINE_EXCEEDED,
            "m",
        );
        transition(
            &mut job,
            &ReconcileOutcome {
                any_running: true,
                worker0_completed: true,
                observed_pods: 1,
                ..Default::default()
            },
        );
        let status = job.status.as_ref().unwrap();
        assert!(status.is_failed());
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn fold_moves_all_active_counts() {
        let mut status = TrainJobStatus::default();
        status.replica_statuses.insert(
            ReplicaType::Worker,
            ReplicaStatus {
                active: 3,
                succeeded: 1,
                failed: 0,
            },
        );
        status.replica_statuses.insert(
            ReplicaType::PS,
            ReplicaStatus {
                active: 2,
                succeeded: 0,
                failed: 0,
            },
        );
        fold_active_into_succeeded(&mut status);
        assert_eq!(status.replica_statuses[&ReplicaType::Worker].succeeded, 4);
        assert_eq!(status.replica_statuses[&ReplicaType::Worker].active, 0);
        assert_eq!(status.replica_statuses[&ReplicaType::PS].succeeded, 2);
    }
}
