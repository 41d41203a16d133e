//! Kubernetes Event recording for the TrainJob controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the reconciliation core can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ExitedWithCode")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored — no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column and in
/// TrainJob conditions. Treat them as a stable API.
pub mod reasons {
    /// A restart policy in the pod template was overwritten by the replica-level policy
    pub const SETTED_POD_TEMPLATE_RESTART_POLICY: &str = "SettedPodTemplateRestartPolicy";
    /// A non-gang scheduler name was found in a template under gang scheduling
    pub const SETTED_POD_TEMPLATE_SCHEDULER_NAME: &str = "SettedPodTemplateSchedulerName";
    /// A trainer container terminated; the note carries the exit code
    pub const EXITED_WITH_CODE: &str = "ExitedWithCode";
    /// A stored object could not be decoded into a TrainJob
    pub const FAILED_MARSHAL_TRAIN_JOB: &str = "FailedMarshalTrainJob";
    /// A slot held more than one pod and the surplus was removed
    pub const DUPLICATE_POD: &str = "DuplicatePod";

    // Condition reasons
    /// Job acknowledged, no pods scheduled yet
    pub const TRAIN_JOB_CREATED: &str = "TrainJobCreated";
    /// At least one pod entered the Running phase
    pub const TRAIN_JOB_RUNNING: &str = "TrainJobRunning";
    /// The job completed successfully
    pub const TRAIN_JOB_SUCCEEDED: &str = "TrainJobSucceeded";
    /// The job failed permanently
    pub const TRAIN_JOB_FAILED: &str = "TrainJobFailed";
    /// A pod is being recreated after a retryable exit
    pub const POD_RESTARTING: &str = "PodRestarting";
    /// The container restart budget was exhausted
    pub const BACKOFF_LIMIT_EXCEEDED: &str = "BackoffLimitExceeded";
    /// The job ran longer than its active deadline
    pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating pods or services
    pub const CREATE: &str = "Create";
    /// Deleting pods or services
    pub const DELETE: &str = "Delete";
    /// Terminal cleanup of owned resources
    pub const CLEANUP: &str = "Cleanup";
}
