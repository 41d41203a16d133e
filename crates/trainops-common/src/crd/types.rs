//! Shared enums and status building blocks for the TrainJob CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// ReplicaType
// =============================================================================

/// Named role of a replica group within a training job.
///
/// The role determines the topology entry a pod receives and whether its
/// pods are eligible for master-role election.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ReplicaType {
    /// Coordinates the job; always carries the master role when declared
    Chief,
    /// Alias role for Chief used by some frameworks
    Master,
    /// Executes training steps; slot 0 is master-elected when no Chief/Master exists
    Worker,
    /// Parameter server
    PS,
    /// Runs evaluation alongside training
    Evaluator,
}

impl ReplicaType {
    /// Lowercased form used in labels, names, and the topology descriptor
    pub fn as_lower(&self) -> &'static str {
        match self {
            Self::Chief => "chief",
            Self::Master => "master",
            Self::Worker => "worker",
            Self::PS => "ps",
            Self::Evaluator => "evaluator",
        }
    }

    /// Whether pods of this type carry the master role whenever the type is declared
    pub fn is_master_eligible(&self) -> bool {
        matches!(self, Self::Chief | Self::Master)
    }

    /// Whether this is the Worker type (slot 0 fallback master, success sentinel)
    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker)
    }

    /// Parse the lowercased label form back into a type
    pub fn from_lower(s: &str) -> Option<Self> {
        match s {
            "chief" => Some(Self::Chief),
            "master" => Some(Self::Master),
            "worker" => Some(Self::Worker),
            "ps" => Some(Self::PS),
            "evaluator" => Some(Self::Evaluator),
            _ => None,
        }
    }

    /// All known replica types in declaration order
    pub fn all() -> [ReplicaType; 5] {
        [
            Self::Chief,
            Self::Master,
            Self::Worker,
            Self::PS,
            Self::Evaluator,
        ]
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chief => write!(f, "Chief"),
            Self::Master => write!(f, "Master"),
            Self::Worker => write!(f, "Worker"),
            Self::PS => write!(f, "PS"),
            Self::Evaluator => write!(f, "Evaluator"),
        }
    }
}

// =============================================================================
// RestartPolicy
// =============================================================================

/// Restart policy applied to all pods of a replica group.
///
/// `ExitCode` restarts by pod deletion: the pod-level policy is forced to
/// `Never` and the controller recreates the pod when the container exits
/// with a retryable code.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart on failure
    #[default]
    Never,
    /// Let the kubelet restart the container on failure
    OnFailure,
    /// Let the kubelet always restart the container
    Always,
    /// Recreate the pod when the container exits with a retryable code
    ExitCode,
}

impl RestartPolicy {
    /// The pod-level restart policy written into created pod specs
    pub fn pod_level(&self) -> &'static str {
        match self {
            Self::Never | Self::ExitCode => "Never",
            Self::OnFailure => "OnFailure",
            Self::Always => "Always",
        }
    }

    /// Whether container restart counts of this policy count against the backoff limit
    pub fn counts_toward_backoff(&self) -> bool {
        matches!(self, Self::OnFailure | Self::Always)
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::OnFailure => write!(f, "OnFailure"),
            Self::Always => write!(f, "Always"),
            Self::ExitCode => write!(f, "ExitCode"),
        }
    }
}

// =============================================================================
// CleanPodPolicy
// =============================================================================

/// Which pods are removed once the job reaches a terminal state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanPodPolicy {
    /// Remove only pods still running or pending
    #[default]
    Running,
    /// Remove every owned pod
    All,
    /// Keep all pods for post-mortem inspection
    None,
}

// =============================================================================
// Conditions
// =============================================================================

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Lifecycle condition types published on a TrainJob.
///
/// The last condition in the list defines the job's current phase.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobConditionType {
    /// The job has been acknowledged but no pods are scheduled yet
    Created,
    /// At least one pod is running
    Running,
    /// A pod exited with a retryable code and is being recreated
    Restarting,
    /// The job completed successfully
    Succeeded,
    /// The job failed permanently
    Failed,
}

impl JobConditionType {
    /// Whether this condition type ends the job
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Restarting => write!(f, "Restarting"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A single entry in the append-only condition history of a TrainJob
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct JobCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: JobConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl JobCondition {
    /// Create a new true condition with the current timestamp
    pub fn new(
        type_: JobConditionType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

// =============================================================================
// ReplicaStatus
// =============================================================================

/// Observed pod counts for one replica group
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Pods in Pending or Running phase
    #[serde(default)]
    pub active: i32,

    /// Pods that exited successfully
    #[serde(default)]
    pub succeeded: i32,

    /// Pods that exited with an error
    #[serde(default)]
    pub failed: i32,
}
