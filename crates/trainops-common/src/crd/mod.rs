//! Custom Resource Definitions for the TrainJob operator
//!
//! This module contains the TrainJob CRD and the shared status types
//! published on it.

mod trainjob;
mod types;

pub use trainjob::{
    apply_defaults, ReplicaGroupSpec, TrainJob, TrainJobSpec, TrainJobStatus,
};
pub use types::{
    CleanPodPolicy, ConditionStatus, JobCondition, JobConditionType, ReplicaStatus, ReplicaType,
    RestartPolicy,
};
