//! Cluster topology encoding
//!
//! Builds the `TF_CONFIG` JSON descriptor injected into every container of
//! every created pod. Each replica learns the full cluster membership (per
//! type, dense host lists addressed through the per-slot services) plus its
//! own role and slot index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trainops_common::crd::{ReplicaType, TrainJob};
use trainops_common::{Error, Result};

use crate::meta::replica_name;

/// Environment variable name the descriptor is injected under
pub const TF_CONFIG_ENV: &str = "TF_CONFIG";

/// The environment field value; in-cluster jobs always run as "cloud"
const ENVIRONMENT_CLOUD: &str = "cloud";

/// The topology descriptor serialized into `TF_CONFIG`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TfConfig {
    /// Host lists per lowercased replica type
    pub cluster: BTreeMap<String, Vec<String>>,
    /// This replica's own role and slot
    pub task: TaskInfo,
    /// Execution environment marker
    pub environment: String,
}

/// One replica's position within the cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TaskInfo {
    /// Lowercased replica type
    #[serde(rename = "type")]
    pub task_type: String,
    /// Slot index within the type
    pub index: i64,
}

/// Serialize the topology descriptor for one replica.
///
/// Returns an empty string — meaning "do not inject" — for a standalone
/// single-worker job, which needs no cluster coordination.
pub fn cluster_topology_env(job: &TrainJob, rtype: ReplicaType, index: usize) -> Result<String> {
    if is_standalone(job) {
        return Ok(String::new());
    }

    let job_name = job
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::invalid_job("<unnamed>", "job has no name"))?;

    let mut cluster = BTreeMap::new();
    for (rt, group) in &job.spec.replica_groups {
        let port = group.port();
        let hosts = (0..group.replica_count() as usize)
            .map(|i| format!("{}:{}", replica_name(job_name, *rt, i), port))
            .collect();
        cluster.insert(rt.as_lower().to_string(), hosts);
    }

    let config = TfConfig {
        cluster,
        task: TaskInfo {
            task_type: rtype.as_lower().to_string(),
            index: index as i64,
        },
        environment: ENVIRONMENT_CLOUD.to_string(),
    };

    serde_json::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("TfConfig", e.to_string()))
}

/// A job declaring only a single Worker runs standalone
fn is_standalone(job: &TrainJob) -> bool {
    if job.spec.replica_groups.len() != 1 {
        return false;
    }
    job.spec
        .replica_groups
        .get(&ReplicaType::Worker)
        .is_some_and(|g| g.replica_count() <= 1)
}
