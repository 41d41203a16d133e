//! kube-batch PodGroup serialization types
//!
//! Typed representation of `scheduling.incubator.k8s.io/v1alpha1` PodGroup
//! resources, the gang-scheduling unit covering all pods of one job. Uses
//! serde for JSON serialization compatible with server-side apply.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use trainops_common::crd::TrainJob;
use trainops_common::{Error, Result};

use crate::meta::owner_reference;

/// API group of the kube-batch PodGroup resource
pub const POD_GROUP_GROUP: &str = "scheduling.incubator.k8s.io";
/// API version of the kube-batch PodGroup resource
pub const POD_GROUP_VERSION: &str = "v1alpha1";

/// PodGroup resource (`scheduling.incubator.k8s.io/v1alpha1` Kind: PodGroup)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroup {
    pub api_version: String,
    pub kind: String,
    pub metadata: PodGroupMetadata,
    pub spec: PodGroupSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

/// PodGroup spec; the scheduler admits the group only once `min_member`
/// pods can all be placed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupSpec {
    pub min_member: i32,
}

/// Build the PodGroup for a job.
///
/// Named after the job, owner-referenced to it so cascade deletion covers
/// the gang artifact, with `min_member` equal to the job's total declared
/// replicas.
pub fn pod_group_for(job: &TrainJob, min_member: i32) -> Result<PodGroup> {
    let name = job
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::invalid_job("<unnamed>", "job has no name"))?;
    let namespace = job
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| Error::invalid_job(&name, "job has no namespace"))?;

    Ok(PodGroup {
        api_version: format!("{POD_GROUP_GROUP}/{POD_GROUP_VERSION}"),
        kind: "PodGroup".to_string(),
        metadata: PodGroupMetadata {
            name,
            namespace,
            labels: BTreeMap::new(),
            owner_references: vec![owner_reference(job)],
        },
        spec: PodGroupSpec { min_member },
    })
}

/// API resource descriptor for addressing PodGroups through a dynamic client
pub fn pod_group_api_resource() -> ApiResource {
    ApiResource {
        group: POD_GROUP_GROUP.to_string(),
        version: POD_GROUP_VERSION.to_string(),
        api_version: format!("{POD_GROUP_GROUP}/{POD_GROUP_VERSION}"),
        kind: "PodGroup".to_string(),
        plural: "podgroups".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainops_common::crd::TrainJobSpec;

    fn job() -> TrainJob {
        let mut job = TrainJob::new("mnist", TrainJobSpec::default());
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some("uid-1".to_string());
        job
    }

    #[test]
    fn pod_group_carries_min_member_and_owner() {
        let pg = pod_group_for(&job(), 3).unwrap();
        assert_eq!(pg.metadata.name, "mnist");
        assert_eq!(pg.metadata.namespace, "default");
        assert_eq!(pg.spec.min_member, 3);
        assert_eq!(pg.metadata.owner_references.len(), 1);
        assert_eq!(pg.metadata.owner_references[0].kind, "TrainJob");
    }

    #[test]
    fn serialization_roundtrip() {
        let pg = pod_group_for(&job(), 2).unwrap();
        let json = serde_json::to_value(&pg).unwrap();
        assert_eq!(json["apiVersion"], "scheduling.incubator.k8s.io/v1alpha1");
        assert_eq!(json["spec"]["minMember"], 2);
        let de: PodGroup = serde_json::from_value(json).unwrap();
        assert_eq!(pg, de);
    }

    #[test]
    fn api_resource_addresses_podgroups() {
        let ar = pod_group_api_resource();
        assert_eq!(ar.plural, "podgroups");
        assert_eq!(ar.api_version, "scheduling.incubator.k8s.io/v1alpha1");
    }
}
