//! Object metadata helpers: keys, names, labels, owner references

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use trainops_common::crd::{ReplicaType, TrainJob};
use trainops_common::{
    Error, Result, GROUP_NAME, JOB_ROLE_MASTER, LABEL_GROUP_NAME, LABEL_JOB_NAME, LABEL_JOB_ROLE,
    LABEL_REPLICA_INDEX, LABEL_REPLICA_TYPE,
};

/// Work-queue key of a job: `namespace/name`.
///
/// Returns None for jobs missing either field (should not happen for
/// namespaced resources served by the API).
pub fn job_key(job: &TrainJob) -> Option<String> {
    let namespace = job.meta().namespace.as_deref()?;
    let name = job.meta().name.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

/// Split a work-queue key back into `(namespace, name)`
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok((ns, name)),
        _ => Err(Error::invalid_key(key)),
    }
}

/// Name of the pod and service occupying a slot: `<job>-<type>-<index>`
pub fn replica_name(job_name: &str, rtype: ReplicaType, index: usize) -> String {
    format!("{}-{}-{}", job_name, rtype.as_lower(), index)
}

/// Labels stamped on every pod and service the controller creates.
///
/// `job-name` is deprecated in favor of selecting on `group-name` plus the
/// owner reference, but older tooling still filters on it.
pub fn replica_labels(
    job_name: &str,
    rtype: ReplicaType,
    index: usize,
    master_role: bool,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_GROUP_NAME.to_string(), GROUP_NAME.to_string());
    labels.insert(LABEL_JOB_NAME.to_string(), job_name.to_string());
    labels.insert(
        LABEL_REPLICA_TYPE.to_string(),
        rtype.as_lower().to_string(),
    );
    labels.insert(LABEL_REPLICA_INDEX.to_string(), index.to_string());
    if master_role {
        labels.insert(LABEL_JOB_ROLE.to_string(), JOB_ROLE_MASTER.to_string());
    }
    labels
}

/// Controller owner reference pointing back at the job.
///
/// `controller: true` makes the back-edge resolvable from pod events, and
/// `blockOwnerDeletion` lets cascade deletion wait on owned objects.
pub fn owner_reference(job: &TrainJob) -> OwnerReference {
    OwnerReference {
        api_version: TrainJob::api_version(&()).into_owned(),
        kind: TrainJob::kind(&()).into_owned(),
        name: job.name_any(),
        uid: job.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Object reference used when recording events on the job
pub fn job_object_ref(job: &TrainJob) -> ObjectReference {
    ObjectReference {
        api_version: Some(TrainJob::api_version(&()).into_owned()),
        kind: Some(TrainJob::kind(&()).into_owned()),
        name: job.meta().name.clone(),
        namespace: job.meta().namespace.clone(),
        uid: job.meta().uid.clone(),
        ..Default::default()
    }
}

/// The controller owner reference of an object, if it points at a TrainJob
pub fn train_job_controller_ref(owner_refs: &[OwnerReference]) -> Option<&OwnerReference> {
    owner_refs
        .iter()
        .find(|or| or.controller == Some(true) && or.kind == TrainJob::kind(&()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use trainops_common::crd::TrainJobSpec;

    fn job(namespace: &str, name: &str) -> TrainJob {
        let mut job = TrainJob::new(name, TrainJobSpec::default());
        job.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        };
        job
    }

    #[test]
    fn key_roundtrip() {
        let job = job("default", "mnist");
        let key = job_key(&job).unwrap();
        assert_eq!(key, "default/mnist");
        let (ns, name) = split_key(&key).unwrap();
        assert_eq!((ns, name), ("default", "mnist"));
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(split_key("no-slash").is_err());
        assert!(split_key("/name").is_err());
        assert!(split_key("ns/").is_err());
    }

    #[test]
    fn replica_names_encode_type_and_index() {
        assert_eq!(
            replica_name("mnist", ReplicaType::Worker, 0),
            "mnist-worker-0"
        );
        assert_eq!(replica_name("mnist", ReplicaType::PS, 3), "mnist-ps-3");
    }

    #[test]
    fn labels_carry_identity_and_optional_role() {
        let labels = replica_labels("mnist", ReplicaType::Worker, 1, false);
        assert_eq!(labels[LABEL_REPLICA_TYPE], "worker");
        assert_eq!(labels[LABEL_REPLICA_INDEX], "1");
        assert_eq!(labels[LABEL_GROUP_NAME], GROUP_NAME);
        assert_eq!(labels[LABEL_JOB_NAME], "mnist");
        assert!(!labels.contains_key(LABEL_JOB_ROLE));

        let labels = replica_labels("mnist", ReplicaType::Chief, 0, true);
        assert_eq!(labels[LABEL_JOB_ROLE], JOB_ROLE_MASTER);
    }

    #[test]
    fn owner_reference_is_controller() {
        let job = job("default", "mnist");
        let or = owner_reference(&job);
        assert_eq!(or.kind, "TrainJob");
        assert_eq!(or.name, "mnist");
        assert_eq!(or.uid, "uid-1");
        assert_eq!(or.controller, Some(true));
    }

    #[test]
    fn controller_ref_lookup_ignores_non_controllers() {
        let job = job("default", "mnist");
        let mut or = owner_reference(&job);
        or.controller = Some(false);
        assert!(train_job_controller_ref(&[or.clone()]).is_none());
        or.controller = Some(true);
        assert!(train_job_controller_ref(&[or]).is_some());
    }
}
