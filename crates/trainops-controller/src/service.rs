//! Service reconciliation for one replica group
//!
//! Every declared slot gets a headless service named like its pod, so each
//! replica has a stable DNS address for the topology descriptor. Only
//! existence is diffed; a service's content never changes after creation.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use trainops_common::crd::{ReplicaGroupSpec, ReplicaType, TrainJob};
use trainops_common::error::is_timeout;
use trainops_common::events::{actions, reasons};
use trainops_common::{Error, Result, DEFAULT_PORT_NAME, LABEL_REPLICA_TYPE};

use crate::expectations::ResourceKind;
use crate::job::JobReconciler;
use crate::meta::{job_object_ref, owner_reference, replica_labels, replica_name};
use crate::slots::group_by_slot;

impl JobReconciler {
    /// Reconcile the services of one replica group
    pub(crate) async fn reconcile_services(
        &self,
        job: &TrainJob,
        key: &str,
        services: &[Service],
        rtype: ReplicaType,
        group: &ReplicaGroupSpec,
    ) -> Result<()> {
        let namespace = job
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::invalid_job(job.name_any(), "job has no namespace"))?;

        let type_services: Vec<Service> = services
            .iter()
            .filter(|s| s.labels().get(LABEL_REPLICA_TYPE).map(String::as_str) == Some(rtype.as_lower()))
            .cloned()
            .collect();

        let replicas = group.replica_count();
        let slots = group_by_slot(type_services, replicas);
        for (index, mut occupants) in slots.into_iter().enumerate() {
            if occupants.len() > 1 {
                warn!(
                    job = %job.name_any(),
                    rtype = %rtype,
                    index,
                    count = occupants.len(),
                    "slot has more than one service, deleting extras"
                );
                occupants.sort_by_key(|s| s.metadata.creation_timestamp.clone().map(|t| t.0));
                for extra in occupants.drain(1..) {
                    self.events
                        .publish(
                            &job_object_ref(job),
                            EventType::Warning,
                            reasons::DUPLICATE_POD,
                            actions::DELETE,
                            Some(format!(
                                "Deleting duplicate service {} for slot {}-{}",
                                extra.name_any(),
                                rtype.as_lower(),
                                index
                            )),
                        )
                        .await;
                    self.expectations
                        .expect_deletions(key, rtype, ResourceKind::Service, 1);
                    self.mutator
                        .delete_service(&namespace, &extra.name_any())
                        .await?;
                }
            }

            let occupant = occupants.into_iter().next();
            match occupant {
                None if (index as i32) < replicas => {
                    info!(job = %job.name_any(), rtype = %rtype, index, "creating service for empty slot");
                    self.create_new_service(job, key, rtype, index, group, &namespace)
                        .await?;
                }
                Some(service) if index as i32 >= replicas => {
                    info!(
                        job = %job.name_any(),
                        service = %service.name_any(),
                        index,
                        "deleting service beyond declared replicas"
                    );
                    self.expectations
                        .expect_deletions(key, rtype, ResourceKind::Service, 1);
                    self.mutator
                        .delete_service(&namespace, &service.name_any())
                        .await?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Create the headless service for an empty declared slot
    async fn create_new_service(
        &self,
        job: &TrainJob,
        key: &str,
        rtype: ReplicaType,
        index: usize,
        group: &ReplicaGroupSpec,
        namespace: &str,
    ) -> Result<()> {
        let job_name = job.name_any();

        self.expectations
            .expect_creations(key, rtype, ResourceKind::Service, 1);

        let labels = replica_labels(&job_name, rtype, index, false);
        let port = group.port();

        let service = Service {
            metadata: ObjectMeta {
                name: Some(replica_name(&job_name, rtype, index)),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner_reference(job)]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(labels.into_iter().collect()),
                ports: Some(vec![ServicePort {
                    name: Some(DEFAULT_PORT_NAME.to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.mutator.create_service(namespace, &service).await {
            Ok(()) => Ok(()),
            Err(Error::Kube { source }) if is_timeout(&source) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
