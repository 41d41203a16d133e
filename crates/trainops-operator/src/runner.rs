//! Reflector wiring and stream drivers
//!
//! Starts one watcher+reflector per resource (TrainJob, Pod, Service) and
//! pumps their events into the dispatcher's cache callbacks. Pods and
//! services are watched through the controller's group label, so unrelated
//! cluster traffic never reaches the core.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use trainops_common::crd::TrainJob;
use trainops_common::{GROUP_NAME, LABEL_GROUP_NAME};
use trainops_controller::{Dispatcher, KubeStore};

type EventStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// The three raw reflector streams backing the store
pub struct Streams {
    jobs: EventStream<TrainJob>,
    pods: EventStream<Pod>,
    services: EventStream<Service>,
}

/// Build the reflector stores and their backing streams.
///
/// The streams only fill the stores once polled; callers must hand them to
/// [`drive_streams`] before waiting on cache sync.
pub fn spawn_reflectors(client: Client) -> (KubeStore, Streams) {
    let (job_reader, job_writer) = reflector::store::<TrainJob>();
    let jobs_api: Api<TrainJob> = Api::all(client.clone());
    let jobs = reflector(
        job_writer,
        watcher(jobs_api, watcher::Config::default()).default_backoff(),
    )
    .boxed();

    // Only objects the controller stamps with its group label
    let owned = watcher::Config::default().labels(&format!("{LABEL_GROUP_NAME}={GROUP_NAME}"));

    let (pod_reader, pod_writer) = reflector::store::<Pod>();
    let pods_api: Api<Pod> = Api::all(client.clone());
    let pods = reflector(
        pod_writer,
        watcher(pods_api, owned.clone()).default_backoff(),
    )
    .boxed();

    let (service_reader, service_writer) = reflector::store::<Service>();
    let services_api: Api<Service> = Api::all(client);
    let services = reflector(
        service_writer,
        watcher(services_api, owned).default_backoff(),
    )
    .boxed();

    (
        KubeStore::new(job_reader, pod_reader, service_reader),
        Streams {
            jobs,
            pods,
            services,
        },
    )
}

/// Spawn one pump task per stream, fanning events into the dispatcher
pub fn drive_streams(streams: Streams, dispatcher: Arc<Dispatcher>) -> Vec<JoinHandle<()>> {
    let d = dispatcher.clone();
    let jobs = tokio::spawn(drive(
        streams.jobs,
        "trainjobs",
        move |job| d.job_applied(job),
        {
            let d = dispatcher.clone();
            move |job| d.job_deleted(job)
        },
    ));

    let d = dispatcher.clone();
    let pods = tokio::spawn(drive(
        streams.pods,
        "pods",
        move |pod| d.pod_applied(pod),
        {
            let d = dispatcher.clone();
            move |pod| d.pod_deleted(pod)
        },
    ));

    let d = dispatcher.clone();
    let services = tokio::spawn(drive(
        streams.services,
        "services",
        move |service| d.service_applied(service),
        move |service| dispatcher.service_deleted(service),
    ));

    vec![jobs, pods, services]
}

async fn drive<K>(
    mut stream: EventStream<K>,
    kind: &'static str,
    on_apply: impl Fn(&K),
    on_delete: impl Fn(&K),
) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => on_apply(&obj),
            Ok(watcher::Event::Delete(obj)) => on_delete(&obj),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => warn!(kind, error = %e, "watch error"),
        }
    }
    warn!(kind, "watch stream ended");
}

/// Block until ctrl-c or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received ctrl-c"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, falling back to ctrl-c");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received ctrl-c");
    }
}
