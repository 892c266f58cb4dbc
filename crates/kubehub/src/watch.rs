//! List+watch streams feeding controller events.

use std::fmt::Debug;

use classy_core::{AccessRequest, Classifier, ClassifierReport, ClusterRef, CAPI_CLUSTER_KIND, CAPI_GROUP, CAPI_VERSION};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Resource,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Label Cluster API puts on the kubeconfig secret of a cluster.
const CAPI_CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Something changed that may affect one or more classifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FleetEvent {
    Classifier { name: String },
    Report { classifier: String },
    Cluster { cluster: ClusterRef },
    /// Cluster kubeconfig or agent access credential changed.
    Credential { cluster: ClusterRef },
}

/// Start every watcher. Access requests are only watched when reports are pushed by the agent.
pub fn spawn_watchers(client: Client, tx: mpsc::Sender<FleetEvent>, watch_access_requests: bool) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let api: Api<Classifier> = Api::all(client.clone());
    handles.push(tokio::spawn(pump("classifier", api, watcher::Config::default(), tx.clone(), |c: &Classifier| {
        c.metadata.name.clone().map(|name| FleetEvent::Classifier { name })
    })));

    let api: Api<ClassifierReport> = Api::all(client.clone());
    handles.push(tokio::spawn(pump("report", api, watcher::Config::default(), tx.clone(), |r: &ClassifierReport| {
        let classifier = r.classifier_label().map(str::to_string).unwrap_or_else(|| r.spec.classifier_name.clone());
        (!classifier.is_empty()).then_some(FleetEvent::Report { classifier })
    })));

    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, CAPI_CLUSTER_KIND));
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
    handles.push(tokio::spawn(pump("cluster", api, watcher::Config::default(), tx.clone(), |o: &DynamicObject| {
        let cluster = ClusterRef::capi(o.metadata.namespace.clone()?, o.metadata.name.clone()?);
        Some(FleetEvent::Cluster { cluster })
    })));

    let api: Api<Secret> = Api::all(client.clone());
    let cfg = watcher::Config::default().labels(CAPI_CLUSTER_NAME_LABEL);
    handles.push(tokio::spawn(pump("kubeconfig", api, cfg, tx.clone(), |s: &Secret| {
        let name = s.metadata.name.as_deref()?.strip_suffix("-kubeconfig")?;
        Some(FleetEvent::Credential { cluster: ClusterRef::capi(s.metadata.namespace.clone()?, name) })
    })));

    if watch_access_requests {
        let api: Api<AccessRequest> = Api::all(client);
        handles.push(tokio::spawn(pump("access-request", api, watcher::Config::default(), tx, |a: &AccessRequest| {
            Some(FleetEvent::Credential { cluster: ClusterRef::capi(a.spec.namespace.clone(), a.spec.name.clone()) })
        })));
    }
    handles
}

async fn pump<K, F>(what: &'static str, api: Api<K>, cfg: watcher::Config, tx: mpsc::Sender<FleetEvent>, map: F)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(&K) -> Option<FleetEvent> + Send,
{
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(watch = what, "watcher started");
    while let Some(ev) = stream.next().await {
        let objs = match ev {
            Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => vec![o],
            Ok(Event::Restarted(list)) => {
                debug!(watch = what, count = list.len(), "watch restart");
                list
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64);
                warn!(watch = what, error = %e, "watch error");
                continue;
            }
        };
        for o in objs.iter() {
            if let Some(event) = map(o) {
                if tx.send(event).await.is_err() {
                    debug!(watch = what, "event receiver dropped");
                    return;
                }
            }
        }
    }
    warn!(watch = what, "watcher stream ended");
}
