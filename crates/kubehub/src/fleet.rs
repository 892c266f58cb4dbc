//! Management cluster access through a kube [`Client`].

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use classy_core::{
    access_request_name, AccessRequest, AccessRequestSpec, ApiEndpoint, Classifier, ClassifierReport, ClassifierStatus,
    ClusterRef, ControlPlaneEndpoint, ManagedCluster, ACCESS_REQUEST_LABEL, ACCESS_REQUEST_TYPE_AGENT, CAPI_CLUSTER_KIND,
    CAPI_GROUP, CAPI_VERSION,
};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde_json::json;
use tracing::{debug, info};

use crate::{is_not_found, managed_cluster_from, FleetApi, ReportSelector};

/// Field manager for every write made by the controller.
pub const FIELD_MANAGER: &str = "classy";

#[derive(Clone)]
pub struct KubeFleetApi {
    client: Client,
    cluster_ar: ApiResource,
}

impl KubeFleetApi {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(CAPI_GROUP, CAPI_VERSION, CAPI_CLUSTER_KIND);
        Self { client, cluster_ar: ApiResource::from_gvk(&gvk) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn classifiers(&self) -> Api<Classifier> {
        Api::all(self.client.clone())
    }

    fn clusters_in(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.cluster_ar)
    }
}

#[async_trait::async_trait]
impl FleetApi for KubeFleetApi {
    async fn get_classifier(&self, name: &str) -> Result<Option<Classifier>> {
        self.classifiers().get_opt(name).await.with_context(|| format!("getting classifier {}", name))
    }

    async fn list_classifiers(&self) -> Result<Vec<Classifier>> {
        let list = self.classifiers().list(&ListParams::default()).await.context("listing classifiers")?;
        Ok(list.items)
    }

    async fn update_classifier_status(&self, name: &str, status: &ClassifierStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.classifiers()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating status of classifier {}", name))?;
        debug!(classifier = name, clusters = status.cluster_info.len(), "classifier status written");
        Ok(())
    }

    async fn set_classifier_finalizers(&self, name: &str, finalizers: &[String]) -> Result<()> {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.classifiers()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("setting finalizers on classifier {}", name))?;
        Ok(())
    }

    async fn get_cluster(&self, cluster: &ClusterRef) -> Result<Option<ManagedCluster>> {
        let obj = self
            .clusters_in(&cluster.namespace)
            .get_opt(&cluster.name)
            .await
            .with_context(|| format!("getting cluster {}", cluster))?;
        Ok(obj.as_ref().and_then(managed_cluster_from))
    }

    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.cluster_ar);
        let list = api.list(&ListParams::default()).await.context("listing clusters")?;
        Ok(list.items.iter().filter_map(managed_cluster_from).collect())
    }

    async fn merge_cluster_labels(&self, cluster: &ClusterRef, labels: &BTreeMap<String, String>) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let patch = json!({ "metadata": { "labels": labels } });
        self.clusters_in(&cluster.namespace)
            .patch(&cluster.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("labelling cluster {}", cluster))?;
        debug!(cluster = %cluster, count = labels.len(), "cluster labels merged");
        Ok(())
    }

    async fn list_reports(&self, selector: &ReportSelector) -> Result<Vec<ClassifierReport>> {
        let lp = ListParams::default().labels(&selector.label_selector());
        let api: Api<ClassifierReport> = match selector {
            ReportSelector::Cluster(c) => Api::namespaced(self.client.clone(), &c.namespace),
            _ => Api::all(self.client.clone()),
        };
        let list = api.list(&lp).await.with_context(|| format!("listing reports ({:?})", selector))?;
        Ok(list.items)
    }

    async fn upsert_report(&self, report: &ClassifierReport) -> Result<()> {
        let name = report.metadata.name.clone().context("report without name")?;
        let namespace = report.metadata.namespace.clone().context("report without namespace")?;
        let mut obj = ClassifierReport::new(&name, report.spec.clone());
        obj.metadata.namespace = Some(namespace.clone());
        obj.metadata.labels = report.metadata.labels.clone();
        let api: Api<ClassifierReport> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .with_context(|| format!("writing report {}/{}", namespace, name))?;
        Ok(())
    }

    async fn delete_report(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ClassifierReport> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting report {}/{}", namespace, name)),
        }
    }

    async fn delete_reports(&self, selector: &ReportSelector) -> Result<usize> {
        let reports = self.list_reports(selector).await?;
        for r in reports.iter() {
            let (Some(ns), Some(name)) = (r.metadata.namespace.as_deref(), r.metadata.name.as_deref()) else { continue };
            self.delete_report(ns, name).await?;
        }
        if !reports.is_empty() {
            info!(count = reports.len(), selector = ?selector, "reports deleted");
        }
        Ok(reports.len())
    }

    async fn ensure_access_request(&self, cluster: &ClusterRef, endpoint: &ControlPlaneEndpoint) -> Result<()> {
        let name = access_request_name(cluster);
        let api: Api<AccessRequest> = Api::namespaced(self.client.clone(), &cluster.namespace);
        if api.get_opt(&name).await.with_context(|| format!("getting access request {}", name))?.is_some() {
            return Ok(());
        }
        let mut ar = AccessRequest::new(
            &name,
            AccessRequestSpec {
                namespace: cluster.namespace.clone(),
                name: cluster.name.clone(),
                request_type: ACCESS_REQUEST_TYPE_AGENT.to_string(),
                control_plane_endpoint: ApiEndpoint { host: endpoint.host_with_scheme(), port: endpoint.port },
            },
        );
        ar.metadata.namespace = Some(cluster.namespace.clone());
        ar.metadata.labels = Some(BTreeMap::from([(ACCESS_REQUEST_LABEL.to_string(), "ok".to_string())]));
        match api.create(&PostParams::default(), &ar).await {
            Ok(_) => {
                info!(cluster = %cluster, name = %name, "access request created");
                Ok(())
            }
            // Lost a race with another worker.
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("creating access request {}", name)),
        }
    }

    async fn access_request_kubeconfig(&self, cluster: &ClusterRef) -> Result<Option<Vec<u8>>> {
        let name = access_request_name(cluster);
        let api: Api<AccessRequest> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let Some(ar) = api.get_opt(&name).await.with_context(|| format!("getting access request {}", name))? else {
            return Ok(None);
        };
        let Some(secret_ref) = ar.status.and_then(|s| s.secret_ref) else {
            debug!(cluster = %cluster, "access request has no secret yet");
            return Ok(None);
        };
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = secrets
            .get_opt(&secret_ref.name)
            .await
            .with_context(|| format!("getting secret {}/{}", secret_ref.namespace, secret_ref.name))?;
        Ok(secret.and_then(|s| s.data).and_then(|d| d.into_values().next()).map(|b| b.0))
    }

    async fn delete_access_requests(&self) -> Result<usize> {
        let api: Api<AccessRequest> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(ACCESS_REQUEST_LABEL))
            .await
            .context("listing access requests")?;
        let mut deleted = 0;
        for ar in list.items.iter() {
            let (Some(ns), Some(name)) = (ar.metadata.namespace.as_deref(), ar.metadata.name.as_deref()) else { continue };
            let nsapi: Api<AccessRequest> = Api::namespaced(self.client.clone(), ns);
            match nsapi.delete(name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e).with_context(|| format!("deleting access request {}/{}", ns, name)),
            }
        }
        if deleted > 0 {
            info!(count = deleted, "access requests deleted");
        }
        Ok(deleted)
    }
}
