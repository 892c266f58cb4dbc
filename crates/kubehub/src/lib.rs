//! Classy kubehub: access to the management cluster and to managed clusters, plus the
//! watchers that turn API changes into controller events.
//!
//! The controller only sees the [`FleetApi`] and [`RemoteApi`] traits; the kube-backed
//! implementations live in [`fleet`] and [`remote`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::Result;
use classy_core::{
    Classifier, ClassifierReport, ClassifierStatus, ClusterRef, ControlPlaneEndpoint, ManagedCluster,
    CLASSIFIER_NAME_LABEL, PAUSED_ANNOTATION, REPORT_CLUSTER_LABEL,
};
use kube::core::DynamicObject;

pub mod fleet;
pub mod remote;
pub mod watch;

pub use fleet::KubeFleetApi;
pub use remote::KubeRemoteApi;
pub use watch::{spawn_watchers, FleetEvent};

/// Which reports an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportSelector {
    /// Every report of one classifier.
    Classifier(String),
    /// Mirrored reports collected from one cluster.
    Cluster(ClusterRef),
    /// Every mirrored report.
    Mirrored,
}

impl ReportSelector {
    pub fn label_selector(&self) -> String {
        match self {
            ReportSelector::Classifier(name) => format!("{}={}", CLASSIFIER_NAME_LABEL, name),
            ReportSelector::Cluster(c) => format!("{}={}", REPORT_CLUSTER_LABEL, c.label_value()),
            ReportSelector::Mirrored => REPORT_CLUSTER_LABEL.to_string(),
        }
    }

    pub fn matches(&self, report: &ClassifierReport) -> bool {
        let labels = report.metadata.labels.as_ref();
        let label = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str);
        match self {
            ReportSelector::Classifier(name) => label(CLASSIFIER_NAME_LABEL) == Some(name.as_str()),
            ReportSelector::Cluster(c) => label(REPORT_CLUSTER_LABEL) == Some(c.label_value().as_str()),
            ReportSelector::Mirrored => label(REPORT_CLUSTER_LABEL).is_some(),
        }
    }
}

/// Management cluster operations used by the reconciler and the collector.
#[async_trait::async_trait]
pub trait FleetApi: Send + Sync {
    async fn get_classifier(&self, name: &str) -> Result<Option<Classifier>>;
    async fn list_classifiers(&self) -> Result<Vec<Classifier>>;
    /// Replace the whole status subresource.
    async fn update_classifier_status(&self, name: &str, status: &ClassifierStatus) -> Result<()>;
    async fn set_classifier_finalizers(&self, name: &str, finalizers: &[String]) -> Result<()>;

    async fn get_cluster(&self, cluster: &ClusterRef) -> Result<Option<ManagedCluster>>;
    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>>;
    /// Merge `labels` into the cluster's labels. Other labels are left alone.
    async fn merge_cluster_labels(&self, cluster: &ClusterRef, labels: &BTreeMap<String, String>) -> Result<()>;

    async fn list_reports(&self, selector: &ReportSelector) -> Result<Vec<ClassifierReport>>;
    /// Create or overwrite the report named by its metadata.
    async fn upsert_report(&self, report: &ClassifierReport) -> Result<()>;
    async fn delete_report(&self, namespace: &str, name: &str) -> Result<()>;
    /// Returns how many reports were deleted.
    async fn delete_reports(&self, selector: &ReportSelector) -> Result<usize>;

    /// Create the agent access request for `cluster` unless one exists.
    async fn ensure_access_request(&self, cluster: &ClusterRef, endpoint: &ControlPlaneEndpoint) -> Result<()>;
    /// Kubeconfig granted through the access request, once the credential is ready.
    async fn access_request_kubeconfig(&self, cluster: &ClusterRef) -> Result<Option<Vec<u8>>>;
    /// Remove every agent access request. Returns how many were deleted.
    async fn delete_access_requests(&self) -> Result<usize>;
}

/// Operations executed inside a managed cluster.
#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    /// Server-side apply of the classifier (name and spec only).
    async fn apply_classifier(&self, cluster: &ClusterRef, classifier: &Classifier) -> Result<()>;
    /// Delete the classifier. Absent is success.
    async fn delete_classifier(&self, cluster: &ClusterRef, name: &str) -> Result<()>;
    async fn list_reports(&self, cluster: &ClusterRef) -> Result<Vec<ClassifierReport>>;
    /// Store the kubeconfig the agent uses to reach the management cluster.
    async fn write_agent_kubeconfig(&self, cluster: &ClusterRef, kubeconfig: &[u8]) -> Result<()>;
}

pub(crate) fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// Read the fields the controller cares about off a Cluster API `Cluster`.
pub fn managed_cluster_from(obj: &DynamicObject) -> Option<ManagedCluster> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone()?;
    let annotated = obj.metadata.annotations.as_ref().map(|a| a.contains_key(PAUSED_ANNOTATION)).unwrap_or(false);
    let spec_paused = obj.data.pointer("/spec/paused").and_then(|v| v.as_bool()).unwrap_or(false);
    let ready = obj.data.pointer("/status/controlPlaneReady").and_then(|v| v.as_bool()).unwrap_or(false);
    Some(ManagedCluster {
        cluster: ClusterRef::capi(namespace, name),
        paused: spec_paused || annotated,
        control_plane_ready: ready,
        deleting: obj.metadata.deletion_timestamp.is_some(),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
    })
}
