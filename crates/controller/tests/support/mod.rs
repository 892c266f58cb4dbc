//! In-memory collaborators for reconciler tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use classy_controller::{Reconciler, ReportMode, Settings};
use classy_core::{
    Classifier, ClassifierLabel, ClassifierReport, ClassifierReportSpec, ClassifierSpec, ClassifierStatus, ClusterRef,
    ControlPlaneEndpoint, DeployedResourceConstraint, ManagedCluster, CLASSIFIER_NAME_LABEL,
};
use classy_deployer::{
    DeployResult, Deployer, DeployerError, Options, Request, RequestHandler, RequestKey, ResultStatus,
};
use classy_kubehub::{FleetApi, RemoteApi, ReportSelector};
use classy_store::{ConsistencyIndex, KeyManager};

pub fn cluster(name: &str) -> ClusterRef {
    ClusterRef::capi("fleet", name)
}

pub fn ready(name: &str) -> ManagedCluster {
    ManagedCluster { cluster: cluster(name), control_plane_ready: true, ..Default::default() }
}

pub fn classifier(name: &str, labels: &[(&str, &str)]) -> Classifier {
    Classifier::new(
        name,
        ClassifierSpec {
            deployed_resource_constraints: vec![DeployedResourceConstraint {
                group: "cert-manager.io".into(),
                version: "v1".into(),
                kind: "Issuer".into(),
                min_count: Some(1),
                ..Default::default()
            }],
            kubernetes_version_constraints: vec![],
            classifier_labels: labels
                .iter()
                .map(|(k, v)| ClassifierLabel { key: k.to_string(), value: v.to_string() })
                .collect(),
        },
    )
}

pub fn report(classifier: &str, cluster_name: &str, matched: bool) -> ClassifierReport {
    let mut r = ClassifierReport::new(
        &format!("{}--{}", classifier, cluster_name),
        ClassifierReportSpec {
            cluster_namespace: "fleet".into(),
            cluster_name: cluster_name.into(),
            classifier_name: classifier.into(),
            matched,
        },
    );
    r.metadata.namespace = Some("fleet".into());
    r.metadata.labels = Some(BTreeMap::from([(CLASSIFIER_NAME_LABEL.to_string(), classifier.to_string())]));
    r
}

#[derive(Default)]
pub struct FleetState {
    pub classifiers: BTreeMap<String, Classifier>,
    pub clusters: Vec<ManagedCluster>,
    pub reports: Vec<ClassifierReport>,
    pub access_requests: BTreeSet<ClusterRef>,
    pub kubeconfigs: BTreeMap<ClusterRef, Vec<u8>>,
    pub status_writes: usize,
    pub label_writes: usize,
    /// Label merges still to fail before they start succeeding.
    pub failing_label_merges: usize,
}

#[derive(Default)]
pub struct FakeFleet {
    pub st: Mutex<FleetState>,
}

impl FakeFleet {
    pub fn state(&self) -> std::sync::MutexGuard<'_, FleetState> {
        self.st.lock().unwrap()
    }

    pub fn add_classifier(&self, c: Classifier) {
        let name = c.metadata.name.clone().unwrap();
        self.state().classifiers.insert(name, c);
    }

    pub fn classifier(&self, name: &str) -> Option<Classifier> {
        self.state().classifiers.get(name).cloned()
    }

    pub fn status(&self, name: &str) -> ClassifierStatus {
        self.classifier(name).and_then(|c| c.status).unwrap_or_default()
    }

    pub fn mark_deleting(&self, name: &str) {
        let mut st = self.state();
        let c = st.classifiers.get_mut(name).unwrap();
        let mut v = serde_json::to_value(&*c).unwrap();
        v["metadata"]["deletionTimestamp"] = serde_json::json!("2026-01-01T00:00:00Z");
        *c = serde_json::from_value(v).unwrap();
    }

    pub fn cluster_labels(&self, name: &str) -> BTreeMap<String, String> {
        let st = self.state();
        st.clusters.iter().find(|c| c.cluster.name == name).map(|c| c.labels.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl FleetApi for FakeFleet {
    async fn get_classifier(&self, name: &str) -> Result<Option<Classifier>> {
        Ok(self.classifier(name))
    }

    async fn list_classifiers(&self) -> Result<Vec<Classifier>> {
        Ok(self.state().classifiers.values().cloned().collect())
    }

    async fn update_classifier_status(&self, name: &str, status: &ClassifierStatus) -> Result<()> {
        let mut st = self.state();
        st.status_writes += 1;
        let c = st.classifiers.get_mut(name).ok_or_else(|| anyhow!("classifier {} not found", name))?;
        c.status = Some(status.clone());
        Ok(())
    }

    async fn set_classifier_finalizers(&self, name: &str, finalizers: &[String]) -> Result<()> {
        let mut st = self.state();
        let c = st.classifiers.get_mut(name).ok_or_else(|| anyhow!("classifier {} not found", name))?;
        c.metadata.finalizers = Some(finalizers.to_vec());
        // The API server drops a deleting object once its last finalizer is gone.
        if finalizers.is_empty() && c.metadata.deletion_timestamp.is_some() {
            st.classifiers.remove(name);
        }
        Ok(())
    }

    async fn get_cluster(&self, cluster: &ClusterRef) -> Result<Option<ManagedCluster>> {
        Ok(self.state().clusters.iter().find(|c| c.cluster.same_cluster(cluster)).cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>> {
        Ok(self.state().clusters.clone())
    }

    async fn merge_cluster_labels(&self, cluster: &ClusterRef, labels: &BTreeMap<String, String>) -> Result<()> {
        let mut st = self.state();
        if st.failing_label_merges > 0 {
            st.failing_label_merges -= 1;
            return Err(anyhow!("conflict: object has been modified"));
        }
        st.label_writes += 1;
        let c = st
            .clusters
            .iter_mut()
            .find(|c| c.cluster.same_cluster(cluster))
            .ok_or_else(|| anyhow!("cluster {} not found", cluster))?;
        c.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn list_reports(&self, selector: &ReportSelector) -> Result<Vec<ClassifierReport>> {
        Ok(self.state().reports.iter().filter(|r| selector.matches(r)).cloned().collect())
    }

    async fn upsert_report(&self, report: &ClassifierReport) -> Result<()> {
        let mut st = self.state();
        st.reports.retain(|r| !(r.metadata.name == report.metadata.name && r.metadata.namespace == report.metadata.namespace));
        st.reports.push(report.clone());
        Ok(())
    }

    async fn delete_report(&self, namespace: &str, name: &str) -> Result<()> {
        self.state()
            .reports
            .retain(|r| !(r.metadata.name.as_deref() == Some(name) && r.metadata.namespace.as_deref() == Some(namespace)));
        Ok(())
    }

    async fn delete_reports(&self, selector: &ReportSelector) -> Result<usize> {
        let mut st = self.state();
        let before = st.reports.len();
        st.reports.retain(|r| !selector.matches(r));
        Ok(before - st.reports.len())
    }

    async fn ensure_access_request(&self, cluster: &ClusterRef, _endpoint: &ControlPlaneEndpoint) -> Result<()> {
        self.state().access_requests.insert(cluster.clone());
        Ok(())
    }

    async fn access_request_kubeconfig(&self, cluster: &ClusterRef) -> Result<Option<Vec<u8>>> {
        Ok(self.state().kubeconfigs.get(cluster).cloned())
    }

    async fn delete_access_requests(&self) -> Result<usize> {
        let mut st = self.state();
        let n = st.access_requests.len();
        st.access_requests.clear();
        Ok(n)
    }
}

#[derive(Default)]
pub struct RemoteState {
    pub applied: BTreeMap<ClusterRef, BTreeSet<String>>,
    pub agent_kubeconfigs: BTreeMap<ClusterRef, Vec<u8>>,
    pub reports: BTreeMap<ClusterRef, Vec<ClassifierReport>>,
    pub failing: BTreeSet<ClusterRef>,
    pub apply_calls: usize,
}

#[derive(Default)]
pub struct FakeRemote {
    pub st: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.st.lock().unwrap()
    }

    pub fn has(&self, cluster_name: &str, classifier: &str) -> bool {
        self.state().applied.get(&cluster(cluster_name)).map(|s| s.contains(classifier)).unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl RemoteApi for FakeRemote {
    async fn apply_classifier(&self, cluster: &ClusterRef, classifier: &Classifier) -> Result<()> {
        let mut st = self.state();
        st.apply_calls += 1;
        if st.failing.contains(cluster) {
            return Err(anyhow!("connection refused by {}", cluster));
        }
        st.applied.entry(cluster.clone()).or_default().insert(classifier.metadata.name.clone().unwrap_or_default());
        Ok(())
    }

    async fn delete_classifier(&self, cluster: &ClusterRef, name: &str) -> Result<()> {
        if let Some(set) = self.state().applied.get_mut(cluster) {
            set.remove(name);
        }
        Ok(())
    }

    async fn list_reports(&self, cluster: &ClusterRef) -> Result<Vec<ClassifierReport>> {
        let st = self.state();
        if st.failing.contains(cluster) {
            return Err(anyhow!("connection refused by {}", cluster));
        }
        Ok(st.reports.get(cluster).cloned().unwrap_or_default())
    }

    async fn write_agent_kubeconfig(&self, cluster: &ClusterRef, kubeconfig: &[u8]) -> Result<()> {
        self.state().agent_kubeconfigs.insert(cluster.clone(), kubeconfig.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct DeployerState {
    pending: Vec<(RequestKey, Arc<dyn RequestHandler>, Options)>,
    results: BTreeMap<RequestKey, Result<(), String>>,
    dispatched: Vec<(RequestKey, Options)>,
}

/// Deployer that only runs handlers when the test says so.
#[derive(Default)]
pub struct ManualDeployer {
    st: Mutex<DeployerState>,
}

impl ManualDeployer {
    pub fn dispatched(&self) -> Vec<RequestKey> {
        self.st.lock().unwrap().dispatched.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn dispatched_options(&self) -> Vec<Options> {
        self.st.lock().unwrap().dispatched.iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.st.lock().unwrap().dispatched.len()
    }

    /// Run every pending request to completion.
    pub async fn run_pending(&self) {
        let pending = std::mem::take(&mut self.st.lock().unwrap().pending);
        for (key, handler, options) in pending {
            let req = Request { key: key.clone(), options };
            let res = handler.handle(&req).await.map_err(|e| format!("{:#}", e));
            self.st.lock().unwrap().results.insert(key, res);
        }
    }
}

impl Deployer for ManualDeployer {
    fn deploy(
        &self,
        key: RequestKey,
        handler: Arc<dyn RequestHandler>,
        _timeout: Duration,
        options: Options,
    ) -> Result<(), DeployerError> {
        let mut st = self.st.lock().unwrap();
        st.results.remove(&key);
        st.dispatched.push((key.clone(), options.clone()));
        st.pending.retain(|(k, _, _)| k != &key);
        st.pending.push((key, handler, options));
        Ok(())
    }

    fn is_in_progress(&self, key: &RequestKey) -> bool {
        self.st.lock().unwrap().pending.iter().any(|(k, _, _)| k == key)
    }

    fn get_result(&self, key: &RequestKey) -> DeployResult {
        let st = self.st.lock().unwrap();
        if st.pending.iter().any(|(k, _, _)| k == key) {
            return DeployResult::of(ResultStatus::InProgress);
        }
        match st.results.get(key) {
            Some(Ok(())) if key.undeploy => DeployResult::of(ResultStatus::Removed),
            Some(Ok(())) => DeployResult::of(ResultStatus::Deployed),
            Some(Err(e)) => DeployResult { status: ResultStatus::Failed, error: Some(e.clone()) },
            None => DeployResult::of(ResultStatus::Unavailable),
        }
    }

    fn cleanup_entries(&self, cluster: &ClusterRef, applicant: &str, feature_id: &str) {
        let mut st = self.st.lock().unwrap();
        let keys = [RequestKey::deploy(cluster, applicant, feature_id), RequestKey::undeploy(cluster, applicant, feature_id)];
        st.results.retain(|k, _| !keys.contains(k));
        st.pending.retain(|(k, _, _)| !keys.contains(k));
    }
}

pub struct Harness {
    pub fleet: Arc<FakeFleet>,
    pub remote: Arc<FakeRemote>,
    pub deployer: Arc<ManualDeployer>,
    pub keys: Arc<KeyManager>,
    pub index: Arc<ConsistencyIndex>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(mode: ReportMode) -> Self {
        Self::with(Arc::new(FakeFleet::default()), Arc::new(FakeRemote::default()), mode)
    }

    pub fn with(fleet: Arc<FakeFleet>, remote: Arc<FakeRemote>, mode: ReportMode) -> Self {
        let deployer = Arc::new(ManualDeployer::default());
        let keys = Arc::new(KeyManager::new());
        let index = Arc::new(ConsistencyIndex::new());
        let reconciler = Reconciler::new(
            fleet.clone(),
            remote.clone(),
            deployer.clone(),
            keys.clone(),
            index.clone(),
            Settings { mode, ..Settings::default() },
        );
        Self { fleet, remote, deployer, keys, index, reconciler }
    }

    pub fn collect() -> Self {
        Self::new(ReportMode::CollectFromManagement)
    }

    pub fn push() -> Self {
        let endpoint = ControlPlaneEndpoint::parse("https://mgmt.example.com:6443").unwrap();
        Self::new(ReportMode::AgentPush { endpoint })
    }

    pub fn with_clusters(self, names: &[&str]) -> Self {
        self.fleet.state().clusters = names.iter().map(|n| ready(n)).collect();
        self
    }
}
